//! The native wire format: `/completion`, `/infill`, `/embedding`,
//! `/rerank`, `/tokenize`, `/detokenize`, `/apply-template`, `/props`,
//! `/api/show`, `/slots`, `/lora-adapters`, `/metrics`, `/health`
//! (spec.md §6). Response shapes mirror `server-http.cpp`'s native JSON
//! one field at a time rather than reusing an OpenAI DTO.

use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

use crate::error::{ApiError, ApiResult};
use crate::http::common::{sampler_from_json, sse_stream, str_array, wait_for_all_async};
use crate::http::AppState;
use crate::lora::AdapterInfo;
use crate::response::{ResultData, TaskResult};
use crate::task::{project_fields, ChatParserParams, Task, TaskParams, TaskType};
use crate::token_buf::TokenBuf;

pub async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

pub async fn metrics(State(state): State<AppState>) -> Result<String, ApiError> {
    if !state.config.metrics {
        return Err(ApiError::NotSupported("metrics endpoint is not enabled (--metrics)".into()));
    }
    Ok(state.metrics.render_prometheus())
}

pub async fn get_props(State(state): State<AppState>) -> Json<Value> {
    let meta = state.get_meta();
    Json(json!({
        "model_path": meta.model_path,
        "total_slots": meta.total_slots,
        "chat_template": meta.chat_template,
        "has_chat_template": meta.has_chat_template,
        "modalities": {"vision": meta.modalities.vision, "audio": meta.modalities.audio},
        "default_generation_settings": meta.default_generation_settings,
        "n_ctx_per_slot": meta.n_ctx_per_slot,
        "bos_token": meta.bos_token,
        "eos_tokens": meta.eos_tokens,
    }))
}

/// `/props` POST is a no-op acknowledgement in this implementation: the
/// original lets operators override a handful of runtime display fields
/// (system prompt banner, etc.) that this server doesn't model.
pub async fn post_props() -> Json<Value> {
    Json(json!({"success": true}))
}

pub async fn api_show(State(state): State<AppState>) -> Json<Value> {
    let meta = state.get_meta();
    Json(json!({
        "license": "",
        "modelfile": "",
        "parameters": "",
        "template": meta.chat_template,
        "system": "",
        "details": {
            "format": "gguf",
            "family": meta.model_name,
            "parameter_size": "",
            "quantization_level": "",
        },
    }))
}

fn prompts_from_value(v: &Value) -> Vec<String> {
    match v {
        Value::String(s) => vec![s.clone()],
        Value::Array(items) => items.iter().filter_map(|i| i.as_str().map(str::to_string)).collect(),
        _ => Vec::new(),
    }
}

fn common_task_params(state: &AppState, v: &Value, response_type: crate::task::ResponseType) -> ApiResult<TaskParams> {
    let mut params = TaskParams { response_type, ..Default::default() };
    params.stream = v.get("stream").and_then(|x| x.as_bool()).unwrap_or(false);
    params.include_usage = v.get("stream_options").and_then(|o| o.get("include_usage")).and_then(|x| x.as_bool()).unwrap_or(false);
    params.cache_prompt = v.get("cache_prompt").and_then(|x| x.as_bool()).unwrap_or(true);
    params.return_tokens = v.get("return_tokens").and_then(|x| x.as_bool()).unwrap_or(false);
    params.return_progress = v.get("return_progress").and_then(|x| x.as_bool()).unwrap_or(false);
    params.n_keep = v.get("n_keep").and_then(|x| x.as_i64()).unwrap_or(0) as i32;
    params.n_discard = v.get("n_discard").and_then(|x| x.as_i64()).unwrap_or(0) as i32;
    params.n_predict = v
        .get("n_predict")
        .or_else(|| v.get("max_tokens"))
        .or_else(|| v.get("max_completion_tokens"))
        .and_then(|x| x.as_i64())
        .unwrap_or(-1) as i32;
    params.n_indent = v.get("n_indent").and_then(|x| x.as_i64()).unwrap_or(0) as i32;
    params.n_cmpl = v.get("n_cmpl").or_else(|| v.get("n")).and_then(|x| x.as_i64()).unwrap_or(1).max(1) as i32;
    if params.n_cmpl as u32 > state.config.n_parallel {
        return Err(ApiError::InvalidRequest(format!(
            "n_cmpl ({}) exceeds the number of parallel slots ({})",
            params.n_cmpl, state.config.n_parallel
        )));
    }
    params.n_cache_reuse = v.get("n_cache_reuse").and_then(|x| x.as_i64()).unwrap_or(0) as i32;
    params.t_max_predict_ms = v.get("t_max_predict_ms").and_then(|x| x.as_i64()).unwrap_or(0);
    params.lora = v
        .get("lora")
        .and_then(|x| x.as_array())
        .map(|a| {
            a.iter()
                .filter_map(|l| Some((l.get("id")?.as_str()?.to_string(), l.get("scale").and_then(|s| s.as_f64()).unwrap_or(1.0) as f32)))
                .collect()
        })
        .unwrap_or_default();
    params.antiprompt = str_array(v, "stop");
    params.response_fields = str_array(v, "response_fields");
    params.timings_per_token = v.get("timings_per_token").and_then(|x| x.as_bool()).unwrap_or(false);
    params.post_sampling_probs = v.get("post_sampling_probs").and_then(|x| x.as_bool()).unwrap_or(false);
    params.sampling = sampler_from_json(v, &params.sampling)?;
    if let Some(nprobs) = v.get("logprobs").and_then(|x| x.as_i64()) {
        params.sampling.n_probs = nprobs as i32;
    }
    if let Some(spec) = v.get("speculative") {
        if let Some(n_min) = spec.get("n_min").and_then(|x| x.as_u64()) {
            params.speculative.n_min = n_min as usize;
        }
        if let Some(n_max) = spec.get("n_max").and_then(|x| x.as_u64()) {
            params.speculative.n_max = n_max as usize;
        }
        if let Some(p_min) = spec.get("p_min").and_then(|x| x.as_f64()) {
            params.speculative.p_min = p_min as f32;
        }
    }
    params.embd_normalize = v.get("embd_normalize").and_then(|x| x.as_i64()).unwrap_or(2) as i32;
    params.verbose = v.get("verbose").and_then(|x| x.as_bool()).unwrap_or(false);
    params.chat_parser_params = ChatParserParams {
        format: Default::default(),
        reasoning_format: Default::default(),
        reasoning_in_content: v.get("reasoning_in_content").and_then(|x| x.as_bool()).unwrap_or(false),
        thinking_forced_open: v.get("thinking_forced_open").and_then(|x| x.as_bool()).unwrap_or(false),
        parse_tool_calls: v.get("parse_tool_calls").and_then(|x| x.as_bool()).unwrap_or(false),
    };
    Ok(params)
}

/// Builds one `Task::Completion` per prompt entry times `n_cmpl`, in
/// `(prompt_index, copy_index)` order — `index` on each posted task is
/// reassigned by `ResponseReader::post_tasks`, so this order is only what
/// determines which prompt a given reply comes back labeled as.
fn build_completion_tasks(state: &AppState, prompts: &[String], params: &TaskParams) -> ApiResult<Vec<Task>> {
    let mut tasks = Vec::new();
    for prompt in prompts {
        let ids = state
            .backend
            .tokenize(prompt, true, true)
            .map_err(|e| ApiError::InvalidRequest(format!("tokenize failed: {e}")))?;
        let tokens = TokenBuf::from_ids(ids);
        for _ in 0..params.n_cmpl.max(1) {
            tasks.push(Task::new(TaskType::Completion, params.clone(), tokens.clone()));
        }
    }
    Ok(tasks)
}

pub async fn completion(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    match completion_impl(state, body).await {
        Ok(r) => r,
        Err(e) => e.into_response(),
    }
}

async fn completion_impl(state: AppState, body: Value) -> ApiResult<Response> {
    let prompts = prompts_from_value(body.get("prompt").unwrap_or(&Value::Null));
    if prompts.is_empty() {
        return Err(ApiError::InvalidRequest("missing or empty `prompt`".into()));
    }
    let params = common_task_params(&state, &body, crate::task::ResponseType::Native)?;
    let tasks = build_completion_tasks(&state, &prompts, &params)?;
    let stream = params.stream;

    let mut reader = state.get_response_reader();
    reader.post_tasks(tasks, false);

    if stream {
        Ok(sse_stream(reader, |item| match item {
            Ok(result) => Some(cmpl_sse_event(result)),
            Err(err) => Some(axum::response::sse::Event::default().data(err.envelope().to_string())),
        })
        .into_response())
    } else {
        let results = wait_for_all_async(reader).await?;
        let bodies: Vec<Value> = results.into_iter().map(native_cmpl_json).collect();
        let mut out = if bodies.len() == 1 { bodies.into_iter().next().unwrap() } else { Value::Array(bodies) };
        project_fields(&mut out, &params.response_fields);
        Ok(Json(out).into_response())
    }
}

fn cmpl_sse_event(result: TaskResult) -> axum::response::sse::Event {
    let value = native_cmpl_json(result);
    axum::response::sse::Event::default().data(value.to_string())
}

fn native_cmpl_json(result: TaskResult) -> Value {
    match result.data {
        ResultData::CmplPartial(c) | ResultData::CmplFinal(c) => serde_json::to_value(c).unwrap_or(Value::Null),
        ResultData::Error(e) => e.envelope(),
        _ => Value::Null,
    }
}

pub async fn infill(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    match infill_impl(state, body).await {
        Ok(r) => r,
        Err(e) => e.into_response(),
    }
}

async fn infill_impl(state: AppState, body: Value) -> ApiResult<Response> {
    let vocab = state.backend.vocab();
    if vocab.fim_pre.is_none() || vocab.fim_suf.is_none() || vocab.fim_mid.is_none() {
        return Err(ApiError::NotSupported("model has no FIM tokens".into()));
    }
    let prefix = body.get("input_prefix").and_then(|x| x.as_str()).unwrap_or("");
    let suffix = body.get("input_suffix").and_then(|x| x.as_str()).unwrap_or("");
    let mut ids = vec![vocab.fim_pre.unwrap()];
    ids.extend(state.backend.tokenize(prefix, false, false).map_err(|e| ApiError::InvalidRequest(e.to_string()))?);
    ids.push(vocab.fim_suf.unwrap());
    ids.extend(state.backend.tokenize(suffix, false, false).map_err(|e| ApiError::InvalidRequest(e.to_string()))?);
    ids.push(vocab.fim_mid.unwrap());

    let params = common_task_params(&state, &body, crate::task::ResponseType::Native)?;
    let stream = params.stream;
    let tokens = TokenBuf::from_ids(ids);
    let tasks: Vec<Task> = (0..params.n_cmpl.max(1)).map(|_| Task::new(TaskType::Infill, params.clone(), tokens.clone())).collect();

    let mut reader = state.get_response_reader();
    reader.post_tasks(tasks, false);

    if stream {
        Ok(sse_stream(reader, |item| match item {
            Ok(result) => Some(cmpl_sse_event(result)),
            Err(err) => Some(axum::response::sse::Event::default().data(err.envelope().to_string())),
        })
        .into_response())
    } else {
        let results = wait_for_all_async(reader).await?;
        let bodies: Vec<Value> = results.into_iter().map(native_cmpl_json).collect();
        let out = if bodies.len() == 1 { bodies.into_iter().next().unwrap() } else { Value::Array(bodies) };
        Ok(Json(out).into_response())
    }
}

pub async fn embedding(State(state): State<AppState>, Json(body): Json<Value>) -> Result<Json<Value>, ApiError> {
    if !state.config.embeddings {
        return Err(ApiError::NotSupported("embeddings endpoint is not enabled (--embeddings)".into()));
    }
    let inputs = prompts_from_value(body.get("content").or_else(|| body.get("input")).unwrap_or(&Value::Null));
    if inputs.is_empty() {
        return Err(ApiError::InvalidRequest("missing or empty `content`/`input`".into()));
    }
    let mut params = TaskParams { response_type: crate::task::ResponseType::Native, ..Default::default() };
    params.embd_normalize = body.get("embd_normalize").and_then(|x| x.as_i64()).unwrap_or(2) as i32;

    let mut tasks = Vec::new();
    for input in &inputs {
        let ids = state.backend.tokenize(input, true, true).map_err(|e| ApiError::InvalidRequest(e.to_string()))?;
        tasks.push(Task::new(TaskType::Embedding, params.clone(), TokenBuf::from_ids(ids)));
    }

    let mut reader = state.get_response_reader();
    reader.post_tasks(tasks, false);
    let results = wait_for_all_async(reader).await?;
    let out: Vec<Value> = results
        .into_iter()
        .enumerate()
        .map(|(i, r)| match r.data {
            ResultData::Embd(e) => json!({"index": i, "embedding": e.embedding}),
            ResultData::Error(e) => e.envelope(),
            _ => Value::Null,
        })
        .collect();
    Ok(Json(json!(out)))
}

pub async fn rerank(State(state): State<AppState>, Json(body): Json<Value>) -> Result<Json<Value>, ApiError> {
    if !state.config.reranking {
        return Err(ApiError::NotSupported("reranking endpoint is not enabled (--reranking)".into()));
    }
    let query = body.get("query").and_then(|x| x.as_str()).ok_or_else(|| ApiError::InvalidRequest("missing `query`".into()))?;
    let documents = prompts_from_value(body.get("documents").or_else(|| body.get("texts")).unwrap_or(&Value::Null));
    if documents.is_empty() {
        return Err(ApiError::InvalidRequest("missing or empty `documents`".into()));
    }
    let top_n = body.get("top_n").and_then(|x| x.as_u64()).map(|n| n as usize);

    let query_ids = state.backend.tokenize(query, true, true).map_err(|e| ApiError::InvalidRequest(e.to_string()))?;
    let mut task = Task::new(
        TaskType::Rerank,
        TaskParams { response_type: crate::task::ResponseType::Native, ..Default::default() },
        TokenBuf::from_ids(query_ids),
    );
    for doc in &documents {
        let ids = state.backend.tokenize(doc, true, true).map_err(|e| ApiError::InvalidRequest(e.to_string()))?;
        task.rerank_documents.push(TokenBuf::from_ids(ids));
    }

    let mut reader = state.get_response_reader();
    reader.post_tasks(vec![task], false);
    let results = wait_for_all_async(reader).await?;
    let mut scored: Vec<Value> = results
        .into_iter()
        .enumerate()
        .map(|(i, r)| match r.data {
            ResultData::Rerank(rr) => json!({"index": i, "relevance_score": rr.score}),
            ResultData::Error(e) => e.envelope(),
            _ => Value::Null,
        })
        .collect();
    if let Some(n) = top_n {
        scored.truncate(n);
    }
    Ok(Json(json!({"results": scored})))
}

pub async fn tokenize(State(state): State<AppState>, Json(body): Json<Value>) -> Result<Json<Value>, ApiError> {
    let content = body.get("content").and_then(|x| x.as_str()).ok_or_else(|| ApiError::InvalidRequest("missing `content`".into()))?;
    let add_special = body.get("add_special").and_then(|x| x.as_bool()).unwrap_or(false);
    let parse_special = body.get("parse_special").and_then(|x| x.as_bool()).unwrap_or(true);
    let with_pieces = body.get("with_pieces").and_then(|x| x.as_bool()).unwrap_or(false);
    let ids = state
        .backend
        .tokenize(content, add_special, parse_special)
        .map_err(|e| ApiError::InvalidRequest(e.to_string()))?;
    if with_pieces {
        let pieces: Vec<Value> = ids
            .iter()
            .map(|&id| {
                let piece = state.backend.token_to_piece(id, true).map(|b| String::from_utf8_lossy(&b).into_owned()).unwrap_or_default();
                json!({"id": id, "piece": piece})
            })
            .collect();
        Ok(Json(json!({"tokens": pieces})))
    } else {
        Ok(Json(json!({"tokens": ids})))
    }
}

pub async fn detokenize(State(state): State<AppState>, Json(body): Json<Value>) -> Result<Json<Value>, ApiError> {
    let ids: Vec<i32> = body
        .get("tokens")
        .and_then(|x| x.as_array())
        .ok_or_else(|| ApiError::InvalidRequest("missing `tokens`".into()))?
        .iter()
        .filter_map(|t| t.as_i64().map(|n| n as i32))
        .collect();
    let content = state.backend.detokenize(&ids, true).map_err(|e| ApiError::InvalidRequest(e.to_string()))?;
    Ok(Json(json!({"content": content})))
}

pub async fn apply_template(State(state): State<AppState>, Json(body): Json<Value>) -> Result<Json<Value>, ApiError> {
    let messages = body.get("messages").ok_or_else(|| ApiError::InvalidRequest("missing `messages`".into()))?;
    let messages_json = serde_json::to_string(messages).unwrap_or_default();
    let tools_json = body.get("tools").map(|t| t.to_string());
    let add_generation_prompt = body.get("add_generation_prompt").and_then(|x| x.as_bool()).unwrap_or(true);
    let prompt = state
        .backend
        .apply_chat_template(&messages_json, tools_json.as_deref(), add_generation_prompt)
        .map_err(|e| ApiError::InvalidRequest(format!("apply_chat_template: {e}")))?;
    Ok(Json(json!({"prompt": prompt})))
}

pub async fn get_lora(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let mut task = Task::control(TaskType::GetLora);
    task.index = 0;
    let mut reader = state.get_response_reader();
    reader.post_tasks(vec![task], true);
    let results = wait_for_all_async(reader).await?;
    let adapters: Vec<AdapterInfo> = results
        .into_iter()
        .find_map(|r| match r.data {
            ResultData::GetLora(v) => Some(v),
            _ => None,
        })
        .unwrap_or_default();
    Ok(Json(serde_json::to_value(adapters).unwrap_or(Value::Array(vec![]))))
}

pub async fn post_lora(State(state): State<AppState>, Json(body): Json<Value>) -> Result<Json<Value>, ApiError> {
    let requested: HashMap<String, f32> = body
        .as_array()
        .ok_or_else(|| ApiError::InvalidRequest("body must be an array of {id, scale}".into()))?
        .iter()
        .filter_map(|e| Some((e.get("id")?.as_str()?.to_string(), e.get("scale").and_then(|s| s.as_f64()).unwrap_or(1.0) as f32)))
        .collect();
    let mut task = Task::control(TaskType::SetLora);
    task.lora_set = Some(requested.into_iter().collect());
    let mut reader = state.get_response_reader();
    reader.post_tasks(vec![task], true);
    wait_for_all_async(reader).await?;
    Ok(Json(json!({"success": true})))
}

pub async fn slots_info(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    if !state.config.slots_endpoint {
        return Err(ApiError::NotSupported("the /slots endpoint is disabled (--slots-endpoint)".into()));
    }
    let mut task = Task::control(TaskType::SlotsInfo);
    task.index = 0;
    let mut reader = state.get_response_reader();
    reader.post_tasks(vec![task], true);
    let results = wait_for_all_async(reader).await?;
    let infos = results.into_iter().find_map(|r| match r.data {
        ResultData::SlotsInfo(v) => Some(v),
        _ => None,
    });
    Ok(Json(serde_json::to_value(infos.unwrap_or_default()).unwrap_or(Value::Array(vec![]))))
}

#[derive(serde::Deserialize)]
pub struct SlotActionQuery {
    action: String,
}

pub async fn slots_action(
    State(state): State<AppState>,
    Path(id_slot): Path<i64>,
    Query(q): Query<SlotActionQuery>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let Some(dir) = &state.config.slot_save_path else {
        return Err(ApiError::NotSupported("slot save/restore is disabled (--slot-save-path)".into()));
    };
    let _ = dir;
    let filename = body.get("filename").and_then(|x| x.as_str()).map(str::to_string);

    let kind = match q.action.as_str() {
        "save" => TaskType::SlotSave,
        "restore" => TaskType::SlotRestore,
        "erase" => TaskType::SlotErase,
        other => return Err(ApiError::InvalidRequest(format!("unknown action: {other}"))),
    };
    if kind != TaskType::SlotErase && filename.is_none() {
        return Err(ApiError::InvalidRequest("missing `filename`".into()));
    }

    let mut task = Task::control(kind);
    task.id_slot = id_slot;
    task.slot_save_filename = filename;
    let mut reader = state.get_response_reader();
    reader.post_tasks(vec![task], true);
    let results = wait_for_all_async(reader).await?;
    let result = results.into_iter().next().ok_or_else(|| ApiError::Server("no response from scheduler".into()))?;
    match result.data {
        ResultData::SlotSaveLoad(r) => Ok(Json(json!({
            "id_slot": r.id_slot, "filename": r.filename, "n_saved": r.n_tokens, "n_restored": r.n_tokens,
            "n_bytes": r.n_bytes, "timings": {"save_ms": r.t_ms, "restore_ms": r.t_ms},
        }))),
        ResultData::SlotErase(r) => Ok(Json(json!({"id_slot": r.id_slot, "n_erased": r.n_erased}))),
        ResultData::Error(e) => Err(e),
        _ => Err(ApiError::Server("unexpected response shape".into())),
    }
}

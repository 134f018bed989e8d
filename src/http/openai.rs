//! OpenAI-compatible surfaces: legacy Completions, Chat Completions (also
//! serving `/api/chat`'s Ollama-shaped body), the Responses subset, and
//! Embeddings, plus the `/models`/`/v1/models`/`/api/tags` listings
//! (spec.md §6, SPEC_FULL.md §16).

use axum::extract::State;
use axum::response::sse::Event;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

use crate::chat_parser::format::ChatFormat;
use crate::error::{ApiError, ApiResult};
use crate::http::common::{extract_multimodal_content, sampler_from_json, sse_stream, str_array, wait_for_all_async};
use crate::http::AppState;
use crate::response::{CmplResult, ResultData, StopType, TaskResult};
use crate::task::{ChatParserParams, ResponseType, Task, TaskParams, TaskType};
use crate::token_buf::TokenBuf;

fn chat_format_from_name(name: &str) -> ChatFormat {
    match name {
        "hermes-2-pro" | "hermes2pro" => ChatFormat::Hermes2Pro,
        "llama-3.x" | "llama3" => ChatFormat::Llama3x,
        "deepseek-r1" => ChatFormat::DeepSeekR1,
        "deepseek-v3.1" => ChatFormat::DeepSeekV3_1,
        "gpt-oss" | "gptoss" => ChatFormat::GptOss,
        "qwen3-coder-xml" => ChatFormat::Qwen3CoderXml,
        "command-r7b" => ChatFormat::CommandR7B,
        "granite" => ChatFormat::Granite,
        "mistral-nemo" => ChatFormat::MistralNemo,
        "magistral" => ChatFormat::Magistral,
        "nemotron-v2" => ChatFormat::NemotronV2,
        "seed-oss" => ChatFormat::SeedOss,
        "apertus" => ChatFormat::Apertus,
        "lfm2" => ChatFormat::Lfm2,
        "minimax-m2" => ChatFormat::MiniMaxM2,
        "glm-4.5" => ChatFormat::Glm4_5,
        "glm-4.6" => ChatFormat::Glm4_6,
        "kimi-k2" => ChatFormat::KimiK2,
        _ => ChatFormat::Generic,
    }
}

fn reasoning_format_from_name(name: Option<&str>) -> crate::task::ReasoningFormat {
    match name {
        Some("deepseek") => crate::task::ReasoningFormat::DeepSeek,
        Some("none") => crate::task::ReasoningFormat::None,
        _ => crate::task::ReasoningFormat::Auto,
    }
}

fn build_chat_params(state: &AppState, v: &Value, response_type: ResponseType) -> ApiResult<TaskParams> {
    let mut params = TaskParams { response_type, ..Default::default() };
    params.stream = v.get("stream").and_then(|x| x.as_bool()).unwrap_or(false);
    params.include_usage = v.get("stream_options").and_then(|o| o.get("include_usage")).and_then(|x| x.as_bool()).unwrap_or(false);
    params.n_predict = v.get("max_completion_tokens").or_else(|| v.get("max_tokens")).and_then(|x| x.as_i64()).unwrap_or(-1) as i32;
    params.n_cmpl = v.get("n").and_then(|x| x.as_i64()).unwrap_or(1).max(1) as i32;
    if params.n_cmpl as u32 > state.config.n_parallel {
        return Err(ApiError::InvalidRequest(format!(
            "n ({}) exceeds the number of parallel slots ({})",
            params.n_cmpl, state.config.n_parallel
        )));
    }
    params.antiprompt = str_array(v, "stop");
    params.sampling = sampler_from_json(v, &params.sampling)?;
    if let Some(true) = v.get("logprobs").and_then(|x| x.as_bool()) {
        params.sampling.n_probs = v.get("top_logprobs").and_then(|x| x.as_i64()).unwrap_or(1) as i32;
    }
    params.oaicompat_model = v.get("model").and_then(|x| x.as_str()).unwrap_or_default().to_string();
    params.oaicompat_cmpl_id = format!("chatcmpl-{}", uuid::Uuid::new_v4().simple());
    let chat_format = v.get("chat_format").and_then(|x| x.as_str()).map(chat_format_from_name).unwrap_or_default();
    params.chat_parser_params = ChatParserParams {
        format: chat_format,
        reasoning_format: reasoning_format_from_name(v.get("reasoning_format").and_then(|x| x.as_str())),
        reasoning_in_content: v.get("reasoning_in_content").and_then(|x| x.as_bool()).unwrap_or(false),
        thinking_forced_open: v.get("thinking_forced_open").and_then(|x| x.as_bool()).unwrap_or(false),
        parse_tool_calls: v.get("tools").is_some(),
    };
    Ok(params)
}

fn build_chat_prompt(state: &AppState, v: &Value) -> ApiResult<TokenBuf> {
    let messages = v.get("messages").ok_or_else(|| ApiError::InvalidRequest("missing `messages`".into()))?;
    let (messages, media) = extract_multimodal_content(messages);
    let messages_json = serde_json::to_string(&messages).unwrap_or_default();
    let tools_json = v.get("tools").map(|t| t.to_string());
    let prompt = state
        .backend
        .apply_chat_template(&messages_json, tools_json.as_deref(), true)
        .map_err(|e| ApiError::InvalidRequest(format!("apply_chat_template: {e}")))?;
    let ids = state.backend.tokenize(&prompt, false, true).map_err(|e| ApiError::InvalidRequest(e.to_string()))?;

    // The chat-template binding has no multimodal placeholder markers (see
    // DESIGN.md), so encoded media chunks land after the rendered text
    // rather than at their original in-conversation position — the
    // scheduler still processes them through `mtmd.process_chunk` before
    // generation starts (spec.md §4.4 step 4), they just can't be
    // interleaved mid-template without template cooperation this binding
    // lacks.
    let mut buf = TokenBuf::new(!media.is_empty());
    for id in ids {
        buf.push_text(id as i64);
    }
    for chunk in media {
        buf.push_media(chunk);
    }
    Ok(buf)
}

fn finish_reason(c: &CmplResult) -> Option<&'static str> {
    match c.stop {
        None => None,
        Some(StopType::None) => None,
        Some(StopType::Eos) | Some(StopType::Word) => Some("stop"),
        Some(StopType::Limit) => Some("length"),
    }
}

pub async fn chat_completions(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    match chat_completions_impl(state, body).await {
        Ok(r) => r,
        Err(e) => e.into_response(),
    }
}

async fn chat_completions_impl(state: AppState, body: Value) -> ApiResult<Response> {
    let params = build_chat_params(&state, &body, ResponseType::OaiChat)?;
    let tokens = build_chat_prompt(&state, &body)?;
    let stream = params.stream;
    let model = params.oaicompat_model.clone();
    let id = params.oaicompat_cmpl_id.clone();
    let created = crate::http::common_unix_time();

    let tasks: Vec<Task> = (0..params.n_cmpl.max(1)).map(|_| Task::new(TaskType::Completion, params.clone(), tokens.clone())).collect();
    let mut reader = state.get_response_reader();
    reader.post_tasks(tasks, false);

    if stream {
        Ok(sse_stream(reader, move |item| match item {
            Ok(result) => chat_chunk_event(&id, &model, created, result),
            Err(err) => Some(Event::default().data(err.envelope().to_string())),
        })
        .into_response())
    } else {
        let results = wait_for_all_async(reader).await?;
        let choices: Vec<Value> = results
            .into_iter()
            .map(|r| match r.data {
                ResultData::CmplFinal(c) => {
                    let msg = c.chat_msg.clone().unwrap_or_default();
                    json!({
                        "index": r.index,
                        "message": {
                            "role": msg.role,
                            "content": if msg.content.is_empty() { Value::Null } else { json!(msg.content) },
                            "reasoning_content": if msg.reasoning_content.is_empty() { Value::Null } else { json!(msg.reasoning_content) },
                            "tool_calls": tool_calls_json(&msg),
                        },
                        "finish_reason": finish_reason(&c),
                    })
                }
                ResultData::Error(e) => e.envelope(),
                _ => Value::Null,
            })
            .collect();
        Ok(Json(json!({
            "id": id, "object": "chat.completion", "created": created, "model": model,
            "choices": choices,
        }))
        .into_response())
    }
}

fn tool_calls_json(msg: &crate::chat_parser::ChatMsg) -> Value {
    if msg.tool_calls.is_empty() {
        return Value::Null;
    }
    json!(msg
        .tool_calls
        .iter()
        .enumerate()
        .map(|(i, tc)| json!({
            "id": tc.id,
            "type": "function",
            "function": {"name": tc.name, "arguments": tc.arguments},
            "index": i,
        }))
        .collect::<Vec<_>>())
}

fn chat_chunk_event(id: &str, model: &str, created: i64, result: TaskResult) -> Option<Event> {
    let (delta, finish) = match &result.data {
        ResultData::CmplPartial(c) => {
            let diff = c.chat_diff.clone().unwrap_or_default();
            let mut delta = json!({});
            if !diff.content_delta.is_empty() {
                delta["content"] = json!(diff.content_delta);
            }
            if !diff.reasoning_content_delta.is_empty() {
                delta["reasoning_content"] = json!(diff.reasoning_content_delta);
            }
            if !diff.tool_call_deltas.is_empty() {
                delta["tool_calls"] = json!(diff
                    .tool_call_deltas
                    .iter()
                    .map(|d| {
                        let mut v = json!({"index": d.index, "function": {"arguments": d.arguments_delta}});
                        if let Some(name) = &d.name {
                            v["function"]["name"] = json!(name);
                        }
                        if let Some(id) = &d.id {
                            v["id"] = json!(id);
                            v["type"] = json!("function");
                        }
                        v
                    })
                    .collect::<Vec<_>>());
            }
            (delta, None)
        }
        ResultData::CmplFinal(c) => (json!({}), finish_reason(c)),
        ResultData::Error(e) => return Some(Event::default().data(e.envelope().to_string())),
        _ => return None,
    };
    let chunk = json!({
        "id": id, "object": "chat.completion.chunk", "created": created, "model": model,
        "choices": [{"index": result.index, "delta": delta, "finish_reason": finish}],
    });
    Some(Event::default().data(chunk.to_string()))
}

pub async fn completions(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    match completions_impl(state, body).await {
        Ok(r) => r,
        Err(e) => e.into_response(),
    }
}

async fn completions_impl(state: AppState, body: Value) -> ApiResult<Response> {
    let prompt = body.get("prompt").and_then(|x| x.as_str()).ok_or_else(|| ApiError::InvalidRequest("missing `prompt`".into()))?;
    let mut params = TaskParams { response_type: ResponseType::OaiCmpl, ..Default::default() };
    params.stream = body.get("stream").and_then(|x| x.as_bool()).unwrap_or(false);
    params.n_predict = body.get("max_tokens").and_then(|x| x.as_i64()).unwrap_or(-1) as i32;
    params.n_cmpl = body.get("n").and_then(|x| x.as_i64()).unwrap_or(1).max(1) as i32;
    params.antiprompt = str_array(&body, "stop");
    params.sampling = sampler_from_json(&body, &params.sampling)?;
    params.oaicompat_model = body.get("model").and_then(|x| x.as_str()).unwrap_or_default().to_string();
    let id = format!("cmpl-{}", uuid::Uuid::new_v4().simple());
    let created = crate::http::common_unix_time();
    let model = params.oaicompat_model.clone();
    let stream = params.stream;

    let ids = state.backend.tokenize(prompt, true, true).map_err(|e| ApiError::InvalidRequest(e.to_string()))?;
    let tokens = TokenBuf::from_ids(ids);
    let tasks: Vec<Task> = (0..params.n_cmpl.max(1)).map(|_| Task::new(TaskType::Completion, params.clone(), tokens.clone())).collect();
    let mut reader = state.get_response_reader();
    reader.post_tasks(tasks, false);

    if stream {
        Ok(sse_stream(reader, move |item| match item {
            Ok(TaskResult { index, data: ResultData::CmplPartial(c), .. }) => Some(Event::default().data(
                json!({"id": id, "object": "text_completion", "created": created, "model": model,
                    "choices": [{"index": index, "text": c.content, "finish_reason": Value::Null}]})
                .to_string(),
            )),
            Ok(TaskResult { index, data: ResultData::CmplFinal(c), .. }) => Some(Event::default().data(
                json!({"id": id, "object": "text_completion", "created": created, "model": model,
                    "choices": [{"index": index, "text": "", "finish_reason": finish_reason(&c)}]})
                .to_string(),
            )),
            Ok(_) => None,
            Err(err) => Some(Event::default().data(err.envelope().to_string())),
        })
        .into_response())
    } else {
        let results = wait_for_all_async(reader).await?;
        let choices: Vec<Value> = results
            .into_iter()
            .map(|r| match r.data {
                ResultData::CmplFinal(c) => json!({"index": r.index, "text": c.content, "finish_reason": finish_reason(&c)}),
                ResultData::Error(e) => e.envelope(),
                _ => Value::Null,
            })
            .collect();
        Ok(Json(json!({"id": id, "object": "text_completion", "created": created, "model": model, "choices": choices})).into_response())
    }
}

pub async fn responses(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    match responses_impl(state, body).await {
        Ok(r) => r,
        Err(e) => e.into_response(),
    }
}

/// A scoped-down `/v1/responses`: single-turn text in, text out, emitted as
/// the handful of `response.*` SSE event names clients actually parse
/// (`response.created`, `response.output_text.delta`, `response.completed`).
/// Multi-turn state persistence and the full tool-calling item graph are a
/// non-goal (spec.md §1 "durable ... storage").
async fn responses_impl(state: AppState, body: Value) -> ApiResult<Response> {
    let input = body.get("input").and_then(|x| x.as_str()).ok_or_else(|| ApiError::InvalidRequest("missing `input`".into()))?;
    let instructions = body.get("instructions").and_then(|x| x.as_str());
    let mut messages = Vec::new();
    if let Some(sys) = instructions {
        messages.push(json!({"role": "system", "content": sys}));
    }
    messages.push(json!({"role": "user", "content": input}));
    let mut synthetic = body.clone();
    synthetic["messages"] = json!(messages);

    let mut params = TaskParams { response_type: ResponseType::OaiResp, ..Default::default() };
    params.stream = body.get("stream").and_then(|x| x.as_bool()).unwrap_or(false);
    params.n_predict = body.get("max_output_tokens").and_then(|x| x.as_i64()).unwrap_or(-1) as i32;
    params.sampling = sampler_from_json(&body, &params.sampling)?;
    params.oaicompat_model = body.get("model").and_then(|x| x.as_str()).unwrap_or_default().to_string();
    let stream = params.stream;
    let id = format!("resp_{}", uuid::Uuid::new_v4().simple());
    let model = params.oaicompat_model.clone();

    let tokens = build_chat_prompt(&state, &synthetic)?;
    let mut reader = state.get_response_reader();
    reader.post_tasks(vec![Task::new(TaskType::Completion, params, tokens)], false);

    if stream {
        Ok(sse_stream(reader, move |item| match item {
            Ok(TaskResult { data: ResultData::CmplPartial(c), .. }) => {
                Some(Event::default().event("response.output_text.delta").data(json!({"delta": c.content}).to_string()))
            }
            Ok(TaskResult { data: ResultData::CmplFinal(c), .. }) => Some(
                Event::default()
                    .event("response.completed")
                    .data(json!({"response": {"id": id, "model": model, "output_text": c.content, "status": "completed"}}).to_string()),
            ),
            Ok(_) => None,
            Err(err) => Some(Event::default().event("response.error").data(err.envelope().to_string())),
        })
        .into_response())
    } else {
        let results = wait_for_all_async(reader).await?;
        let result = results.into_iter().next().ok_or_else(|| ApiError::Server("no response".into()))?;
        match result.data {
            ResultData::CmplFinal(c) => Ok(Json(json!({
                "id": id, "object": "response", "model": model, "status": "completed",
                "output_text": c.content,
                "output": [{"type": "message", "role": "assistant", "content": [{"type": "output_text", "text": c.content}]}],
            }))
            .into_response()),
            ResultData::Error(e) => Err(e),
            _ => Err(ApiError::Server("unexpected response shape".into())),
        }
    }
}

pub async fn embeddings(State(state): State<AppState>, Json(body): Json<Value>) -> Result<Json<Value>, ApiError> {
    if !state.config.embeddings {
        return Err(ApiError::NotSupported("embeddings endpoint is not enabled (--embeddings)".into()));
    }
    let inputs: Vec<String> = match body.get("input") {
        Some(Value::String(s)) => vec![s.clone()],
        Some(Value::Array(items)) => items.iter().filter_map(|i| i.as_str().map(str::to_string)).collect(),
        _ => return Err(ApiError::InvalidRequest("missing `input`".into())),
    };
    let model = body.get("model").and_then(|x| x.as_str()).unwrap_or_default().to_string();
    let mut tasks = Vec::new();
    for input in &inputs {
        let ids = state.backend.tokenize(input, true, true).map_err(|e| ApiError::InvalidRequest(e.to_string()))?;
        tasks.push(Task::new(TaskType::Embedding, TaskParams { response_type: ResponseType::OaiEmbd, ..Default::default() }, TokenBuf::from_ids(ids)));
    }
    let mut reader = state.get_response_reader();
    reader.post_tasks(tasks, false);
    let results = wait_for_all_async(reader).await?;
    let mut total_tokens = 0usize;
    let data: Vec<Value> = results
        .into_iter()
        .map(|r| match r.data {
            ResultData::Embd(e) => {
                total_tokens += e.n_tokens;
                json!({"object": "embedding", "index": r.index, "embedding": e.embedding.into_iter().next().unwrap_or_default()})
            }
            ResultData::Error(e) => e.envelope(),
            _ => Value::Null,
        })
        .collect();
    Ok(Json(json!({
        "object": "list", "data": data, "model": model,
        "usage": {"prompt_tokens": total_tokens, "total_tokens": total_tokens},
    })))
}

fn model_entry(meta: &crate::facade::MetaSnapshot) -> Value {
    json!({
        "id": meta.model_name, "object": "model", "created": crate::http::common_unix_time(),
        "owned_by": "local",
    })
}

pub async fn list_models(State(state): State<AppState>) -> Json<Value> {
    let meta = state.get_meta();
    Json(json!({"object": "list", "data": [model_entry(meta)]}))
}

pub async fn api_tags(State(state): State<AppState>) -> Json<Value> {
    let meta = state.get_meta();
    Json(json!({"models": [{"name": meta.model_name, "model": meta.model_name, "size": 0, "digest": ""}]}))
}

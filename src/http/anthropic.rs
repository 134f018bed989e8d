//! Anthropic Messages API: `/v1/messages` and `/v1/messages/count_tokens`
//! (spec.md §6). Content blocks are flattened to plain text before going
//! through the model's chat template; `image` blocks are collected as
//! `MediaChunk`s the same way `openai.rs`'s `image_url`/`input_audio` parts
//! are (spec.md §1 multimodal input, `mtmd` opaque but not excluded).
//! Tool-result/tool-use blocks remain a non-goal: this server's Anthropic
//! surface doesn't model the Messages API's tool-calling loop.

use axum::extract::State;
use axum::response::sse::Event;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

use crate::error::{ApiError, ApiResult};
use crate::http::common::{flatten_anthropic_content, sampler_from_json, sse_stream, str_array, wait_for_all_async};
use crate::http::AppState;
use crate::media::MediaChunk;
use crate::response::{ResultData, StopType, TaskResult};
use crate::task::{ResponseType, Task, TaskParams, TaskType};
use crate::token_buf::TokenBuf;

fn build_oai_messages(body: &Value, media: &mut Vec<MediaChunk>) -> ApiResult<Value> {
    let mut out = Vec::new();
    if let Some(system) = body.get("system") {
        out.push(json!({"role": "system", "content": flatten_anthropic_content(system, media)}));
    }
    let messages = body.get("messages").and_then(|m| m.as_array()).ok_or_else(|| ApiError::InvalidRequest("missing `messages`".into()))?;
    for m in messages {
        let role = m.get("role").and_then(|r| r.as_str()).unwrap_or("user");
        let content = flatten_anthropic_content(m.get("content").unwrap_or(&Value::Null), media);
        out.push(json!({"role": role, "content": content}));
    }
    Ok(json!(out))
}

fn anthropic_stop_reason(stop: Option<StopType>) -> Option<&'static str> {
    match stop {
        None | Some(StopType::None) => None,
        Some(StopType::Eos) => Some("end_turn"),
        Some(StopType::Word) => Some("stop_sequence"),
        Some(StopType::Limit) => Some("max_tokens"),
    }
}

pub async fn messages(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    match messages_impl(state, body).await {
        Ok(r) => r,
        Err(e) => e.into_response(),
    }
}

async fn messages_impl(state: AppState, body: Value) -> ApiResult<Response> {
    let mut media = Vec::new();
    let oai_messages = build_oai_messages(&body, &mut media)?;
    let messages_json = serde_json::to_string(&oai_messages).unwrap_or_default();
    let prompt = state
        .backend
        .apply_chat_template(&messages_json, None, true)
        .map_err(|e| ApiError::InvalidRequest(format!("apply_chat_template: {e}")))?;
    let ids = state.backend.tokenize(&prompt, false, true).map_err(|e| ApiError::InvalidRequest(e.to_string()))?;
    let n_prompt_tokens = ids.len();
    let mut tokens = TokenBuf::new(!media.is_empty());
    for id in ids {
        tokens.push_text(id as i64);
    }
    for chunk in media {
        tokens.push_media(chunk);
    }

    let mut params = TaskParams { response_type: ResponseType::Anthropic, ..Default::default() };
    params.stream = body.get("stream").and_then(|x| x.as_bool()).unwrap_or(false);
    params.n_predict = body.get("max_tokens").and_then(|x| x.as_i64()).unwrap_or(-1) as i32;
    params.antiprompt = str_array(&body, "stop_sequences");
    params.sampling = sampler_from_json(&body, &params.sampling)?;
    if let Some(top_k) = body.get("top_k").and_then(|x| x.as_i64()) {
        params.sampling.top_k = top_k as i32;
    }
    let model = body.get("model").and_then(|x| x.as_str()).unwrap_or_default().to_string();
    let stream = params.stream;
    let id = format!("msg_{}", uuid::Uuid::new_v4().simple());

    let mut reader = state.get_response_reader();
    reader.post_tasks(vec![Task::new(TaskType::Completion, params, tokens)], false);

    if stream {
        let started = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        Ok(sse_stream(reader, move |item| {
            let mut first = None;
            if !started.swap(true, std::sync::atomic::Ordering::Relaxed) {
                first = Some(
                    Event::default().event("message_start").data(
                        json!({"type": "message_start", "message": {"id": id, "type": "message", "role": "assistant", "model": model, "content": [], "usage": {"input_tokens": n_prompt_tokens, "output_tokens": 0}}})
                            .to_string(),
                    ),
                );
            }
            match item {
                Ok(TaskResult { data: ResultData::CmplPartial(c), .. }) => first.or(Some(
                    Event::default()
                        .event("content_block_delta")
                        .data(json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": c.content}}).to_string()),
                )),
                Ok(TaskResult { data: ResultData::CmplFinal(c), .. }) => Some(
                    Event::default().event("message_delta").data(
                        json!({"type": "message_delta", "delta": {"stop_reason": anthropic_stop_reason(c.stop)}, "usage": {"output_tokens": c.n_decoded}})
                            .to_string(),
                    ),
                ),
                Ok(_) => first,
                Err(err) => Some(Event::default().event("error").data(err.envelope().to_string())),
            }
        })
        .into_response())
    } else {
        let results = wait_for_all_async(reader).await?;
        let result = results.into_iter().next().ok_or_else(|| ApiError::Server("no response from scheduler".into()))?;
        match result.data {
            ResultData::CmplFinal(c) => Ok(Json(json!({
                "id": id, "type": "message", "role": "assistant", "model": model,
                "content": [{"type": "text", "text": c.content}],
                "stop_reason": anthropic_stop_reason(c.stop),
                "stop_sequence": if c.stopping_word.is_empty() { Value::Null } else { json!(c.stopping_word) },
                "usage": {"input_tokens": n_prompt_tokens, "output_tokens": c.n_decoded},
            }))
            .into_response()),
            ResultData::Error(e) => Err(e),
            _ => Err(ApiError::Server("unexpected response shape".into())),
        }
    }
}

pub async fn count_tokens(State(state): State<AppState>, Json(body): Json<Value>) -> Result<Json<Value>, ApiError> {
    let mut media = Vec::new();
    let oai_messages = build_oai_messages(&body, &mut media)?;
    let messages_json = serde_json::to_string(&oai_messages).unwrap_or_default();
    let prompt = state
        .backend
        .apply_chat_template(&messages_json, None, true)
        .map_err(|e| ApiError::InvalidRequest(format!("apply_chat_template: {e}")))?;
    let ids = state.backend.tokenize(&prompt, false, true).map_err(|e| ApiError::InvalidRequest(e.to_string()))?;
    Ok(Json(json!({"input_tokens": ids.len()})))
}

//! Shared plumbing every HTTP surface module uses: JSON→`SamplerConfig`
//! parsing, prompt tokenization helpers, and the bridge from the
//! scheduler's blocking [`ResponseReader`] to an async SSE byte stream.
//!
//! The reader's `next()`/`recv()` block a real OS thread on a condvar
//! (spec.md §4.6), so every route that streams pumps it from
//! `spawn_blocking` and forwards results over an mpsc channel rather than
//! polling it directly on the tokio executor.

use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::response::sse::{Event, KeepAlive, Sse};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::Value;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;

use crate::error::ApiError;
use crate::media::{MediaChunk, MediaKind};
use crate::reader::ResponseReader;
use crate::response::TaskResult;
use crate::sampler::SamplerConfig;

/// Placeholder token counts an encoded media chunk occupies in the token
/// buffer. The real vision/audio projector (`mtmd`, opaque per spec.md §1)
/// would report exact counts per input; lacking that collaborator, this
/// binding reserves a fixed span sized the way a typical CLIP-style
/// 24x24-patch image tile or a few hundred ms of audio would tokenize.
const IMAGE_PLACEHOLDER_TOKENS: usize = 256;
const AUDIO_PLACEHOLDER_TOKENS: usize = 64;

fn decode_data_uri_or_b64(s: &str) -> Option<Vec<u8>> {
    let b64 = s.strip_prefix("data:").and_then(|rest| rest.split_once(',')).map(|(_, data)| data).unwrap_or(s);
    BASE64.decode(b64).ok()
}

/// OpenAI-shaped chat message `content` arrays
/// (`[{"type":"text","text":...}, {"type":"image_url","image_url":{"url":"data:..."}}, {"type":"input_audio","input_audio":{"data":"..."}}]`)
/// flattened to the plain-string content this binding's `apply_chat_template`
/// accepts (SPEC_FULL.md DESIGN.md note on `gg`'s template binding), with
/// every image/audio part collected as a [`MediaChunk`] in encounter order.
/// A message whose `content` is already a plain string passes through
/// untouched. Returns the rewritten messages value plus the media in
/// document order, appended to the prompt's `TokenBuf` after prefill text by
/// the caller (spec.md §3 MediaChunk, §4.1 token buffer).
pub fn extract_multimodal_content(messages: &Value) -> (Value, Vec<MediaChunk>) {
    let mut media = Vec::new();
    let mut out = messages.clone();
    if let Some(arr) = out.as_array_mut() {
        for msg in arr.iter_mut() {
            let Some(parts) = msg.get("content").and_then(|c| c.as_array()) else { continue };
            let mut text = String::new();
            for part in parts {
                match part.get("type").and_then(|t| t.as_str()) {
                    Some("text") => {
                        if let Some(t) = part.get("text").and_then(|x| x.as_str()) {
                            if !text.is_empty() {
                                text.push(' ');
                            }
                            text.push_str(t);
                        }
                    }
                    Some("image_url") => {
                        let url = part.get("image_url").and_then(|u| u.get("url")).and_then(|u| u.as_str());
                        if let Some(bytes) = url.and_then(decode_data_uri_or_b64) {
                            media.push(MediaChunk::new(MediaKind::Image, bytes, IMAGE_PLACEHOLDER_TOKENS, IMAGE_PLACEHOLDER_TOKENS));
                        }
                    }
                    Some("input_audio") => {
                        let data = part.get("input_audio").and_then(|a| a.get("data")).and_then(|d| d.as_str());
                        if let Some(bytes) = data.and_then(decode_data_uri_or_b64) {
                            media.push(MediaChunk::new(MediaKind::Audio, bytes, AUDIO_PLACEHOLDER_TOKENS, AUDIO_PLACEHOLDER_TOKENS));
                        }
                    }
                    _ => {}
                }
            }
            if let Some(obj) = msg.as_object_mut() {
                obj.insert("content".to_string(), Value::String(text));
            }
        }
    }
    (out, media)
}

/// Anthropic-shaped content blocks
/// (`[{"type":"text","text":...}, {"type":"image","source":{"type":"base64","media_type":"image/png","data":"..."}}]`),
/// same flattening as [`extract_multimodal_content`] but for the Messages
/// API's block shape (`source.data` is bare base64, never a data URI).
pub fn flatten_anthropic_content(content: &Value, media: &mut Vec<MediaChunk>) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => {
            let mut text = String::new();
            for b in blocks {
                match b.get("type").and_then(|t| t.as_str()) {
                    Some("text") => {
                        if let Some(t) = b.get("text").and_then(|t| t.as_str()) {
                            if !text.is_empty() {
                                text.push(' ');
                            }
                            text.push_str(t);
                        }
                    }
                    Some("image") => {
                        let data = b.get("source").and_then(|s| s.get("data")).and_then(|d| d.as_str());
                        if let Some(bytes) = data.and_then(decode_data_uri_or_b64) {
                            media.push(MediaChunk::new(MediaKind::Image, bytes, IMAGE_PLACEHOLDER_TOKENS, IMAGE_PLACEHOLDER_TOKENS));
                        }
                    }
                    _ => {}
                }
            }
            text
        }
        _ => String::new(),
    }
}

/// Pull `n_probs`/`logit_bias`/grammar/etc. out of a freeform JSON request
/// body, layered over the server's configured defaults.
pub fn sampler_from_json(v: &Value, defaults: &SamplerConfig) -> Result<SamplerConfig, ApiError> {
    let mut cfg = defaults.clone();
    macro_rules! num {
        ($field:ident, $key:literal) => {
            if let Some(x) = v.get($key).and_then(|x| x.as_f64()) {
                cfg.$field = x as _;
            }
        };
    }
    num!(temperature, "temperature");
    num!(top_k, "top_k");
    num!(top_p, "top_p");
    num!(min_p, "min_p");
    num!(typical_p, "typical_p");
    num!(top_n_sigma, "top_n_sigma");
    num!(xtc_probability, "xtc_probability");
    num!(xtc_threshold, "xtc_threshold");
    num!(repeat_last_n, "repeat_last_n");
    num!(repeat_penalty, "repeat_penalty");
    num!(presence_penalty, "presence_penalty");
    num!(frequency_penalty, "frequency_penalty");
    num!(dry_multiplier, "dry_multiplier");
    num!(dry_base, "dry_base");
    num!(dry_allowed_length, "dry_allowed_length");
    num!(dry_penalty_last_n, "dry_penalty_last_n");
    num!(mirostat, "mirostat");
    num!(mirostat_tau, "mirostat_tau");
    num!(mirostat_eta, "mirostat_eta");
    num!(dynatemp_range, "dynatemp_range");
    num!(dynatemp_exponent, "dynatemp_exponent");
    num!(n_probs, "n_probs");

    if let Some(seed) = v.get("seed").and_then(|x| x.as_i64()) {
        cfg.seed = if seed < 0 { None } else { Some(seed as u32) };
    }
    if let Some(mk) = v.get("min_keep").and_then(|x| x.as_u64()) {
        cfg.min_keep = mk as usize;
    }
    if let Some(samplers) = v.get("samplers").and_then(|x| x.as_array()) {
        cfg.samplers = samplers.iter().filter_map(|s| s.as_str().map(str::to_string)).collect();
    }
    if let Some(bias) = v.get("logit_bias").and_then(|x| x.as_array()) {
        cfg.logit_bias = bias
            .iter()
            .filter_map(|pair| {
                let pair = pair.as_array()?;
                let id = pair.first()?.as_i64()?;
                let b = match pair.get(1)? {
                    Value::Number(n) => n.as_f64()? as f32,
                    Value::Bool(false) => f32::NEG_INFINITY,
                    Value::String(s) if s == "false" => f32::NEG_INFINITY,
                    _ => return None,
                };
                Some((id, b))
            })
            .collect();
    }
    if let Some(g) = v.get("grammar").and_then(|x| x.as_str()) {
        cfg.grammar = Some(g.to_string());
    }
    if let Some(schema) = v.get("json_schema") {
        cfg.json_schema = Some(schema.clone());
    } else if let Some(rf) = v.get("response_format") {
        if rf.get("type").and_then(|t| t.as_str()) == Some("json_schema") {
            if let Some(schema) = rf.get("json_schema").and_then(|j| j.get("schema")) {
                cfg.json_schema = Some(schema.clone());
            }
        } else if rf.get("type").and_then(|t| t.as_str()) == Some("json_object") {
            cfg.json_schema = Some(serde_json::json!({"type": "object"}));
        }
    }
    if let Some(triggers) = v.get("grammar_triggers").and_then(|x| x.as_array()) {
        cfg.grammar_triggers = triggers
            .iter()
            .filter_map(|t| t.get("value").or(Some(t)).and_then(|x| x.as_str()).map(str::to_string))
            .collect();
    }
    if let Some(preserved) = v.get("preserved_tokens").and_then(|x| x.as_array()) {
        cfg.preserved_tokens = preserved.iter().filter_map(|t| t.as_str().map(str::to_string)).collect();
    }
    Ok(cfg)
}

pub fn str_array(v: &Value, key: &str) -> Vec<String> {
    v.get(key)
        .and_then(|x| x.as_array())
        .map(|a| a.iter().filter_map(|s| s.as_str().map(str::to_string)).collect())
        .unwrap_or_default()
}

/// Drive `reader` to completion on a blocking thread, forwarding every
/// result (partial or final) over a bounded channel as it arrives. The
/// stream's `Drop` (on client disconnect) drops the channel receiver, which
/// in turn drops the `mpsc::Sender`; `tx.blocking_send` then starts failing
/// and this loop calls `reader.stop()` itself, which posts the `Cancel`
/// tasks (`ResponseReader::Drop` only removes the waiting ids — it never
/// posts `Cancel` on its own, see `reader.rs`).
fn spawn_reader(mut reader: ResponseReader) -> tokio::sync::mpsc::Receiver<Result<TaskResult, ApiError>> {
    let (tx, rx) = tokio::sync::mpsc::channel(32);
    tokio::task::spawn_blocking(move || loop {
        match reader.next(&|| false) {
            Ok(None) => break,
            Ok(Some(result)) => {
                if tx.blocking_send(Ok(result)).is_err() {
                    reader.stop();
                    break;
                }
            }
            Err(err) => {
                let _ = tx.blocking_send(Err(err));
                break;
            }
        }
    });
    rx
}

/// Render a streaming request as Server-Sent Events, formatting each result
/// (and the terminal error, if any) through `format_event`. `format_event`
/// returning `None` for a given result means "nothing to emit yet" (no-op
/// partials from formats with no delta, e.g. an embedding reader that never
/// streams).
pub fn sse_stream<F>(reader: ResponseReader, mut format_event: F) -> Sse<impl Stream<Item = Result<Event, Infallible>>>
where
    F: FnMut(Result<TaskResult, ApiError>) -> Option<Event> + Send + 'static,
{
    let mut rx = spawn_reader(reader);
    let (out_tx, out_rx) = tokio::sync::mpsc::channel::<Result<Event, Infallible>>(32);
    tokio::spawn(async move {
        while let Some(item) = rx.recv().await {
            if let Some(event) = format_event(item) {
                if out_tx.send(Ok(event)).await.is_err() {
                    break;
                }
            }
        }
    });
    Sse::new(ReceiverStream::new(out_rx)).keep_alive(KeepAlive::new().interval(Duration::from_secs(10)))
}

/// Non-streaming path: run `reader` to completion, returning ordered final
/// results or the first error encountered. `should_stop` is re-checked on
/// every `polling_interval` timeout (`reader.rs::next`).
fn wait_for_all(mut reader: ResponseReader, should_stop: &dyn Fn() -> bool) -> Result<Vec<TaskResult>, ApiError> {
    reader.wait_for_all(should_stop)
}

/// Sets its flag on `Drop`. Lives in `wait_for_all_async`'s own stack frame
/// (not moved into the `spawn_blocking` closure) so that when axum/hyper
/// drops the handler future on client disconnect — the same cancellation
/// hyper already relies on for in-flight requests — this guard drops with
/// it and arms the flag the blocking reader loop polls.
struct DisconnectGuard(Arc<AtomicBool>);

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

/// Blocking variant run off the tokio executor, for non-streaming handlers
/// (the scheduler's response queue uses std `Condvar`, which must not block
/// an async task directly).
///
/// `tokio::task::spawn_blocking`'s `JoinHandle` does *not* cancel its task
/// when dropped, so without this guard a client disconnect during a
/// non-streaming request would leave `reader.wait_for_all` running to
/// `n_predict` in the background, holding the slot the whole time — the
/// streaming path avoids this only because its `mpsc::Sender` fails loudly
/// when the receiver drops (`spawn_reader`, above). `disconnected` gives the
/// blocking loop the same signal: if this async fn's future is itself
/// dropped mid-`.await` (hyper cancelling the handler on disconnect),
/// `_guard` drops, flips `disconnected`, and `reader.next()`'s next
/// `should_stop()` check (at most one `polling_interval` later) calls
/// `reader.stop()`, posting `Cancel` for every still-waiting id.
pub async fn wait_for_all_async(reader: ResponseReader) -> Result<Vec<TaskResult>, ApiError> {
    let disconnected = Arc::new(AtomicBool::new(false));
    let _guard = DisconnectGuard(disconnected.clone());
    let should_stop = move || disconnected.load(Ordering::Relaxed);
    tokio::task::spawn_blocking(move || wait_for_all(reader, &should_stop))
        .await
        .map_err(|e| ApiError::Server(format!("reader task panicked: {e}")))?
}

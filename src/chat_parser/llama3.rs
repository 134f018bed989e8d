//! Llama-3.x tool format: a single top-level JSON object
//! `{"name": ..., "parameters": {...}}` with no wrapping tags — the model
//! is trained to emit *only* that object when calling a tool, and plain
//! prose otherwise.

use crate::chat_parser::generic::build_msg;
use crate::chat_parser::{ChatMsg, ExtractOptions, ToolCall};

pub fn extract(text: &str, opts: &ExtractOptions) -> ChatMsg {
    let trimmed = text.trim_start();
    // Gate on the opening brace alone: gating on `"name"` too would make a
    // partial parse's `content` flip to a tool call mid-stream once that
    // substring appears, which breaks the monotonicity invariant (content
    // must never shrink across partial parses of a growing prefix).
    let looks_like_call = trimmed.starts_with('{');

    if !looks_like_call {
        return build_msg(text.to_string(), String::new(), Vec::new(), opts);
    }

    match serde_json::from_str::<serde_json::Value>(trimmed) {
        Ok(v) => {
            let call = ToolCall {
                name: v.get("name").and_then(|n| n.as_str()).unwrap_or_default().to_string(),
                arguments: v
                    .get("parameters")
                    .or_else(|| v.get("arguments"))
                    .map(|a| a.to_string())
                    .unwrap_or_else(|| "{}".to_string()),
                id: String::new(),
            };
            build_msg(String::new(), String::new(), vec![call], opts)
        }
        Err(_) => {
            // Still mid-stream: expose what's parseable so far as a single
            // partial call rather than dropping it (monotonicity).
            let name = extract_partial_name(trimmed).unwrap_or_default();
            let call = ToolCall { name, arguments: trimmed.to_string(), id: String::new() };
            build_msg(String::new(), String::new(), vec![call], opts)
        }
    }
}

fn extract_partial_name(text: &str) -> Option<String> {
    let idx = text.find("\"name\"")?;
    let after = &text[idx + 6..];
    let colon = after.find(':')?;
    let after_colon = after[colon + 1..].trim_start();
    let quote = after_colon.strip_prefix('"')?;
    let end = quote.find('"').unwrap_or(quote.len());
    Some(quote[..end].to_string())
}

//! Generic tag/channel extractor: covers every format whose tool-call
//! *payload* shape is "a JSON object between two delimiters" and whose
//! reasoning is "text between two tags" — i.e. most of the 20 dialects in
//! spec.md §4.8 (see SPEC_FULL.md §7). Grounded on the teacher's
//! `HarmonyParser` find-tag-then-find-tag state machine in `harmony.rs`,
//! generalized from a single hardcoded tag set to the `FormatSpec` table.

use crate::chat_parser::{withhold_partial_suffix, ChatMsg, ExtractOptions, ToolCall};
use crate::task::ReasoningFormat;

/// Split `text` into `(reasoning, rest)` using the format's reasoning tag
/// pair. If the open tag is empty, `thinking_forced_open` must be set by
/// the caller (the chat template already inserted it) — this function
/// itself remains tag-driven either way.
fn split_reasoning<'a>(text: &'a str, open: &str, close: &str, thinking_forced_open: bool, may_omit_close: bool) -> (String, &'a str) {
    let body_start = if !open.is_empty() {
        match text.find(open) {
            Some(i) => i + open.len(),
            None => {
                return if thinking_forced_open {
                    // already inside reasoning from turn start
                    match text.find(close) {
                        Some(end) => (text[..end].to_string(), &text[end + close.len()..]),
                        None => (text.to_string(), ""),
                    }
                } else {
                    (String::new(), text)
                };
            }
        }
    } else if thinking_forced_open {
        0
    } else {
        return (String::new(), text);
    };

    let rest = &text[body_start..];
    match rest.find(close) {
        Some(end) => (rest[..end].to_string(), &rest[end + close.len()..]),
        None if may_omit_close => {
            // DeepSeek-R1 style: reasoning may run to end of stream if the
            // model never emits the close tag during this partial parse.
            // Withhold a trailing fragment that could still turn into the
            // close tag, so reasoning never grows past what's confirmed.
            (withhold_partial_suffix(rest, close).to_string(), "")
        }
        None => (withhold_partial_suffix(rest, close).to_string(), rest), // still inside reasoning; content is empty so far
    }
}

/// Extract zero or more tool calls wrapped in `(open, close)` tags, each
/// containing a single JSON object `{"name":..,"arguments":{..}}`. Applies
/// to Hermes-family clones that route through the Generic extractor.
fn extract_tagged_tool_calls(text: &str, open: &str, close: &str) -> (String, Vec<ToolCall>) {
    if open.is_empty() {
        return (text.to_string(), Vec::new());
    }
    let mut calls = Vec::new();
    let mut content = String::new();
    let mut rest = text;
    loop {
        match rest.find(open) {
            None => {
                content.push_str(rest);
                break;
            }
            Some(start) => {
                content.push_str(&rest[..start]);
                let after = &rest[start + open.len()..];
                let close_idx = if close.is_empty() { after.find('\n') } else { after.find(close) };
                match close_idx {
                    Some(end) => {
                        let payload = after[..end].trim();
                        calls.push(parse_tool_call_json(payload));
                        rest = &after[end + close.len().max(if close.is_empty() { 1 } else { 0 })..];
                    }
                    None => {
                        // Partial tool call still streaming: expose what we have.
                        calls.push(parse_tool_call_json_partial(after.trim()));
                        break;
                    }
                }
            }
        }
    }
    (content, calls)
}

fn parse_tool_call_json(payload: &str) -> ToolCall {
    match serde_json::from_str::<serde_json::Value>(payload) {
        Ok(v) => ToolCall {
            name: v.get("name").and_then(|n| n.as_str()).unwrap_or_default().to_string(),
            arguments: v
                .get("arguments")
                .map(|a| a.to_string())
                .unwrap_or_else(|| "{}".to_string()),
            id: String::new(),
        },
        Err(_) => ToolCall { name: String::new(), arguments: payload.to_string(), id: String::new() },
    }
}

/// A payload that may be a truncated JSON object mid-stream: best-effort
/// pull out `"name"` via a cheap scan and pass the rest through verbatim as
/// `arguments` (spec.md §4.8 "Tool-call partials").
fn parse_tool_call_json_partial(payload: &str) -> ToolCall {
    if serde_json::from_str::<serde_json::Value>(payload).is_ok() {
        return parse_tool_call_json(payload.trim());
    }
    let name = extract_partial_string_field(payload, "name").unwrap_or_default();
    ToolCall { name, arguments: payload.to_string(), id: String::new() }
}

fn extract_partial_string_field(payload: &str, field: &str) -> Option<String> {
    let needle = format!("\"{field}\"");
    let idx = payload.find(&needle)?;
    let after = &payload[idx + needle.len()..];
    let colon = after.find(':')?;
    let after_colon = after[colon + 1..].trim_start();
    let quote = after_colon.strip_prefix('"')?;
    let end = quote.find('"').unwrap_or(quote.len());
    Some(quote[..end].to_string())
}

pub fn extract(text: &str, opts: &ExtractOptions) -> ChatMsg {
    let (reasoning, rest) = match opts.spec.reasoning_tags {
        Some((open, close)) => split_reasoning(text, open, close, opts.thinking_forced_open, opts.spec.reasoning_may_omit_close),
        None => (String::new(), text),
    };

    let (content, tool_calls) = match opts.spec.tool_call_tags {
        Some((open, close)) => extract_tagged_tool_calls(rest, open, close),
        None => (rest.to_string(), Vec::new()),
    };

    build_msg(content, reasoning, tool_calls, opts)
}

/// DeepSeek-R1's payload shape differs enough (function name + fenced json
/// inside the tool-calls span, possibly missing close tokens) that it gets
/// its own body, but still reuses this module's reasoning splitter.
pub fn extract_deepseek_r1(text: &str, opts: &ExtractOptions) -> ChatMsg {
    let (reasoning, rest) = split_reasoning(text, "", "</think>", true, true);

    let (open, close) = opts.spec.tool_call_tags.unwrap_or(("", ""));
    let mut calls = Vec::new();
    let mut content = rest.to_string();
    if let Some(start) = rest.find(open) {
        content = rest[..start].to_string();
        let mut body = &rest[start + open.len()..];
        if let Some(end) = body.find(close) {
            body = &body[..end];
        }
        for segment in body.split("<｜tool_sep｜>").skip(1) {
            let name_end = segment.find("\n```json").unwrap_or(segment.len());
            let name = segment[..name_end].trim().to_string();
            let args_start = segment.find("```json").map(|i| i + "```json".len());
            let args = match args_start {
                Some(s) => {
                    let body = &segment[s..];
                    let end = body.find("```").unwrap_or(body.len());
                    body[..end].trim().to_string()
                }
                None => "{}".to_string(),
            };
            calls.push(ToolCall { name, arguments: args, id: String::new() });
        }
    }

    build_msg(content, reasoning, calls, opts)
}

pub(crate) fn build_msg(content: String, reasoning: String, tool_calls: Vec<ToolCall>, opts: &ExtractOptions) -> ChatMsg {
    let emit_reasoning = !matches!(opts.reasoning_format, ReasoningFormat::None);
    let (content, reasoning_content) = if !emit_reasoning || opts.reasoning_in_content {
        (format!("{reasoning}{content}"), String::new())
    } else {
        (content, reasoning)
    };

    ChatMsg {
        role: "assistant".to_string(),
        content,
        reasoning_content,
        tool_calls,
    }
}

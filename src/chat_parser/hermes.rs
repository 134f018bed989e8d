//! Hermes-2-Pro style extractor (spec.md §4.8, scenario S6) and its close
//! relatives (Functionary v3.1/v3.2, Firefunction-v2) that reuse this
//! shape with different delimiters. Tool calls appear inside
//! `<tool_call>...</tool_call>`, `<function=NAME>...</function>`, or a
//! fenced ```json block; an in-think `<tool_call>` is literal reasoning
//! text, not a call.

use crate::chat_parser::generic::build_msg;
use crate::chat_parser::{ChatMsg, ExtractOptions, ToolCall};

pub fn extract(text: &str, opts: &ExtractOptions) -> ChatMsg {
    let (reasoning, rest) = match opts.spec.reasoning_tags {
        Some((open, close)) => split_reasoning(text, open, close, opts.thinking_forced_open),
        None => (String::new(), text),
    };

    let (content, tool_calls) = extract_hermes_tool_calls(rest);
    build_msg(content, reasoning, tool_calls, opts)
}

fn split_reasoning<'a>(text: &'a str, open: &str, close: &str, forced_open: bool) -> (String, &'a str) {
    let start = match text.find(open) {
        Some(i) => i + open.len(),
        None if forced_open => 0,
        None => return (String::new(), text),
    };
    let rest = &text[start..];
    match rest.find(close) {
        Some(end) => (rest[..end].to_string(), &rest[end + close.len()..]),
        None => (rest.to_string(), ""),
    }
}

/// Accepts `<tool_call>{json}</tool_call>`, `<function=NAME>{args}</function>`,
/// and fenced ```json blocks, all of which Hermes-2-Pro-trained models may
/// emit interchangeably.
fn extract_hermes_tool_calls(text: &str) -> (String, Vec<ToolCall>) {
    let mut calls = Vec::new();
    let mut content = String::new();
    let mut rest = text;

    loop {
        let next_tag = [
            rest.find("<tool_call>").map(|i| (i, Tag::ToolCall)),
            rest.find("<function=").map(|i| (i, Tag::Function)),
            rest.find("```json").map(|i| (i, Tag::Fenced)),
        ]
        .into_iter()
        .flatten()
        .min_by_key(|(i, _)| *i);

        let Some((idx, tag)) = next_tag else {
            content.push_str(rest);
            break;
        };
        content.push_str(&rest[..idx]);

        match tag {
            Tag::ToolCall => {
                let after = &rest[idx + "<tool_call>".len()..];
                match after.find("</tool_call>") {
                    Some(end) => {
                        calls.push(json_call(after[..end].trim()));
                        rest = &after[end + "</tool_call>".len()..];
                    }
                    None => {
                        calls.push(json_call(after.trim()));
                        break;
                    }
                }
            }
            Tag::Function => {
                let after = &rest[idx + "<function=".len()..];
                let Some(name_end) = after.find('>') else {
                    break;
                };
                let name = after[..name_end].to_string();
                let body = &after[name_end + 1..];
                match body.find("</function>") {
                    Some(end) => {
                        calls.push(ToolCall { name, arguments: body[..end].trim().to_string(), id: String::new() });
                        rest = &body[end + "</function>".len()..];
                    }
                    None => {
                        calls.push(ToolCall { name, arguments: body.trim().to_string(), id: String::new() });
                        break;
                    }
                }
            }
            Tag::Fenced => {
                let after = &rest[idx + "```json".len()..];
                match after.find("```") {
                    Some(end) => {
                        calls.push(json_call(after[..end].trim()));
                        rest = &after[end + 3..];
                    }
                    None => {
                        calls.push(json_call(after.trim()));
                        break;
                    }
                }
            }
        }
    }

    (content, calls)
}

enum Tag {
    ToolCall,
    Function,
    Fenced,
}

fn json_call(payload: &str) -> ToolCall {
    match serde_json::from_str::<serde_json::Value>(payload) {
        Ok(v) => ToolCall {
            name: v.get("name").and_then(|n| n.as_str()).unwrap_or_default().to_string(),
            arguments: v.get("arguments").map(|a| a.to_string()).unwrap_or_else(|| "{}".to_string()),
            id: String::new(),
        },
        Err(_) => ToolCall { name: String::new(), arguments: payload.to_string(), id: String::new() },
    }
}

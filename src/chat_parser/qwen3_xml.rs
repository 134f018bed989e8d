//! Qwen3-Coder XML tool format: `<tool_call><function=NAME>
//! <parameter=KEY>VALUE</parameter>...</function></tool_call>`. Parameter
//! values are whitespace-trimmed and coerced to a JSON number/bool/null when
//! they parse as one, else kept as a JSON string (spec.md §4.8).

use crate::chat_parser::generic::build_msg;
use crate::chat_parser::{ChatMsg, ExtractOptions, ToolCall};

pub fn extract(text: &str, opts: &ExtractOptions) -> ChatMsg {
    let (reasoning, rest) = match opts.spec.reasoning_tags {
        Some((open, close)) => split_reasoning(text, open, close, opts.thinking_forced_open),
        None => (String::new(), text),
    };

    let (open, close) = opts.spec.tool_call_tags.unwrap_or(("<tool_call>", "</tool_call>"));
    let (content, tool_calls) = extract_calls(rest, open, close);
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

fn extract_calls(text: &str, open: &str, close: &str) -> (String, Vec<ToolCall>) {
    let mut content = String::new();
    let mut calls = Vec::new();
    let mut rest = text;

    loop {
        let Some(start) = rest.find(open) else {
            content.push_str(rest);
            break;
        };
        content.push_str(&rest[..start]);
        let after = &rest[start + open.len()..];
        let (body, tail) = match after.find(close) {
            Some(end) => (&after[..end], &after[end + close.len()..]),
            None => (after, ""),
        };
        calls.push(parse_function(body));
        rest = tail;
        if tail.is_empty() {
            break;
        }
    }

    (content, calls)
}

fn parse_function(body: &str) -> ToolCall {
    let Some(fn_start) = body.find("<function=") else {
        return ToolCall { name: String::new(), arguments: "{}".to_string(), id: String::new() };
    };
    let after = &body[fn_start + "<function=".len()..];
    let Some(name_end) = after.find('>') else {
        return ToolCall { name: String::new(), arguments: "{}".to_string(), id: String::new() };
    };
    let name = after[..name_end].to_string();
    let params_text = match after.find("</function>") {
        Some(end) => &after[name_end + 1..end],
        None => &after[name_end + 1..],
    };

    let args = parse_parameters(params_text);
    ToolCall { name, arguments: args.to_string(), id: String::new() }
}

fn parse_parameters(text: &str) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    let mut rest = text;
    loop {
        let Some(start) = rest.find("<parameter=") else { break };
        let after = &rest[start + "<parameter=".len()..];
        let Some(key_end) = after.find('>') else { break };
        let key = after[..key_end].to_string();
        let body = &after[key_end + 1..];
        let (value, tail) = match body.find("</parameter>") {
            Some(end) => (body[..end].trim(), &body[end + "</parameter>".len()..]),
            None => (body.trim(), ""),
        };
        map.insert(key, coerce_value(value));
        rest = tail;
        if tail.is_empty() {
            break;
        }
    }
    serde_json::Value::Object(map)
}

fn coerce_value(raw: &str) -> serde_json::Value {
    match raw {
        "true" => serde_json::Value::Bool(true),
        "false" => serde_json::Value::Bool(false),
        "null" => serde_json::Value::Null,
        _ => {
            if let Ok(n) = raw.parse::<i64>() {
                serde_json::Value::Number(n.into())
            } else if let Ok(f) = raw.parse::<f64>() {
                serde_json::Number::from_f64(f).map(serde_json::Value::Number).unwrap_or_else(|| serde_json::Value::String(raw.to_string()))
            } else {
                serde_json::Value::String(raw.to_string())
            }
        }
    }
}

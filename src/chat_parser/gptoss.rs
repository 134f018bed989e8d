//! GPT-OSS / Harmony multi-channel extractor: `<|channel|>analysis|
//! commentary|final<|message|>...<|end|>` with an optional `to=functions.NAME`
//! recipient in the header and a `<|constrain|>json` marker. Grounded
//! directly on the teacher's `harmony.rs` `HarmonyParser`/
//! `HarmonyMessageHandler` state machine, reshaped to emit this module's
//! `ChatMsg`/`ToolCall` (multiple calls across a stream, not just one).

use crate::chat_parser::generic::build_msg;
use crate::chat_parser::{ChatMsg, ExtractOptions, ToolCall};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Channel {
    Analysis,
    Commentary,
    Final,
}

struct Header {
    channel: Channel,
    recipient: Option<String>,
}

fn parse_header(raw: &str) -> Header {
    let raw = raw.replace("<|constrain|>json", "").trim().to_string();
    let channel = if raw.contains("analysis") {
        Channel::Analysis
    } else if raw.contains("commentary") {
        Channel::Commentary
    } else {
        Channel::Final
    };
    let recipient = raw
        .split_whitespace()
        .find_map(|tok| tok.strip_prefix("to=").map(|s| s.trim_start_matches("functions.").to_string()));
    Header { channel, recipient }
}

pub fn extract(text: &str, opts: &ExtractOptions) -> ChatMsg {
    let mut content = String::new();
    let mut reasoning = String::new();
    let mut calls: Vec<ToolCall> = Vec::new();

    let mut rest = text;
    loop {
        let Some(start_idx) = rest.find("<|start|>") else {
            // No more full message headers; if `thinking_forced_open` and
            // nothing has been found yet, the whole buffer is reasoning.
            if content.is_empty() && calls.is_empty() && opts.thinking_forced_open && reasoning.is_empty() {
                reasoning.push_str(rest);
            }
            break;
        };
        let after_start = &rest[start_idx + "<|start|>".len()..];
        let Some(header_end) = after_start.find("<|message|>") else {
            break;
        };
        let header = parse_header(&after_start[..header_end]);
        let body_start = header_end + "<|message|>".len();
        let body_all = &after_start[body_start..];

        let (body, tail) = match body_all.find("<|end|>") {
            Some(end) => (&body_all[..end], &body_all[end + "<|end|>".len()..]),
            None => (body_all, ""),
        };

        match (header.channel, &header.recipient) {
            (_, Some(name)) => calls.push(ToolCall {
                name: name.clone(),
                arguments: body.to_string(),
                id: String::new(),
            }),
            (Channel::Analysis, None) => reasoning.push_str(body),
            (Channel::Commentary, None) | (Channel::Final, None) => content.push_str(body),
        }

        rest = tail;
        if rest.is_empty() {
            break;
        }
    }

    build_msg(content, reasoning, calls, opts)
}

//! [C5] Chat parser: incremental parsing of a growing model-output stream
//! into `{content, reasoning_content, tool_calls[]}`, across the ~20 vendor
//! dialects in spec.md §4.8. See SPEC_FULL.md §7 for the engine design.

pub mod format;
mod generic;
mod gptoss;
mod hermes;
mod llama3;
mod qwen3_xml;
#[cfg(test)]
mod tests;

pub use format::ChatFormat;

use serde::Serialize;
use uuid::Uuid;

use crate::task::ReasoningFormat;

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ToolCall {
    pub name: String,
    pub arguments: String,
    pub id: String,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ChatMsg {
    pub role: String,
    pub content: String,
    pub reasoning_content: String,
    pub tool_calls: Vec<ToolCall>,
}

/// Per-reader, per-task-index parsing state (spec.md §3 `ParserState`).
#[derive(Debug, Clone)]
pub struct ParserState {
    pub accumulated_text: String,
    pub parsed: ChatMsg,
    pub tool_call_ids: Vec<String>,
    pub stream_id: String,
    format: ChatFormat,
    reasoning_format: ReasoningFormat,
    reasoning_in_content: bool,
    thinking_forced_open: bool,
}

impl ParserState {
    pub fn new(
        format: ChatFormat,
        reasoning_format: ReasoningFormat,
        reasoning_in_content: bool,
        thinking_forced_open: bool,
    ) -> Self {
        Self {
            accumulated_text: String::new(),
            parsed: ChatMsg { role: "assistant".to_string(), ..Default::default() },
            tool_call_ids: Vec::new(),
            stream_id: format!("chatcmpl-{}", Uuid::new_v4().simple()),
            format,
            reasoning_format,
            reasoning_in_content,
            thinking_forced_open,
        }
    }

    /// Feed the growing raw text and reparse (partial parse). Returns the
    /// diff against the previously parsed message.
    pub fn update(&mut self, full_text: &str) -> Diff {
        self.accumulated_text = full_text.to_string();
        let prev = self.parsed.clone();
        let next = parse(
            self.format,
            full_text,
            true,
            self.reasoning_format,
            self.reasoning_in_content,
            self.thinking_forced_open,
        );
        debug_assert!(is_monotonic(&prev, &next), "chat parser must be monotonic across partial parses");
        self.parsed = next;
        for (i, call) in self.parsed.tool_calls.iter().enumerate() {
            if i >= self.tool_call_ids.len() {
                self.tool_call_ids.push(if call.id.is_empty() {
                    format!("call_{}", Uuid::new_v4().simple())
                } else {
                    call.id.clone()
                });
            }
        }
        compute_diffs(&prev, &self.parsed)
    }

    pub fn finalize(&mut self) -> ChatMsg {
        self.parsed = parse(
            self.format,
            &self.accumulated_text,
            false,
            self.reasoning_format,
            self.reasoning_in_content,
            self.thinking_forced_open,
        );
        self.parsed.clone()
    }
}

/// The delta between two successive partial `ChatMsg`s (spec.md §4.8
/// "Diff computation").
#[derive(Debug, Clone, Default, Serialize)]
pub struct Diff {
    pub content_delta: String,
    pub reasoning_content_delta: String,
    /// `(index, name_delta, id, arguments_delta)` per changed/new tool call.
    pub tool_call_deltas: Vec<ToolCallDelta>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ToolCallDelta {
    pub index: usize,
    pub name: Option<String>,
    pub id: Option<String>,
    pub arguments_delta: String,
}

pub fn compute_diffs(prev: &ChatMsg, curr: &ChatMsg) -> Diff {
    let content_delta = strip_prefix_safely(&prev.content, &curr.content);
    let reasoning_content_delta = strip_prefix_safely(&prev.reasoning_content, &curr.reasoning_content);

    let mut tool_call_deltas = Vec::new();
    for (i, call) in curr.tool_calls.iter().enumerate() {
        match prev.tool_calls.get(i) {
            None => tool_call_deltas.push(ToolCallDelta {
                index: i,
                name: Some(call.name.clone()),
                id: Some(call.id.clone()),
                arguments_delta: call.arguments.clone(),
            }),
            Some(prev_call) => {
                let args_delta = strip_prefix_safely(&prev_call.arguments, &call.arguments);
                if !args_delta.is_empty() || prev_call.name != call.name {
                    tool_call_deltas.push(ToolCallDelta {
                        index: i,
                        name: if prev_call.name != call.name { Some(call.name.clone()) } else { None },
                        id: None,
                        arguments_delta: args_delta,
                    });
                }
            }
        }
    }

    Diff { content_delta, reasoning_content_delta, tool_call_deltas }
}

/// `curr` minus the common `prev` prefix, never panicking on a non-prefix
/// (which would be a monotonicity bug upstream, but diffing must stay safe).
fn strip_prefix_safely(prev: &str, curr: &str) -> String {
    if let Some(rest) = curr.strip_prefix(prev) {
        rest.to_string()
    } else {
        curr.to_string()
    }
}

/// Trims any trailing suffix of `text` that is itself a (non-empty, proper)
/// prefix of `needle`, so a delimiter still arriving character-by-character
/// is never exposed as content only to vanish once it fully matches — that
/// would make the partial parse shrink. Used by every tag-scanning
/// extractor at its "delimiter not found yet" branch.
pub(crate) fn withhold_partial_suffix<'a>(text: &'a str, needle: &str) -> &'a str {
    if needle.is_empty() {
        return text;
    }
    let needle_chars: Vec<char> = needle.chars().collect();
    let text_char_count = text.chars().count();
    let max_overlap = needle_chars.len().min(text_char_count).saturating_sub(1);
    for overlap in (1..=max_overlap).rev() {
        let candidate: String = needle_chars[..overlap].iter().collect();
        if text.ends_with(&candidate) {
            return &text[..text.len() - candidate.len()];
        }
    }
    text
}

fn is_monotonic(prev: &ChatMsg, curr: &ChatMsg) -> bool {
    curr.content.starts_with(&prev.content)
        && curr.reasoning_content.starts_with(&prev.reasoning_content)
        && curr.tool_calls.len() >= prev.tool_calls.len()
        && prev
            .tool_calls
            .iter()
            .zip(curr.tool_calls.iter())
            .all(|(p, c)| c.arguments.starts_with(&p.arguments))
}

/// Entry point: parse `text` under `format`. `partial` selects partial- vs
/// final-parse semantics (mid-JSON tool args are passed through as-is
/// either way; `partial=false` additionally treats an unterminated
/// reasoning/tool span as closed at end-of-string).
pub fn parse(
    format: ChatFormat,
    text: &str,
    partial: bool,
    reasoning_format: ReasoningFormat,
    reasoning_in_content: bool,
    thinking_forced_open: bool,
) -> ChatMsg {
    let spec = format.spec();
    let opts = ExtractOptions {
        spec: &spec,
        partial,
        reasoning_format,
        reasoning_in_content,
        thinking_forced_open,
    };
    match spec.extractor {
        format::Extractor::Hermes => hermes::extract(text, &opts),
        format::Extractor::Llama3 => llama3::extract(text, &opts),
        format::Extractor::DeepSeekR1 => crate::chat_parser::generic::extract_deepseek_r1(text, &opts),
        format::Extractor::GptOss => gptoss::extract(text, &opts),
        format::Extractor::Qwen3Xml => qwen3_xml::extract(text, &opts),
        format::Extractor::Generic => generic::extract(text, &opts),
    }
}

pub(crate) struct ExtractOptions<'a> {
    pub spec: &'a format::FormatSpec,
    pub partial: bool,
    pub reasoning_format: ReasoningFormat,
    pub reasoning_in_content: bool,
    pub thinking_forced_open: bool,
}

//! [Task/TaskParams] data model, spec.md §3.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::chat_parser::format::ChatFormat;
use crate::sampler::SamplerConfig;
use crate::token_buf::TokenBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseType {
    Native,
    OaiCmpl,
    OaiChat,
    OaiResp,
    OaiEmbd,
    Anthropic,
}

#[derive(Debug, Clone, Default)]
pub struct ChatParserParams {
    pub format: ChatFormat,
    pub reasoning_format: ReasoningFormat,
    pub reasoning_in_content: bool,
    pub thinking_forced_open: bool,
    pub parse_tool_calls: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReasoningFormat {
    #[default]
    Auto,
    DeepSeek,
    None,
}

#[derive(Debug, Clone)]
pub struct SpeculativeParams {
    pub n_min: usize,
    pub n_max: usize,
    pub p_min: f32,
}

impl Default for SpeculativeParams {
    fn default() -> Self {
        Self { n_min: 0, n_max: 0, p_min: 0.9 }
    }
}

#[derive(Debug, Clone)]
pub struct TaskParams {
    pub stream: bool,
    pub include_usage: bool,
    pub cache_prompt: bool,
    pub return_tokens: bool,
    pub return_progress: bool,
    pub n_keep: i32,
    pub n_discard: i32,
    pub n_predict: i32,
    pub n_indent: i32,
    pub n_cmpl: i32,
    pub n_cache_reuse: i32,
    pub t_max_predict_ms: i64,
    pub lora: Vec<(String, f32)>,
    pub antiprompt: Vec<String>,
    pub response_fields: Vec<String>,
    pub timings_per_token: bool,
    pub post_sampling_probs: bool,
    pub sampling: SamplerConfig,
    pub speculative: SpeculativeParams,
    pub response_type: ResponseType,
    pub oaicompat_model: String,
    pub oaicompat_cmpl_id: String,
    pub chat_parser_params: ChatParserParams,
    pub embd_normalize: i32,
    pub verbose: bool,
}

impl Default for TaskParams {
    fn default() -> Self {
        Self {
            stream: false,
            include_usage: false,
            cache_prompt: true,
            return_tokens: false,
            return_progress: false,
            n_keep: 0,
            n_discard: 0,
            n_predict: -1,
            n_indent: 0,
            n_cmpl: 1,
            n_cache_reuse: 0,
            t_max_predict_ms: 0,
            lora: Vec::new(),
            antiprompt: Vec::new(),
            response_fields: Vec::new(),
            timings_per_token: false,
            post_sampling_probs: false,
            sampling: SamplerConfig::default(),
            speculative: SpeculativeParams::default(),
            response_type: ResponseType::Native,
            oaicompat_model: String::new(),
            oaicompat_cmpl_id: String::new(),
            chat_parser_params: ChatParserParams::default(),
            embd_normalize: 2,
            verbose: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskType {
    Completion,
    Infill,
    Embedding,
    Rerank,
    Cancel,
    NextResponse,
    Metrics,
    SlotSave,
    SlotRestore,
    SlotErase,
    GetLora,
    SetLora,
    SlotsInfo,
}

pub struct Task {
    pub id: i64,
    pub index: usize,
    pub kind: TaskType,
    pub id_target: i64,
    pub id_slot: i64,
    pub id_parent: i64,
    pub child_tasks: Vec<Task>,
    pub params: TaskParams,
    pub tokens: TokenBuf,
    pub cli_prompt: Option<String>,
    pub slot_save_filename: Option<String>,
    pub lora_set: Option<Vec<(String, f32)>>,
    pub rerank_documents: Vec<TokenBuf>,
}

impl Task {
    pub fn new(kind: TaskType, params: TaskParams, tokens: TokenBuf) -> Self {
        Self {
            id: -1,
            index: 0,
            kind,
            id_target: -1,
            id_slot: -1,
            id_parent: -1,
            child_tasks: Vec::new(),
            params,
            tokens,
            cli_prompt: None,
            slot_save_filename: None,
            lora_set: None,
            rerank_documents: Vec::new(),
        }
    }

    pub fn control(kind: TaskType) -> Self {
        Self::new(kind, TaskParams::default(), TokenBuf::new(false))
    }

    pub fn is_control(&self) -> bool {
        matches!(
            self.kind,
            TaskType::Cancel
                | TaskType::Metrics
                | TaskType::SlotSave
                | TaskType::SlotRestore
                | TaskType::SlotErase
                | TaskType::GetLora
                | TaskType::SetLora
                | TaskType::SlotsInfo
        )
    }
}

/// A flattened view of `response_fields` used by the HTTP layer to project a
/// subset of a non-stream response (spec.md §6 `response_fields`).
pub fn project_fields(value: &mut serde_json::Value, fields: &[String]) {
    if fields.is_empty() {
        return;
    }
    let mut out = serde_json::Map::new();
    for path in fields {
        if let Some(v) = dotted_get(value, path) {
            dotted_set(&mut out, path, v.clone());
        }
    }
    *value = serde_json::Value::Object(out);
}

fn dotted_get<'a>(value: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    let mut cur = value;
    for part in path.split('.') {
        cur = cur.get(part)?;
    }
    Some(cur)
}

fn dotted_set(out: &mut serde_json::Map<String, serde_json::Value>, path: &str, value: serde_json::Value) {
    let parts: Vec<&str> = path.split('.').collect();
    let mut cur = out;
    for (i, part) in parts.iter().enumerate() {
        if i == parts.len() - 1 {
            cur.insert(part.to_string(), value);
            return;
        }
        let entry = cur
            .entry(part.to_string())
            .or_insert_with(|| serde_json::Value::Object(serde_json::Map::new()));
        cur = entry.as_object_mut().expect("dotted_set: path conflict");
    }
}

pub type LoraRequest = HashMap<String, f32>;

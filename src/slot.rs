//! [C6] Slot: a single generation lane sharing the model context with
//! peers via its own sequence id (spec.md §3/§4.3). Holds the per-request
//! state machine; the heavy cross-slot orchestration (batch assembly,
//! context shift, speculative accept) lives in `scheduler.rs`, which reads
//! and mutates these fields directly the way `server-context.cpp`'s
//! `update_slots()` reaches into `server_slot` members.

use std::time::Instant;

use crate::checkpoint::CheckpointRing;
use crate::lora::AdapterInfo;
use crate::response::{StopType, Timings};
use crate::sampler::{Sampler, TokenCandidate};
use crate::task::Task;
use crate::token_buf::TokenBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Started,
    /// Child of a parallel-N request, waiting for its parent to reach
    /// `DonePrompt` so it can inherit KV + sampler state.
    WaitOther,
    ProcessingPrompt,
    DonePrompt,
    Generating,
}

/// The slot's own cached prompt: the tokens currently resident in the
/// backend's KV cells under `slot.id`, plus the checkpoint ring that lets a
/// later request recover a prefix SWA has evicted (spec.md §3 `Checkpoint`).
pub struct SlotPrompt {
    pub tokens: TokenBuf,
    pub checkpoints: CheckpointRing,
}

pub struct Slot {
    pub id: i32,
    pub n_ctx: usize,
    pub state: SlotState,
    pub prompt: SlotPrompt,

    pub task: Option<Task>,
    pub task_prev: Option<Task>,
    pub sampler: Option<Sampler>,
    pub lora: Vec<AdapterInfo>,
    pub alora_invocation_start: Option<usize>,

    pub generated_text: String,
    pub generated_tokens: Vec<i32>,
    pub n_decoded: usize,
    pub n_prompt_tokens_cache: usize,
    pub n_prompt_tokens_processed: usize,
    pub last_nl_pos: usize,
    pub n_remaining: i64,

    /// Index of this slot's logits-bearing entry within the assembled
    /// batch, this scheduler iteration.
    pub i_batch: Option<usize>,
    /// Batch indices of this slot's speculative draft tokens, if any.
    pub i_batch_dft: Vec<usize>,
    pub drafted: Vec<i32>,
    pub sampled: i32,

    pub stop: Option<StopType>,
    pub stopping_word: String,
    pub truncated: bool,
    pub has_new_line: bool,
    pub has_next_token: bool,

    pub t_start_process_prompt: Option<Instant>,
    pub t_start_generation: Option<Instant>,
    pub n_draft_total: u64,
    pub n_draft_accepted: u64,

    pub probs: Vec<TokenCandidate>,
    /// `true` if this slot's task is a child of a parallel-N (`n_cmpl>1`) parent.
    pub is_child: bool,
    pub t_last_used: Instant,
}

impl Slot {
    pub fn new(id: i32, n_ctx: usize, n_ctx_checkpoints: usize) -> Self {
        Self {
            id,
            n_ctx,
            state: SlotState::Idle,
            prompt: SlotPrompt { tokens: TokenBuf::new(true), checkpoints: CheckpointRing::new(n_ctx_checkpoints) },
            task: None,
            task_prev: None,
            sampler: None,
            lora: Vec::new(),
            alora_invocation_start: None,
            generated_text: String::new(),
            generated_tokens: Vec::new(),
            n_decoded: 0,
            n_prompt_tokens_cache: 0,
            n_prompt_tokens_processed: 0,
            last_nl_pos: 0,
            n_remaining: -1,
            i_batch: None,
            i_batch_dft: Vec::new(),
            drafted: Vec::new(),
            sampled: -1,
            stop: None,
            stopping_word: String::new(),
            truncated: false,
            has_new_line: false,
            has_next_token: true,
            t_start_process_prompt: None,
            t_start_generation: None,
            n_draft_total: 0,
            n_draft_accepted: 0,
            probs: Vec::new(),
            is_child: false,
            t_last_used: Instant::now(),
        }
    }

    pub fn is_idle(&self) -> bool {
        self.state == SlotState::Idle
    }

    pub fn is_processing(&self) -> bool {
        !matches!(self.state, SlotState::Idle)
    }

    pub fn is_generating(&self) -> bool {
        self.state == SlotState::Generating
    }

    /// `Idle -> Started` (spec.md §4.3). Per-request fields are reset here;
    /// `prompt.tokens`/`prompt.checkpoints` are left untouched — they carry
    /// the slot's cached KV across requests and are only mutated by the
    /// scheduler's LCP/reuse/context-shift logic.
    pub fn launch(&mut self, task: Task, sampler: Sampler, lora: Vec<AdapterInfo>, alora_invocation_start: Option<usize>, is_child: bool) {
        self.n_remaining = task.params.n_predict as i64;
        self.sampler = Some(sampler);
        self.lora = lora;
        self.alora_invocation_start = alora_invocation_start;
        self.generated_text.clear();
        self.generated_tokens.clear();
        self.n_decoded = 0;
        self.n_prompt_tokens_cache = 0;
        self.n_prompt_tokens_processed = 0;
        self.last_nl_pos = 0;
        self.i_batch = None;
        self.i_batch_dft.clear();
        self.drafted.clear();
        self.sampled = -1;
        self.stop = None;
        self.stopping_word.clear();
        self.truncated = false;
        self.has_new_line = false;
        self.has_next_token = true;
        self.t_start_process_prompt = None;
        self.t_start_generation = None;
        self.n_draft_total = 0;
        self.n_draft_accepted = 0;
        self.probs.clear();
        self.is_child = is_child;
        self.task = Some(task);
        self.state = if is_child { SlotState::WaitOther } else { SlotState::Started };
    }

    /// `* -> Idle` (spec.md §4.3 "Destruction"). Moves `task -> task_prev`,
    /// drops the sampler, and marks the slot free; the scheduler is
    /// responsible for purging KV cells when this was a child slot.
    pub fn release(&mut self) {
        self.task_prev = self.task.take();
        self.sampler = None;
        self.i_batch = None;
        self.i_batch_dft.clear();
        self.drafted.clear();
        self.state = SlotState::Idle;
        self.t_last_used = Instant::now();
    }

    pub fn has_budget(&self, global_n_predict: i64) -> bool {
        if self.n_remaining > 0 {
            return self.n_decoded < self.n_remaining as usize;
        }
        if self.n_remaining == 0 {
            return false;
        }
        if global_n_predict > 0 {
            return self.n_decoded < global_n_predict as usize;
        }
        true
    }

    /// Append a just-generated token's rendered piece to `generated_text`
    /// and run antiprompt/indent stop detection (spec.md §4.3 "Stop
    /// detection"). Returns the text that is now safe to stream — empty
    /// while a partial antiprompt match is still ambiguous.
    pub fn process_token(&mut self, piece: &str, token_id: i32, is_eog: bool) -> String {
        self.generated_tokens.push(token_id);
        self.n_decoded += 1;
        self.generated_text.push_str(piece);

        if piece.contains('\n') {
            self.has_new_line = true;
        }

        if is_eog {
            self.stop = Some(StopType::Eos);
            self.has_next_token = false;
            return piece.to_string();
        }

        let task = self.task.as_ref().expect("process_token without an active task");

        // Full antiprompt match anywhere in the tail stops generation.
        for antiprompt in &task.params.antiprompt {
            if antiprompt.is_empty() {
                continue;
            }
            if let Some(pos) = self.generated_text.find(antiprompt.as_str()) {
                self.stop = Some(StopType::Word);
                self.stopping_word = antiprompt.clone();
                self.has_next_token = false;
                // Never stream text at or past the stop word.
                self.generated_text.truncate(pos);
                return String::new();
            }
        }

        // Indent-limit stop: after the first newline, if every subsequent
        // line's leading whitespace run is >= n_indent, stop (spec.md
        // §4.3 "Exceeding ... n_indent").
        if task.params.n_indent > 0 && self.has_new_line {
            if let Some(indent) = trailing_line_indent(&self.generated_text) {
                if indent >= task.params.n_indent as usize {
                    self.stop = Some(StopType::Limit);
                    self.has_next_token = false;
                }
            }
        }

        // Suppress streaming any suffix of `generated_text` that is itself
        // a prefix of some configured antiprompt — it might still grow
        // into a full match next token (spec.md: "partial tail match...
        // suppresses sending that text until the ambiguity resolves").
        let safe_len = task
            .params
            .antiprompt
            .iter()
            .filter(|a| !a.is_empty())
            .filter_map(|a| partial_suffix_overlap(&self.generated_text, a))
            .min()
            .unwrap_or(self.generated_text.len());

        piece.get(..piece.len().min(safe_len.saturating_sub(self.generated_text.len() - piece.len())))
            .unwrap_or("")
            .to_string()
    }

    pub fn timings(&self) -> Timings {
        let prompt_ms = self
            .t_start_generation
            .zip(self.t_start_process_prompt)
            .map(|(gen, start)| gen.duration_since(start).as_secs_f64() * 1000.0)
            .unwrap_or(0.0);
        let predicted_ms = self.t_start_generation.map(|t| t.elapsed().as_secs_f64() * 1000.0).unwrap_or(0.0);
        Timings {
            prompt_n: self.n_prompt_tokens_processed,
            prompt_ms,
            prompt_per_token_ms: if self.n_prompt_tokens_processed > 0 { prompt_ms / self.n_prompt_tokens_processed as f64 } else { 0.0 },
            prompt_per_second: if prompt_ms > 0.0 { self.n_prompt_tokens_processed as f64 / (prompt_ms / 1000.0) } else { 0.0 },
            predicted_n: self.n_decoded,
            predicted_ms,
            predicted_per_token_ms: if self.n_decoded > 0 { predicted_ms / self.n_decoded as f64 } else { 0.0 },
            predicted_per_second: if predicted_ms > 0.0 { self.n_decoded as f64 / (predicted_ms / 1000.0) } else { 0.0 },
        }
    }
}

/// Largest suffix length of `text` that is a proper, non-empty prefix of
/// `needle` — i.e. how much of `text`'s tail must be withheld because it
/// could still grow into `needle`. Returns `text.len()` (withhold nothing
/// extra) when there's no overlap.
fn partial_suffix_overlap(text: &str, needle: &str) -> Option<usize> {
    let max_overlap = needle.len().min(text.len()).saturating_sub(1);
    for overlap in (1..=max_overlap).rev() {
        if text.ends_with(&needle[..overlap]) {
            return Some(text.len() - overlap);
        }
    }
    None
}

/// Leading whitespace run length of the last line in `text`, or `None` if
/// there's no newline yet (spec.md §4.3 n_indent: "minimum whitespace
/// indentation on new lines after the first newline").
fn trailing_line_indent(text: &str) -> Option<usize> {
    let last_line = text.rsplit('\n').next()?;
    if last_line.is_empty() {
        return None;
    }
    Some(last_line.chars().take_while(|c| *c == ' ' || *c == '\t').count())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_suffix_overlap_detects_prefix() {
        assert_eq!(partial_suffix_overlap("hello ST", "STOP"), Some(6));
        assert_eq!(partial_suffix_overlap("hello", "STOP"), None);
    }

    #[test]
    fn trailing_line_indent_counts_leading_whitespace() {
        assert_eq!(trailing_line_indent("a\n    b"), Some(4));
        assert_eq!(trailing_line_indent("a\nb"), Some(0));
        assert_eq!(trailing_line_indent("no newline"), None);
    }
}

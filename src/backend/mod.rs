//! The tensor runtime is an opaque collaborator per spec.md §1: this module
//! defines the narrow [`Backend`] trait the scheduler drives (`decode`,
//! `seq_rm/add/cp`, `state_get/set`, `sample`, `tokenize/detokenize`,
//! `embed`, `memory.can_shift`, `memory.pos_min/max`) plus the concrete
//! implementation on top of `gg` (the teacher's vendored `llama-cpp-2` fork),
//! grounded on `inference.rs`'s prefill/decode/sliding-window routines.

mod llama;
mod sizing;

pub use llama::LlamaBackend as ConcreteBackend;
pub use sizing::{pick_n_ctx_by_vram, vram_free_bytes};

use async_trait::async_trait;

use crate::media::MediaKind;

pub type SeqId = i32;
pub type Token = i32;

/// One `(token, position, sequence_id, logits?)` tuple, the flat unit the
/// backend's batch API consumes (spec.md GLOSSARY "Batch").
#[derive(Debug, Clone, Copy)]
pub struct BatchEntry {
    pub token: Token,
    pub pos: i32,
    pub seq_id: SeqId,
    pub logits: bool,
}

#[derive(Debug, Default)]
pub struct Batch {
    pub entries: Vec<BatchEntry>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn push(&mut self, token: Token, pos: i32, seq_id: SeqId, logits: bool) {
        self.entries.push(BatchEntry { token, pos, seq_id, logits });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Index (within this batch) of the last entry belonging to `seq_id`
    /// that requested logits, if any.
    pub fn logits_index_for(&self, seq_id: SeqId) -> Option<usize> {
        self.entries
            .iter()
            .enumerate()
            .rev()
            .find(|(_, e)| e.seq_id == seq_id && e.logits)
            .map(|(i, _)| i)
    }
}

/// Outcome of a single `decode()` call, modeled after llama.cpp's integer
/// return codes (spec.md §4.4 step 6 / §9 open question on `n_batch` retry).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeOutcome {
    Ok,
    /// `ret == 1`: KV cache is full / context exceeded for this batch shape.
    NoKvSlot,
    /// `ret == -1`: the batch itself was malformed.
    InvalidBatch,
    /// `ret < -1`: an unrecoverable compute error.
    ComputeError,
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("tokenize failed: {0}")]
    Tokenize(String),
    #[error("decode failed: {0}")]
    Decode(String),
    #[error("media preprocessing failed: {0}")]
    Media(String),
    #[error("sampling failed: {0}")]
    Sample(String),
    #[error("state (de)serialization failed: {0}")]
    State(String),
}

#[derive(Debug, Clone)]
pub struct VocabMeta {
    pub n_vocab: i32,
    pub bos: Option<i32>,
    pub eos: Vec<i32>,
    pub fim_pre: Option<i32>,
    pub fim_suf: Option<i32>,
    pub fim_mid: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolingType {
    None,
    Mean,
    Cls,
    Last,
    Rank,
}

/// The narrow surface the scheduler needs. One implementation per tensor
/// runtime; only [`llama::LlamaBackend`] exists today.
#[async_trait]
pub trait Backend: Send + Sync {
    fn n_ctx_train(&self) -> usize;
    fn vocab(&self) -> &VocabMeta;
    fn pooling_type(&self) -> PoolingType;

    fn tokenize(&self, text: &str, add_special: bool, parse_special: bool) -> Result<Vec<i32>, BackendError>;
    fn detokenize(&self, tokens: &[i32], special: bool) -> Result<String, BackendError>;
    fn token_to_piece(&self, token: i32, special: bool) -> Result<Vec<u8>, BackendError>;
    fn is_eog(&self, token: i32) -> bool;

    /// Run one decode over the assembled batch; returns per-call outcome.
    async fn decode(&self, batch: &Batch) -> Result<DecodeOutcome, BackendError>;

    /// Sample the next token from the logits at `logits_idx` within the last
    /// decoded batch, using the given sampler chain (opaque to the
    /// scheduler beyond this call per spec.md §4 C4).
    fn sample(&self, seq_id: SeqId, logits_idx: usize, sampler: &mut crate::sampler::Sampler) -> Result<i32, BackendError>;

    /// Read the pooled (or per-token) embedding for `seq_id`.
    fn embed(&self, seq_id: SeqId, n_embd: usize) -> Result<Vec<f32>, BackendError>;

    fn seq_rm(&self, seq_id: SeqId, p0: i32, p1: i32);
    fn seq_add(&self, seq_id: SeqId, p0: i32, p1: i32, delta: i32);
    fn seq_cp(&self, src: SeqId, dst: SeqId, p0: i32, p1: i32);
    fn seq_keep(&self, seq_id: SeqId);

    fn state_get(&self, seq_id: SeqId) -> Result<Vec<u8>, BackendError>;
    fn state_set(&self, seq_id: SeqId, data: &[u8]) -> Result<(), BackendError>;

    /// Partial sequence state between two positions, for [C3] checkpoints.
    fn state_get_partial(&self, seq_id: SeqId, pos_min: i32, pos_max: i32) -> Result<Vec<u8>, BackendError>;
    fn state_set_partial(&self, seq_id: SeqId, data: &[u8]) -> Result<(), BackendError>;

    fn memory_can_shift(&self) -> bool;
    fn memory_uses_swa_or_recurrent(&self) -> bool;
    fn memory_pos_min(&self, seq_id: SeqId) -> Option<i32>;
    fn memory_pos_max(&self, seq_id: SeqId) -> Option<i32>;

    /// The model's sliding-window size (llama.cpp's `hparams.n_swa`), or `0`
    /// for a model that attends over its full context. Drives the checkpoint
    /// recovery threshold at `Scheduler::begin_prompt_processing` (spec.md
    /// §4.4 step 5's `pos_min_thold`), so it must agree with
    /// [`Backend::memory_uses_swa_or_recurrent`] about which models actually
    /// need checkpointing.
    fn memory_swa_window(&self) -> i32;

    async fn process_media_chunk(
        &self,
        bytes: &[u8],
        kind: MediaKind,
        start_pos: usize,
        seq_id: SeqId,
    ) -> Result<(), BackendError>;

    fn set_adapter_lora(&self, seq_id: SeqId, adapters: &[(String, f32)]);

    /// Whether this backend was loaded with any multimodal projector.
    fn is_multimodal(&self) -> bool;

    /// The gguf's embedded `tokenizer.chat_template` metadata string, if any
    /// (SPEC_FULL.md §16 "/props fields" `chat_template`).
    fn chat_template(&self) -> Option<&str>;

    /// Render `messages` (an OpenAI-shaped `[{role, content}]` array, plus
    /// optional `tools`) through the model's chat template, the way
    /// `/apply-template` and chat-completion prompt-building both need
    /// (spec.md §6 `/apply-template`).
    fn apply_chat_template(&self, messages_json: &str, tools_json: Option<&str>, add_generation_prompt: bool) -> Result<String, BackendError>;
}

/// A small second backend used for speculative draft generation
/// (spec.md §4.4 step 8 / GLOSSARY "Speculative decoding"). Mirrors the main
/// `Backend` but only needs decode+sample+tokenize-adjacent operations.
#[async_trait]
pub trait DraftBackend: Send + Sync {
    async fn propose(
        &self,
        seq_id: SeqId,
        context_tokens: &[i32],
        n_draft_max: usize,
    ) -> Result<Vec<i32>, BackendError>;
}

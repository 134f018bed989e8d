//! [C12] Public facade: the thin wrapper spec.md §4.9 describes —
//! `load_model`, `start_loop`, `terminate`, `get_response_reader`,
//! `get_meta` — that the HTTP layer and the CLI REPL both sit on top of.
//! Grounded on the teacher's `hub.rs` (the process that owns the backend
//! and exposes a handle other parts of the binary talk to), generalized
//! from a unix-socket hub to an in-process scheduler handle.

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::backend::{Backend, ConcreteBackend, DraftBackend, PoolingType};
use crate::config::Config;
use crate::lora::AdapterInfo;
use crate::metrics::Metrics;
use crate::queue::TaskQueue;
use crate::reader::ResponseReader;
use crate::response::ResponseQueue;
use crate::scheduler::Scheduler;
use crate::sampler::SamplerConfig;

/// Snapshot handed to HTTP handlers that format `/props`, `/api/show`,
/// `/models`, and chat-template rendering (spec.md §4.9 `get_meta`,
/// SPEC_FULL.md §16 "`/props` fields").
#[derive(Debug, Clone, serde::Serialize)]
pub struct MetaSnapshot {
    pub model_name: String,
    pub model_path: String,
    pub n_vocab: i32,
    pub bos_token: Option<String>,
    pub eos_tokens: Vec<String>,
    pub fim_pre: Option<i32>,
    pub fim_suf: Option<i32>,
    pub fim_mid: Option<i32>,
    pub has_chat_template: bool,
    pub chat_template: String,
    pub pooling_type: String,
    pub n_ctx_per_slot: usize,
    pub total_slots: u32,
    pub modalities: Modalities,
    pub default_generation_settings: SamplerConfig,
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct Modalities {
    pub vision: bool,
    pub audio: bool,
}

/// Owns the scheduler thread and the two cross-thread queues (spec.md §5:
/// "The task queue and response queue are the only cross-thread shared
/// state"). One instance per running server; the CLI's `--interactive`
/// mode constructs one in-process exactly like the HTTP server does.
pub struct Server {
    pub config: Arc<Config>,
    pub backend: Arc<dyn Backend>,
    pub draft_backend: Option<Arc<dyn DraftBackend>>,
    pub queue: Arc<TaskQueue>,
    pub responses: Arc<ResponseQueue>,
    pub metrics: Arc<Metrics>,
    meta: MetaSnapshot,
    lora_available: Vec<AdapterInfo>,
    loop_handle: Option<JoinHandle<()>>,
    terminate: Arc<std::sync::atomic::AtomicBool>,
}

impl Server {
    /// `load_model` (spec.md §4.9): initializes the backend, speculative
    /// backend, allocates slots, and constructs the meta snapshot. Does not
    /// start the scheduler loop yet.
    pub fn load_model(config: Config) -> eyre::Result<Self> {
        let config = Arc::new(config);
        tracing::info!(model = %config.model_path.display(), "facade: loading model");

        let backend = Arc::new(ConcreteBackend::load(
            config.model_path.to_string_lossy().as_ref(),
            config.ctx_size,
            config.batch_size,
            config.n_parallel,
        )?);

        // spec.md §4.9 "speculative backend": a second, smaller model
        // loaded only when `--draft-model` is given. One context, one
        // sequence (id 0), shared across whichever slot is drafting this
        // scheduler iteration — see DraftBackend impl on LlamaBackend.
        let draft_backend: Option<Arc<dyn DraftBackend>> = match &config.draft_model_path {
            Some(path) => {
                tracing::info!(draft_model = %path.display(), "facade: loading speculative draft model");
                let draft = ConcreteBackend::load(path.to_string_lossy().as_ref(), config.ctx_size, config.batch_size, 1)?;
                Some(Arc::new(draft) as Arc<dyn DraftBackend>)
            }
            None => None,
        };

        let vocab = backend.vocab().clone();
        let model_name = config
            .model_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unknown".to_string());

        let meta = MetaSnapshot {
            model_name,
            model_path: config.model_path.to_string_lossy().into_owned(),
            n_vocab: vocab.n_vocab,
            bos_token: vocab.bos.and_then(|id| backend.token_to_piece(id, true).ok()).map(|b| String::from_utf8_lossy(&b).into_owned()),
            eos_tokens: vocab
                .eos
                .iter()
                .filter_map(|&id| backend.token_to_piece(id, true).ok())
                .map(|b| String::from_utf8_lossy(&b).into_owned())
                .collect(),
            fim_pre: vocab.fim_pre,
            fim_suf: vocab.fim_suf,
            fim_mid: vocab.fim_mid,
            has_chat_template: backend.chat_template().is_some(),
            chat_template: backend.chat_template().unwrap_or_default().to_string(),
            pooling_type: pooling_name(backend.pooling_type()).to_string(),
            n_ctx_per_slot: if config.ctx_size == 0 { backend.n_ctx_train() } else { config.ctx_size as usize },
            total_slots: config.n_parallel,
            modalities: Modalities { vision: backend.is_multimodal(), audio: false },
            default_generation_settings: SamplerConfig::default(),
        };

        Ok(Self {
            config,
            backend,
            draft_backend,
            queue: Arc::new(TaskQueue::new()),
            responses: ResponseQueue::new(),
            metrics: Arc::new(Metrics::new()),
            meta,
            lora_available: Vec::new(),
            loop_handle: None,
            terminate: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        })
    }

    pub fn get_meta(&self) -> &MetaSnapshot {
        &self.meta
    }

    /// `start_loop` (spec.md §4.9): spins the scheduler up on its own OS
    /// thread. Idempotent: a second call is a no-op.
    pub fn start_loop(&mut self) {
        if self.loop_handle.is_some() {
            return;
        }
        let backend = self.backend.clone();
        let queue = self.queue.clone();
        let responses = self.responses.clone();
        let metrics = self.metrics.clone();
        let config = self.config.clone();
        let lora_available = self.lora_available.clone();
        let draft_backend = self.draft_backend.clone();

        let mut scheduler = Scheduler::new(backend, draft_backend, queue, responses, metrics, config, lora_available);
        self.terminate = scheduler.terminate_handle();
        self.loop_handle = Some(std::thread::spawn(move || scheduler.run()));
    }

    /// `terminate` (spec.md §4.9): signals the scheduler loop to stop and
    /// joins its thread.
    pub fn terminate(&mut self) {
        self.terminate.store(true, Ordering::Relaxed);
        if let Some(handle) = self.loop_handle.take() {
            let _ = handle.join();
        }
    }

    /// `get_response_reader` (spec.md §4.9): one per inbound HTTP request.
    pub fn get_response_reader(&self) -> ResponseReader {
        ResponseReader::new(
            self.queue.clone(),
            self.responses.clone(),
            Duration::from_secs(self.config.polling_interval_s),
        )
    }
}

fn pooling_name(p: PoolingType) -> &'static str {
    match p {
        PoolingType::None => "none",
        PoolingType::Mean => "mean",
        PoolingType::Cls => "cls",
        PoolingType::Last => "last",
        PoolingType::Rank => "rank",
    }
}

/// Used by `--model`-less startup error messages at the CLI layer
/// (discovery already resolved a concrete path by the time `Config`
/// exists, so this only re-states it for logging).
pub fn describe_model_path(path: &std::path::Path) -> PathBuf {
    path.to_path_buf()
}

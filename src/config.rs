//! Process configuration: `clap`-derived CLI args (SPEC_FULL.md §2
//! "CLI & config"), resolved into the immutable [`Config`] the facade and
//! HTTP layer share.

use std::net::IpAddr;
use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "emberd", version, about = "Local LLM inference server")]
pub struct Args {
    /// Path to a .gguf model file. Auto-discovered under conventional
    /// weight directories when omitted (src/discovery.rs).
    #[arg(long, env = "EMBER_MODEL")]
    pub model: Option<PathBuf>,

    /// Path to a smaller .gguf model used for speculative decoding drafts.
    #[arg(long, env = "EMBER_DRAFT_MODEL")]
    pub draft_model: Option<PathBuf>,

    #[arg(long, default_value = "127.0.0.1")]
    pub host: IpAddr,

    #[arg(long, default_value_t = 8080)]
    pub port: u16,

    /// Context window per slot. 0 picks a size from free VRAM (backend::sizing).
    #[arg(long, default_value_t = 0)]
    pub ctx_size: u32,

    #[arg(long, default_value_t = 2048)]
    pub batch_size: u32,

    /// Number of concurrent generation slots (spec.md C6).
    #[arg(long, default_value_t = 4)]
    pub parallel: u32,

    #[arg(long)]
    pub embeddings: bool,

    #[arg(long)]
    pub reranking: bool,

    /// Directory slot save/restore/erase is allowed to read and write.
    #[arg(long)]
    pub slot_save_path: Option<PathBuf>,

    #[arg(long)]
    pub metrics: bool,

    /// Expose full prompt text on GET /slots (default: redacted).
    #[arg(long)]
    pub slots_endpoint: bool,

    #[arg(long)]
    pub no_context_shift: bool,

    /// RAM budget for the prompt cache, in MiB. 0 disables it.
    #[arg(long, default_value_t = 8192)]
    pub cache_ram_mib: usize,

    /// Checkpoints retained per slot for SWA/recurrent-memory recovery.
    #[arg(long, default_value_t = 8)]
    pub n_ctx_checkpoints: usize,

    #[arg(long, default_value_t = 0)]
    pub idle_sleep_ms: u64,

    /// Seconds a response reader blocks per poll of the response queue.
    #[arg(long, default_value_t = 1)]
    pub polling_interval_s: u64,

    /// Reject a request outright when no slot is free, instead of queueing it.
    #[arg(long)]
    pub fail_on_no_slot: bool,

    /// Similarity threshold (LCP / new-prompt-length) an idle slot's cached
    /// prompt must clear to be preferred over LRU (spec.md §4.4 step 2).
    #[arg(long, default_value_t = 0.1)]
    pub slot_prompt_similarity: f32,

    /// One or more `Bearer` API keys; unset disables auth entirely.
    #[arg(long, env = "EMBER_API_KEY")]
    pub api_key: Vec<String>,

    #[arg(long)]
    pub verbose: bool,

    /// Launch the interactive REPL against a server this process starts,
    /// instead of serving forever.
    #[arg(long)]
    pub interactive: bool,

    /// For `--interactive`: connect to an already-running server instead of
    /// spawning one.
    #[arg(long)]
    pub connect: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub model_path: PathBuf,
    pub draft_model_path: Option<PathBuf>,
    pub host: IpAddr,
    pub port: u16,
    pub ctx_size: u32,
    pub batch_size: u32,
    pub n_parallel: u32,
    pub embeddings: bool,
    pub reranking: bool,
    pub slot_save_path: Option<PathBuf>,
    pub metrics: bool,
    pub slots_endpoint: bool,
    pub expose_slot_prompts: bool,
    pub ctx_shift: bool,
    pub cache_ram_mib: usize,
    pub n_ctx_checkpoints: usize,
    pub idle_sleep_ms: u64,
    pub polling_interval_s: u64,
    pub fail_on_no_slot: bool,
    pub slot_prompt_similarity: f32,
    pub api_keys: Vec<String>,
    pub verbose: bool,
}

impl Config {
    pub fn from_args(args: &Args) -> eyre::Result<Self> {
        let model_path = match &args.model {
            Some(p) => p.clone(),
            None => crate::discovery::choose_best_model_path()
                .ok_or_else(|| eyre::eyre!("no --model given and no .gguf found by auto-discovery"))?,
        };
        Ok(Self {
            model_path,
            draft_model_path: args.draft_model.clone(),
            host: args.host,
            port: args.port,
            ctx_size: args.ctx_size,
            batch_size: args.batch_size,
            n_parallel: args.parallel.max(1),
            embeddings: args.embeddings,
            reranking: args.reranking,
            slot_save_path: args.slot_save_path.clone(),
            metrics: args.metrics,
            slots_endpoint: args.slots_endpoint,
            expose_slot_prompts: args.slots_endpoint,
            ctx_shift: !args.no_context_shift,
            cache_ram_mib: args.cache_ram_mib,
            n_ctx_checkpoints: args.n_ctx_checkpoints,
            idle_sleep_ms: args.idle_sleep_ms,
            polling_interval_s: args.polling_interval_s.max(1),
            fail_on_no_slot: args.fail_on_no_slot,
            slot_prompt_similarity: args.slot_prompt_similarity,
            api_keys: args.api_key.clone(),
            verbose: args.verbose,
        })
    }
}

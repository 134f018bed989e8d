//! [C11] Metrics: cumulative and windowed counters (spec.md §2/§4.4 step 10),
//! rendered as Prometheus text exposition on `GET /metrics`
//! (SPEC_FULL.md §13).

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Instant;

#[derive(Debug, Default)]
pub struct Metrics {
    pub n_prompt_tokens_total: AtomicU64,
    pub n_tokens_predicted_total: AtomicU64,
    pub n_decode_total: AtomicU64,
    pub n_busy_slots_total: AtomicU64,
    t_prompt_processing_total_us: AtomicU64,
    t_tokens_generation_total_us: AtomicU64,
    n_prompt_tokens_processed_total: AtomicU64,
    n_tokens_predicted_windowed: AtomicU64,
    window_start: std::sync::Mutex<Instant>,
    kv_cache_used_cells: AtomicI64,
    kv_cache_size_cells: AtomicI64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSnapshot {
    pub n_prompt_tokens_total: u64,
    pub n_tokens_predicted_total: u64,
    pub n_decode_total: u64,
    pub n_busy_slots_total: u64,
    pub t_prompt_processing_total_ms: f64,
    pub t_tokens_generation_total_ms: f64,
    pub n_prompt_tokens_processed_total: u64,
    pub kv_cache_used_cells: i64,
    pub kv_cache_size_cells: i64,
    pub kv_cache_usage_ratio: f64,
}

impl Metrics {
    pub fn new() -> Self {
        Self { window_start: std::sync::Mutex::new(Instant::now()), ..Default::default() }
    }

    pub fn on_prompt_processed(&self, n_tokens: usize, elapsed_us: u64) {
        self.n_prompt_tokens_total.fetch_add(n_tokens as u64, Ordering::Relaxed);
        self.n_prompt_tokens_processed_total.fetch_add(n_tokens as u64, Ordering::Relaxed);
        self.t_prompt_processing_total_us.fetch_add(elapsed_us, Ordering::Relaxed);
    }

    pub fn on_token_predicted(&self, elapsed_us: u64) {
        self.n_tokens_predicted_total.fetch_add(1, Ordering::Relaxed);
        self.n_tokens_predicted_windowed.fetch_add(1, Ordering::Relaxed);
        self.t_tokens_generation_total_us.fetch_add(elapsed_us, Ordering::Relaxed);
    }

    pub fn on_decode_call(&self, n_busy_slots: usize) {
        self.n_decode_total.fetch_add(1, Ordering::Relaxed);
        self.n_busy_slots_total.fetch_add(n_busy_slots as u64, Ordering::Relaxed);
    }

    pub fn set_kv_cache_usage(&self, used_cells: i64, size_cells: i64) {
        self.kv_cache_used_cells.store(used_cells, Ordering::Relaxed);
        self.kv_cache_size_cells.store(size_cells, Ordering::Relaxed);
    }

    pub fn reset_bucket(&self) {
        self.n_tokens_predicted_windowed.store(0, Ordering::Relaxed);
        *self.window_start.lock().unwrap() = Instant::now();
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let used = self.kv_cache_used_cells.load(Ordering::Relaxed);
        let size = self.kv_cache_size_cells.load(Ordering::Relaxed).max(1);
        MetricsSnapshot {
            n_prompt_tokens_total: self.n_prompt_tokens_total.load(Ordering::Relaxed),
            n_tokens_predicted_total: self.n_tokens_predicted_total.load(Ordering::Relaxed),
            n_decode_total: self.n_decode_total.load(Ordering::Relaxed),
            n_busy_slots_total: self.n_busy_slots_total.load(Ordering::Relaxed),
            t_prompt_processing_total_ms: self.t_prompt_processing_total_us.load(Ordering::Relaxed) as f64 / 1000.0,
            t_tokens_generation_total_ms: self.t_tokens_generation_total_us.load(Ordering::Relaxed) as f64 / 1000.0,
            n_prompt_tokens_processed_total: self.n_prompt_tokens_processed_total.load(Ordering::Relaxed),
            kv_cache_used_cells: used,
            kv_cache_size_cells: size,
            kv_cache_usage_ratio: used as f64 / size as f64,
        }
    }

    /// Prometheus text exposition format (SPEC_FULL.md §13).
    pub fn render_prometheus(&self) -> String {
        let s = self.snapshot();
        let mut out = String::new();
        let mut line = |name: &str, help: &str, kind: &str, value: f64| {
            out.push_str(&format!("# HELP {name} {help}\n# TYPE {name} {kind}\n{name} {value}\n"));
        };
        line(
            "llamacpp:prompt_tokens_total",
            "Number of prompt tokens processed.",
            "counter",
            s.n_prompt_tokens_total as f64,
        );
        line(
            "llamacpp:tokens_predicted_total",
            "Number of generated tokens.",
            "counter",
            s.n_tokens_predicted_total as f64,
        );
        line("llamacpp:n_decode_total", "Number of decode() calls.", "counter", s.n_decode_total as f64);
        line(
            "llamacpp:n_busy_slots_per_decode",
            "Average busy slots per decode call.",
            "gauge",
            if s.n_decode_total == 0 { 0.0 } else { s.n_busy_slots_total as f64 / s.n_decode_total as f64 },
        );
        line("llamacpp:kv_cache_usage_ratio", "KV cache usage, 0..1.", "gauge", s.kv_cache_usage_ratio);
        out
    }
}

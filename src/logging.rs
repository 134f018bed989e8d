//! `tracing` + `tracing-subscriber` setup (SPEC_FULL.md §2 "Logging"),
//! mirroring the teacher's `tracing_subscriber::fmt` usage but plain: no
//! display pump, just an env-filtered formatter on stderr. Per-slot/
//! per-task fields (`id_slot`, `id_task`) are attached at the call sites in
//! `scheduler.rs`/`http/` via `tracing::info_span!`, the way
//! `server-context.cpp`'s `SLT_INF`/`SRV_INF` macros tag their log lines.

pub fn init(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init();

    gg::send_logs_to_tracing(gg::LogOptions::default().with_logs_enabled(verbose));
}

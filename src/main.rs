//! Command-line entrypoint: parses `Args`, resolves `Config`, and either
//! serves HTTP forever or drives the interactive REPL (SPEC_FULL.md §2/§17).

use clap::Parser;
use eyre::Result;

pub mod backend;
pub mod chat_parser;
pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod discovery;
pub mod error;
pub mod facade;
pub mod grammar;
pub mod http;
pub mod logging;
pub mod lora;
pub mod media;
pub mod metrics;
pub mod prompt_cache;
pub mod queue;
pub mod reader;
pub mod response;
pub mod sampler;
pub mod scheduler;
pub mod slot;
pub mod task;
pub mod token_buf;

use config::{Args, Config};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Some(base_url) = args.connect.clone() {
        logging::init(args.verbose);
        return cli::repl::run(base_url).await;
    }

    let config = Config::from_args(&args)?;
    logging::init(config.verbose);

    let mut server = facade::Server::load_model(config)?;
    server.start_loop();
    let server = std::sync::Arc::new(server);

    let addr = format!("{}:{}", server.config.host, server.config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let router = http::build_router(server.clone());

    if args.interactive {
        tracing::info!(%addr, "emberd: listening (interactive)");
        let serve = tokio::spawn(async move { axum::serve(listener, router).await });
        let result = cli::repl::run(format!("http://{addr}")).await;
        serve.abort();
        return result;
    }

    tracing::info!(%addr, "emberd: listening");
    axum::serve(listener, router).await?;
    Ok(())
}

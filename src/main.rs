//! DQL Engine Server
//!
//! Run with: cargo run --bin dql-engine -- --config config.toml
//!
//! Without `--config` the usual locations are searched, then defaults with
//! `DQL_*` environment overrides are used. `RUST_LOG` overrides the
//! configured log level.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dql_engine::api::{serve, AppState};
use dql_engine::config::{Config, LoggingConfig};

#[derive(Parser)]
#[command(name = "dql-engine")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "DQL query engine server")]
struct Args {
    /// Config file (default: search standard locations)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("dql_engine={},tower_http=info", logging.level).into()
    });
    let registry = tracing_subscriber::registry().with(filter);

    if logging.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => Config::load_with_env(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => Config::load_default(),
    };

    init_tracing(&config.logging);
    tracing::info!("Starting DQL engine v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        instances = config.timeseries.instances.len(),
        workspaces = config.workspaces.len(),
        search = %config.search.url,
        "backends configured"
    );

    let state = AppState::from_config(&config).context("starting engine")?;
    let warmup = state.index_cache.clone().and_then(|cache| cache.start());

    serve(state, &config.api).await?;

    if let Some(handle) = warmup {
        handle.abort();
    }
    tracing::info!("DQL engine shutdown complete");
    Ok(())
}

//! Cicero scheduling daemon.
//!
//! Loads `cicero.yaml`, wires the engine, and runs the supervised
//! component set until interrupted. The external collaborators are filled
//! with the development implementations: the path-equality constraint
//! evaluator and an in-process job runner that completes every job it is
//! handed.

mod dev_runner;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use cicero_config::ObservabilityConfig;
use cicero_runtime::{EqualityEvaluator, RuntimeApp};

use crate::dev_runner::DevRunner;

#[derive(Debug, Parser)]
#[command(name = "cicerod", about = "Cicero scheduling daemon")]
struct Args {
    /// Path to the configuration file.
    #[arg(short, long, default_value = "cicero.yaml")]
    config: PathBuf,
}

fn init_tracing(config: &ObservabilityConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_new(&config.log_level)
        .with_context(|| format!("invalid log level '{}'", config.log_level))?;
    match config.log_format.as_str() {
        "json" => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init(),
        _ => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = cicero_config::load_config(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    init_tracing(&config.observability)?;

    tracing::info!(
        app = %config.app.name,
        environment = %config.app.environment,
        backend = %config.db.backend,
        "starting cicerod"
    );

    let app = RuntimeApp::build(
        &config,
        Arc::new(Mutex::new(EqualityEvaluator)),
        Arc::new(DevRunner::new()),
    )
    .await?;

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested");
            shutdown.cancel();
        }
    });

    app.run(cancel).await?;
    tracing::info!("cicerod stopped");
    Ok(())
}

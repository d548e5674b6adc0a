use tokio::signal::unix::{signal, SignalKind};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{
    filter::Targets,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::cli::{arguments, node::Node};
use crate::config::{LoggerConfig, NodeConfig};

pub async fn run(args: arguments::Run) -> eyre::Result<()> {
    let config = NodeConfig::from_path(args.config)?;
    init_tracing(&config.logger)?;

    let node = Node::new(config);
    // Startup errors (bind failure, bad bridge config) abort here.
    node.run().await?;

    tokio::select! {
        _ = node.cancelled() => {
            tracing::warn!("a service stopped on its own, shutting down");
        }
        name = shutdown_signal() => {
            tracing::info!(signal = name, "shutdown requested");
        }
    }

    node.shutdown().await;

    Ok(())
}

/// Crate-scoped filtering at the configured level, with `RUST_LOG`
/// layered on top for ad-hoc overrides.
fn init_tracing(logger: &LoggerConfig) -> eyre::Result<()> {
    let crates = Targets::new()
        .with_targets([
            ("ysfrd", logger.level),
            ("ysfr_core", logger.level),
            ("ysfr_bridge", logger.level),
            ("ysfr_protocol", logger.level),
        ])
        .with_default(logger.level);

    let overrides = EnvFilter::builder()
        .with_default_directive(LevelFilter::DEBUG.into())
        .from_env()?;

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(crates))
        .with(overrides)
        .try_init()?;

    Ok(())
}

/// Resolves to the name of whichever termination signal arrives first.
async fn shutdown_signal() -> &'static str {
    let mut interrupt = signal(SignalKind::interrupt()).expect("SIGINT handler must install");
    let mut terminate = signal(SignalKind::terminate()).expect("SIGTERM handler must install");

    tokio::select! {
        _ = interrupt.recv() => "SIGINT",
        _ = terminate.recv() => "SIGTERM",
    }
}

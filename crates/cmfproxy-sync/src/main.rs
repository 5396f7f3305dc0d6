//! CMF Proxy - edge bundle sync daemon

use anyhow::{Context, Result};
use clap::Parser;
use cmfproxy_common::logging::{init_logging, LogConfig, LogLevel};
use cmfproxy_sync::{config::Config, orchestrator::SyncOrchestrator};
use std::path::PathBuf;
use tokio::signal;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "cmfproxy")]
#[command(author, version, about = "Sync edge-node CMF bundles into a CMF server")]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(short, long, env = "CMFPROXY_CONFIG", default_value = "config.json")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Run a single cycle and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("cmfproxy")
        .filter_directives("reqwest=info,hyper=warn")
        .build()
        // Environment variables take precedence
        .with_env_overrides()?;

    let _log_guard = init_logging(&log_config)?;

    info!(config = %cli.config.display(), "Starting CMF proxy");

    let config = Config::load(&cli.config)
        .with_context(|| format!("failed to load configuration from {}", cli.config.display()))?;
    info!(
        nodes = config.sage_server.nodes.len(),
        pipeline = %config.pipeline.pipeline_name,
        state_dir = %config.sync.state_dir.display(),
        "Configuration loaded"
    );

    let orchestrator = SyncOrchestrator::from_config(&config)?;

    let result = if cli.once {
        orchestrator.run_cycle().await.map(|_| ())
    } else {
        orchestrator.run_forever(shutdown_signal()).await
    };

    if let Err(e) = result {
        error!(error = %e, "Fatal error, stopping");
        return Err(e.into());
    }

    info!("CMF proxy stopped");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = until_signal("Ctrl+C", signal::ctrl_c());

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}

/// Wait for a signal; a handler that cannot be installed never fires
async fn until_signal<F>(name: &str, wait: F)
where
    F: std::future::Future<Output = std::io::Result<()>>,
{
    if let Err(e) = wait.await {
        error!("Failed to install {} handler: {}", name, e);
        std::future::pending::<()>().await;
    }
}

//! SubnetX Monitor - VPN client monitoring daemon
//!
//! Probes every configured client for latency and loss, reads per-client
//! traffic from the OpenVPN status file, tracks connection state, and keeps
//! the results in JSON documents for the dashboard.

mod collector;
mod config;
mod logging;
mod probe;
mod registry;
mod scheduler;
mod source;
mod store;

use clap::Parser;
use config::{Cli, MonitorConfig};
use scheduler::Orchestrator;
use store::Store;

use std::process::ExitCode;
use std::sync::Arc;

#[tokio::main]
async fn main() -> ExitCode {
    let cfg = match MonitorConfig::from_cli(Cli::parse()) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("subnetx-monitor: configuration error: {}", e);
            return ExitCode::from(2);
        }
    };

    if let Err(e) = logging::init(&cfg.log_dir, cfg.log_max_bytes, cfg.verbose) {
        eprintln!("subnetx-monitor: cannot set up logging: {}", e);
        return ExitCode::from(1);
    }

    match run(cfg).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("Fatal: {}", e);
            ExitCode::from(1)
        }
    }
}

async fn run(cfg: MonitorConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing::info!("Starting SubnetX monitor with {} targets", cfg.targets.len());
    for host in &cfg.duplicate_hosts {
        tracing::warn!("Config: Target {} listed more than once, keeping the first entry", host);
    }
    tracing::info!("Using data directory {}", cfg.data_dir.display());
    tracing::info!("Reading sessions from {}", cfg.status_file.display());

    let store = Arc::new(Store::open(&cfg.data_dir)?);

    let orchestrator = Orchestrator::new(cfg, store);
    orchestrator.run(shutdown_signal()).await?;

    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

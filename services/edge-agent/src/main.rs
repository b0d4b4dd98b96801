//! edgecdn Edge Agent
//!
//! Runs on each edge node and keeps the local nginx routing configuration
//! in sync with the control plane.
//!
//! ## Lifecycle
//!
//! - **Bootstrap**: load the stored node identity, or register and store it.
//!   Failing to obtain an identity exits with status 1.
//! - **Reconcile**: every interval, fetch desired state, render it and
//!   apply it to nginx.
//! - **Shutdown**: on Ctrl-C / SIGTERM, finish the current cycle and exit.

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use edgecdn_edge_agent::config::Config;
use edgecdn_edge_agent::proxy::CommandProxyControl;
use edgecdn_edge_agent::reconciler::Reconciler;

/// Keeps nginx routing in sync with the edgecdn control plane.
#[derive(Debug, Parser)]
#[command(name = "edge-agent", version, about)]
struct Cli {
    /// Control plane base URL (example: http://panel.example.com/api).
    control_plane_url: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env(&cli.control_plane_url)?;

    // Initialize tracing (prefer RUST_LOG, fallback to EDGE_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting edgecdn edge agent");
    info!(
        control_plane_url = %config.control_plane_url,
        credentials_path = %config.credentials_path.display(),
        available_path = %config.proxy.available_path.display(),
        enabled_path = %config.proxy.enabled_path.display(),
        reconcile_interval_secs = config.reconcile_interval.as_secs(),
        empty_state_policy = ?config.proxy.empty_state_policy,
        "Configuration loaded"
    );

    let control = Arc::new(CommandProxyControl::new(&config.proxy));
    let mut reconciler = Reconciler::new(&config, control)?;

    if let Err(e) = reconciler.bootstrap().await {
        error!(error = %format!("{e:#}"), "Could not obtain a node identity");
        std::process::exit(1);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut reconciler_handle = tokio::spawn(reconciler.run(shutdown_rx));

    tokio::select! {
        _ = shutdown_signal() => {
            info!("Received shutdown signal");
        }
        result = &mut reconciler_handle => {
            if let Err(e) = result {
                error!(error = %e, "Reconciler task panicked");
                std::process::exit(1);
            }
            info!("Reconciler exited");
            return Ok(());
        }
    }

    // The current cycle is allowed to finish before the loop observes this.
    let _ = shutdown_tx.send(true);
    if let Err(e) = reconciler_handle.await {
        error!(error = %e, "Reconciler task panicked during shutdown");
    }

    info!("Edge agent shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

use axum::Router;
use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use gatekeeper::admission::AdmissionController;
use gatekeeper::config::GatekeeperConfig;
use gatekeeper::http::{router, AppState, HttpServer};
use gatekeeper::security::{SecurityEvent, Sweeper};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "gatekeeper", version, about = "Request admission control service")]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Override the listen address from the configuration
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Log output format
    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    info!("Starting Gatekeeper admission control service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = GatekeeperConfig::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }
    info!(
        listen_addr = %config.server.listen_addr,
        per_ip_rps = config.rate_limiting.per_ip_rps,
        endpoint_overrides = config.rate_limiting.endpoint_limits.len(),
        "Configuration loaded"
    );

    let controller = Arc::new(AdmissionController::new(config.rate_limiting.clone())?);
    info!("Admission controller initialized");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = Sweeper::new(controller.clone()).spawn(shutdown_rx);
    tokio::spawn(log_security_events(controller.subscribe()));

    let state = AppState {
        controller,
        trust_forwarded_headers: config.server.trust_forwarded_headers,
    };
    let server = HttpServer::new(config.server.listen_addr, router(state, Router::new()));

    server.serve_with_shutdown(shutdown_signal()).await?;

    let _ = shutdown_tx.send(true);
    sweeper.await?;

    info!("Gatekeeper stopped");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn log_security_events(mut events: broadcast::Receiver<SecurityEvent>) {
    loop {
        match events.recv().await {
            Ok(SecurityEvent::AutoBanned { ip, reason, expires_at }) => {
                warn!(ip = %ip, reason = %reason, expires_at = %expires_at, "Security event: auto-ban");
            }
            Ok(event) => {
                debug!(ip = %event.ip(), event = ?event, "Security event");
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Security event log lagging, events dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}

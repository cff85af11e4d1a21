//! Silo level monitor over Modbus RTU.
//!
//! Polls each configured slave's level register on a fixed cycle and
//! serves the latest readings over HTTP.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use silo_monitor::alerts::{AlertManager, TelegramNotifier};
use silo_monitor::config::{LogFormat, MonitorConfig};
use silo_monitor::health::MonitorHealth;
use silo_monitor::http::{ApiState, HttpServer};
use silo_monitor::poller::Poller;
use silo_monitor::store::ReadingStore;
use silo_monitor::transport::RtuTransport;

/// Silo level monitor for Modbus RTU slaves.
#[derive(Parser, Debug)]
#[command(name = "silo-monitor")]
#[command(about = "Polls silo level sensors over Modbus RTU and serves the readings")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format)
    #[arg(short, long, default_value = "silo-monitor.json5")]
    config: PathBuf,

    /// HTTP listen address (overrides config)
    #[arg(long)]
    listen: Option<String>,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = MonitorConfig::load_from_file(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    if let Some(listen) = args.listen {
        config.http.listen = listen;
    }

    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match config.logging.format {
        LogFormat::Json => tracing_subscriber::fmt().with_env_filter(filter).json().init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }

    info!("Starting silo-monitor {}", env!("CARGO_PKG_VERSION"));
    for warning in config.warnings() {
        warn!("{}", warning);
    }

    let silos = config.resolved_silos();
    info!(
        silos = silos.len(),
        port = %config.serial.port,
        listen = %config.http.listen,
        "configuration loaded"
    );

    let listen_addr = config
        .http
        .listen
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid listen address: {}", e))?;

    let store = Arc::new(ReadingStore::new(silos.iter().map(|s| s.id)));
    let health = Arc::new(MonitorHealth::new(config.polling.staleness_threshold()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // The polling worker is the sole owner of the transport and the sole
    // writer to the store.
    let transport = RtuTransport::new(config.serial.clone(), config.polling.request_timeout());
    let poller = Poller::new(
        transport,
        silos.clone(),
        store.clone(),
        health.clone(),
        config.polling.clone(),
    );
    let poller_task = tokio::spawn(poller.run(shutdown_rx.clone()));

    let alert_task = if config.alerts.enabled {
        match TelegramNotifier::from_env(&config.alerts.telegram) {
            Ok(notifier) => {
                let manager = AlertManager::new(
                    notifier,
                    store.clone(),
                    &silos,
                    config.polling.staleness_threshold(),
                    config.alerts.cooldown(),
                    config.alerts.check_interval(),
                );
                Some(tokio::spawn(manager.run(shutdown_rx.clone())))
            }
            Err(e) => {
                error!("alerts disabled: {}", e);
                None
            }
        }
    } else {
        None
    };

    let state = ApiState::new(
        store.clone(),
        health.clone(),
        config.polling.staleness_threshold(),
        &silos,
    );
    let server = HttpServer::new(state, listen_addr);
    let http_shutdown = shutdown_rx.clone();
    let http_task = tokio::spawn(async move {
        if let Err(e) = server.run(http_shutdown).await {
            error!("HTTP server error: {}", e);
        }
    });

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        _ = async {
            #[cfg(unix)]
            {
                let mut sigterm = tokio::signal::unix::signal(
                    tokio::signal::unix::SignalKind::terminate()
                ).expect("failed to install SIGTERM handler");
                sigterm.recv().await;
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        } => {
            info!("Received SIGTERM, shutting down...");
        }
    }

    shutdown_tx.send(true)?;

    // The poller stops at its next checkpoint: at most one request timeout
    // plus one inter-request delay away.
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = poller_task.await;
        let _ = http_task.await;
        if let Some(task) = alert_task {
            let _ = task.await;
        }
    })
    .await;

    info!(cycles = health.cycles_completed(), "silo-monitor stopped");
    Ok(())
}

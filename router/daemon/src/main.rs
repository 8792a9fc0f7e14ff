//! Metrics Router Daemon
//!
//! Keeps the metric-key routing registry in line with the backends file.
//! Registrations are polled from a TOML file, reconciled against each
//! backend's advertised catalog, and routed by priority.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (./backends.toml, config from the XDG config dir)
//! metrics-router
//!
//! # Custom backends file and more workers
//! metrics-router --sources /etc/metrics-router/backends.toml --workers 4
//!
//! # Verbose logging
//! RUST_LOG=debug metrics-router
//! ```
//!
//! # Environment Variables
//!
//! - `METRICS_ROUTER_CONFIG`: Configuration file
//! - `METRICS_ROUTER_SOURCES`: Backends file
//! - `METRICS_ROUTER_WORKERS`: Reconcile worker count
//! - `METRICS_ROUTER_RESYNC_SECS`: Seconds between full resyncs
//! - `RUST_LOG`: Log level (trace, debug, info, warn, error)
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: Graceful shutdown
//! - `SIGHUP`: Re-read the backends file immediately

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use router_core::{
    default_config_path, load_config_from_path, BackendRegistry, ConfigOverrides,
    ControllerOptions, FileSourceStore, HttpDiscoveryGateway, ReconcileController,
    RegistrationEvent, RouterConfig,
};

/// Routes custom and external metric queries to registered metrics backends
#[derive(Parser, Debug)]
#[command(name = "metrics-router")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "METRICS_ROUTER_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Backends file to watch
    #[arg(short = 's', long, value_name = "FILE")]
    sources: Option<PathBuf>,

    /// Concurrent reconcile workers
    #[arg(short = 'w', long, value_name = "N")]
    workers: Option<usize>,

    /// Seconds between full resyncs
    #[arg(long, value_name = "SECS")]
    resync_secs: Option<u64>,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        let mut overrides = ConfigOverrides::new();
        if let Some(ref path) = self.sources {
            overrides = overrides.with_sources_path(path.clone());
        }
        if let Some(workers) = self.workers {
            overrides = overrides.with_workers(workers);
        }
        if let Some(secs) = self.resync_secs {
            overrides = overrides.with_resync_interval_secs(secs);
        }
        overrides
    }
}

/// File, then environment, then command line
fn resolve_config(args: &Args) -> Result<RouterConfig> {
    let path = args.config.clone().or_else(default_config_path);
    let mut config = load_config_from_path(path.clone())
        .with_context(|| format!("Failed to load configuration from {path:?}"))?;
    config.apply_env();
    args.overrides().apply(&mut config);
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Resolve once SIGINT or SIGTERM arrives
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
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
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C, shutting down"),
        () = terminate => info!("Received SIGTERM, shutting down"),
    }
}

/// Re-read the backends file on every SIGHUP until `shutdown` flips
#[cfg(unix)]
async fn reload_on_hangup(
    store: FileSourceStore,
    events: mpsc::Sender<RegistrationEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut hangup = match signal::unix::signal(signal::unix::SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            warn!(error = %e, "Failed to install SIGHUP handler; relying on polling");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            received = hangup.recv() => {
                if received.is_none() {
                    return;
                }
                info!(path = %store.path().display(), "Received SIGHUP, reloading backends file");
                match store.reload().await {
                    Ok(changes) => {
                        for event in changes {
                            if events.send(event).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "Reload failed; keeping previous registrations"),
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("router_daemon=info".parse()?)
                .add_directive("router_core=info".parse()?),
        )
        .with_target(true)
        .init();

    let args = Args::parse();
    info!("Starting metrics router");

    let config = resolve_config(&args)?;
    info!(
        source = ?config.source(),
        sources = %config.sources.path.display(),
        workers = config.reconcile.workers,
        resync_secs = config.reconcile.resync_interval_secs,
        "Configuration loaded"
    );

    let store = FileSourceStore::open(config.sources.path.clone())
        .await
        .with_context(|| {
            format!(
                "Failed to load backends file {}",
                config.sources.path.display()
            )
        })?;
    info!(registrations = store.len(), "Backends file loaded");

    let registry = BackendRegistry::new();
    let gateway = HttpDiscoveryGateway::from_config(&config.discovery);
    let controller = Arc::new(ReconcileController::new(
        registry.clone(),
        Arc::new(store.clone()),
        Arc::new(gateway),
        ControllerOptions::from_config(&config.reconcile),
    ));

    let (event_tx, event_rx) = mpsc::channel::<RegistrationEvent>(256);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let controller_task = tokio::spawn(Arc::clone(&controller).run(event_rx, shutdown_rx.clone()));

    let watcher_task = {
        let store = store.clone();
        let events = event_tx.clone();
        let shutdown = shutdown_rx.clone();
        let interval = Duration::from_secs(config.sources.poll_interval_secs);
        tokio::spawn(async move { store.watch(interval, events, shutdown).await })
    };

    #[cfg(unix)]
    let hangup_task = tokio::spawn(reload_on_hangup(
        store.clone(),
        event_tx.clone(),
        shutdown_rx.clone(),
    ));
    drop(event_tx);

    info!("Metrics router ready");

    let heartbeat_period = Duration::from_secs(config.daemon.heartbeat_interval_secs);
    let mut heartbeat = tokio::time::interval_at(
        tokio::time::Instant::now() + heartbeat_period,
        heartbeat_period,
    );
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            () = &mut shutdown => break,
            _ = heartbeat.tick() => {
                info!(
                    registry = %registry.summary(),
                    stats = %controller.stats(),
                    queued = controller.queue_len(),
                    "Heartbeat"
                );
            }
        }
    }

    // Graceful shutdown
    info!("Performing graceful shutdown...");
    if shutdown_tx.send(true).is_err() {
        warn!("All shutdown receivers already gone");
    }

    if let Err(e) = watcher_task.await {
        error!(error = %e, "Backends file watcher panicked");
    }
    #[cfg(unix)]
    {
        if let Err(e) = hangup_task.await {
            error!(error = %e, "SIGHUP handler panicked");
        }
    }
    controller_task
        .await
        .context("Reconcile controller panicked")?;

    info!(registry = %registry.summary(), "Metrics router stopped cleanly");
    Ok(())
}

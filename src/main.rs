#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # modemd
//!
//! Cellular modem discovery and management daemon.
//!
//! modemd ingests kernel hotplug records, probes candidate ports to find
//! modems, assembles them into managed modem objects, and exposes each one
//! through a message-bus-facing event surface. A bus binding (or any other
//! consumer) subscribes to the JSON event stream and feeds method calls
//! back through the command channel.

use clap::Parser;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter};

use modemd::config::Config;
use modemd::manager::DeviceManager;
use modemd::plugin::{builtin_plugins, PluginRegistry};
use modemd::stream::TtyOpener;
use modemd::surface::SurfaceHandle;
use modemd::{devicebus, hotplug};

/// Cellular modem discovery and management daemon.
#[derive(Parser)]
#[command(name = "modemd", version)]
struct Cli {
    /// Path to TOML config file.
    #[arg(long)]
    config: Option<String>,
    /// Hotplug record source (`-` = stdin); overrides the config file.
    #[arg(long)]
    hotplug: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref());
    if let Some(source) = cli.hotplug {
        config.daemon.hotplug_source = source;
    }

    // Filter behind a reload layer so the SetLogging surface method can
    // swap levels at runtime. RUST_LOG still wins at startup.
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    let (filter, reload_handle) = reload::Layer::new(EnvFilter::new(log_filter));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("modemd v{} starting", env!("CARGO_PKG_VERSION"));

    let registry = PluginRegistry::load(&builtin_plugins());
    if registry.is_empty() {
        tracing::error!("no usable plugins; exiting");
        std::process::exit(1);
    }

    let surface = SurfaceHandle::new();
    let (command_tx, command_rx) = mpsc::channel(32);

    // Keep one subscriber draining so early events are observable with
    // `modemd --hotplug - < records.jsonl` during bring-up.
    let mut event_log = surface.subscribe();
    let event_task = tokio::spawn(async move {
        while let Ok(event) = event_log.recv().await {
            info!(target: "modemd::surface", "{event}");
        }
    });

    let manager = DeviceManager::new(
        registry,
        std::sync::Arc::new(TtyOpener),
        surface,
        config.modem_config(),
        config.probe_config(),
        Some(reload_handle),
    );

    let records = hotplug::spawn(config.daemon.hotplug_source.clone());
    let device_events = devicebus::spawn(records, config.settle_window());

    let manager_task = tokio::spawn(manager.run(device_events, command_rx));

    // Graceful shutdown on SIGINT/SIGTERM.
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to register SIGTERM");
        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT"),
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }

    info!("Shutting down...");
    drop(command_tx);
    manager_task.abort();
    event_task.abort();
    info!("Goodbye");
}

//! usbip-agent binary
//!
//! Attaches remote USB/IP devices to this node's virtual host controller
//! and keeps their availability reconciled against the configured targets.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use async_channel::Receiver;
use clap::Parser;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

use agent::catalog::DeviceKey;
use agent::config::AgentConfig;
use agent::oracle::FixedUsage;
use agent::reconciler::DeviceManager;
use common::logging::setup_logging;
use vhci::{SysfsStore, VhciDriver};

#[derive(Parser, Debug)]
#[command(name = "usbip-agent", version)]
#[command(about = "Attach remote USB/IP devices to this node")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config_path = args.config.unwrap_or_else(AgentConfig::default_path);
    let config = AgentConfig::load(&config_path)?;
    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.agent.log_level)
        .to_owned();
    setup_logging(&log_level)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path.display(),
        "starting usbip-agent"
    );

    if config.resources.is_empty() {
        bail!("at least one device must be configured");
    }

    let store = SysfsStore::new(&config.agent.sysfs_root);
    let driver = VhciDriver::new(store, &config.agent.dev_root)
        .context("failed to initialize vhci driver; is the vhci_hcd module loaded?")?;
    info!(
        ports = driver.port_count(),
        controllers = driver.controller_count(),
        "virtual host controller ready"
    );

    // Standalone runs carry no usage oracle: nothing is ever treated as
    // orphaned, attachments persist until the device side goes away.
    let manager = Arc::new(DeviceManager::new(
        driver,
        None::<FixedUsage>,
        config.manager_settings(),
    ));

    let mut watchers = Vec::new();
    for (resource, specs) in &config.resources {
        let keys = manager.register(resource, specs.iter().cloned()).await?;
        info!(resource, devices = keys.len(), "registered resource");
        let updates = manager.subscribe().await;
        watchers.push(tokio::spawn(watch_resource(
            resource.clone(),
            keys.into_iter().collect(),
            updates,
            manager.clone(),
        )));
    }

    manager.start().await.context("device manager startup failed")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let refresh = tokio::spawn({
        let manager = manager.clone();
        let interval = config.check_interval();
        async move { manager.run_refresh_loop(interval, shutdown_rx).await }
    });

    signal::ctrl_c()
        .await
        .context("failed to listen for interrupt")?;
    info!("interrupt received; shutting down");
    let _ = shutdown_tx.send(true);

    refresh.await.context("refresh task panicked")?;
    for watcher in watchers {
        if let Err(err) = watcher.await {
            error!(error = %err, "resource watcher panicked");
        }
    }
    Ok(())
}

/// Log availability for one resource whenever any of its devices change.
/// Stands in for the resource advertisement stream a cluster front end
/// would maintain from the same subscription.
async fn watch_resource(
    resource: String,
    keys: HashSet<DeviceKey>,
    updates: Receiver<Vec<DeviceKey>>,
    manager: Arc<DeviceManager<SysfsStore, FixedUsage>>,
) {
    loop {
        let available = manager.available_devices(&keys).await;
        info!(
            resource = %resource,
            available = available.len(),
            total = keys.len(),
            "resource availability"
        );
        loop {
            match updates.recv().await {
                Ok(changed) if changed.iter().any(|key| keys.contains(key)) => break,
                Ok(_) => continue,
                Err(_) => return,
            }
        }
    }
}

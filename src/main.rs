//! apix - SRRP hub
//!
//! Listens for SRRP peers, answers subscriptions and forwards publishes
//! between them.

mod hub;

use apix_core::Config;
use hub::Hub;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Defaults, then APIX_CONFIG if set, then APIX_* overrides
    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            if std::env::var_os("APIX_CONFIG").is_some() {
                tracing::error!("Failed to load config: {}", e);
                return Err(e.into());
            }
            tracing::info!("Using default configuration");
            Config::default()
        }
    };

    tracing::info!("Starting apix hub");
    tracing::info!("  Node id: {:#06x}", config.network.node_id);
    tracing::info!(
        "  SRRP: sync every {}s, payload limit {} bytes",
        config.srrp.sync_interval_secs,
        config.srrp.payload_limit
    );

    let mut hub = Hub::new(config)?;
    if hub.local_addrs().is_empty() {
        return Err("no listen address configured (network.tcp_listen / network.unix_listen)".into());
    }
    tracing::info!("Hub {:#06x} ready", hub.node_id());

    let stop = Arc::new(AtomicBool::new(false));
    let interrupter = hub.interrupter()?;

    {
        let stop = stop.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("Received shutdown signal, stopping hub...");
            stop.store(true, Ordering::Release);
            if let Err(e) = interrupter.interrupt() {
                tracing::error!("Failed to wake poll loop: {}", e);
            }
        });
    }

    // The poll loop blocks; keep it off the runtime thread so the signal
    // task can run.
    let stats = tokio::task::spawn_blocking(move || {
        let result = hub.run(&stop);
        let stats = hub.shutdown();
        result.and(stats)
    })
    .await??;

    tracing::info!(
        "Hub stopped: {} accepted, {} packets, {} forwarded",
        stats.accepted,
        stats.packets,
        stats.forwarded
    );
    Ok(())
}

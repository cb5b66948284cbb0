//! rawpathd: runs the raw datapath against the loopback NIC.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use rawpath_core::RawpathConfig;

mod datapath;
mod stats;

use stats::DatapathStats;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = RawpathConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = RawpathConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        RawpathConfig::default()
    });
    let geometry = config.geometry().context("invalid datapath configuration")?;
    tracing::info!(
        mode = ?geometry.mode,
        mtu = geometry.mtu,
        ring_entries = geometry.ring_entries,
        "rawpathd starting"
    );

    let stats = Arc::new(DatapathStats::default());
    let stop = Arc::new(AtomicBool::new(false));

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    // The datapath owns its thread: it polls and never yields.
    let mut datapath_task = {
        let stats = stats.clone();
        let stop = stop.clone();
        tokio::task::spawn_blocking(move || datapath::run(&config, &stats, &stop))
    };

    let stats_printer = {
        let stats = stats.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(5));
            loop {
                interval.tick().await;
                stats.print_stats();
            }
        })
    };

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::select! {
        _ = shutdown_rx.recv() => tracing::info!("shutting down"),
        r = &mut datapath_task => {
            r.context("datapath thread panicked")??;
            tracing::error!("datapath exited");
            return Ok(());
        }
        r = stats_printer => tracing::error!("stats printer exited: {:?}", r),
    }

    stop.store(true, Ordering::Relaxed);
    datapath_task.await.context("datapath thread panicked")??;
    stats.print_stats();
    Ok(())
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Ridi Map-Data Handler
//!
//! Keeps the `next` map-data generation fresh:
//! - Downloads region extracts and boundaries when upstream checksums change
//! - Builds routing caches with the router binary
//! - Removes artifacts of discarded and previous generations

use std::sync::Arc;
use tracing::{info, warn};

use ridi_orchestrator::config::Config;
use ridi_orchestrator::downloader::HttpDownloader;
use ridi_orchestrator::runner::ProcessRunner;
use ridi_orchestrator::runtime::MapDataRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,ridi_orchestrator=debug,ridi_core=debug".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        regions = ?config.regions,
        router_bin = %config.router_bin.display(),
        router_version = %config.router_version,
        data_dir = %config.data_dir.display(),
        "Starting Ridi Map-Data Handler"
    );

    let store = ridi_core::connect(&config.database_url).await?;

    let runtime = MapDataRuntime::builder()
        .store(store)
        .downloader(Arc::new(HttpDownloader::new()))
        .runner(Arc::new(ProcessRunner::new(&config.router_bin)))
        .config(&config)
        .build()?
        .start()
        .await?;

    info!(addr = %config.health_addr, "Map-data handler ready");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await?;

    info!("Ridi Map-Data Handler shut down");

    Ok(())
}

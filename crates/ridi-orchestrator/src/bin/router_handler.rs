// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Ridi Router Handler
//!
//! Serves route plans from the `current` map-data generation:
//! - Promotes a complete `next` generation at startup
//! - Runs one router server per region within a memory ceiling
//! - Consumes the plan queue and stores the selected routes

use std::sync::Arc;
use tracing::{info, warn};

use ridi_orchestrator::config::Config;
use ridi_orchestrator::runner::ProcessRunner;
use ridi_orchestrator::runtime::RouterRuntime;

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
        router_version = %config.router_version,
        memory_ceiling_mb = config.router_memory_ceiling_mb,
        "Starting Ridi Router Handler"
    );

    let store = ridi_core::connect(&config.database_url).await?;

    let runtime = RouterRuntime::builder()
        .store(store)
        .runner(Arc::new(ProcessRunner::new(&config.router_bin)))
        .config(&config)
        .build()?
        .start()
        .await?;

    let report = runtime.reconcile_report();
    if let Some(promotion) = &report.promotion {
        info!(
            promoted = promotion.promoted,
            demoted = promotion.demoted,
            "Serving newly promoted map data"
        );
    }

    info!(addr = %config.health_addr, "Router handler ready");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await?;

    info!("Ridi Router Handler shut down");

    Ok(())
}

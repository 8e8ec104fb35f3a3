// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Periodic map-data runs.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ridi_core::Persistence;
use ridi_core::models::service_names;
use tokio::sync::Notify;
use tracing::{error, info};

use crate::cache_generator::CacheGeneratorConfig;
use crate::config::Config;
use crate::downloader::Downloader;
use crate::error::Result;
use crate::region_list_processor::RegionListProcessor;
use crate::runner::Runner;

/// Map-data worker configuration.
#[derive(Debug, Clone)]
pub struct MapDataWorkerConfig {
    /// Regions to keep map data for
    pub regions: Vec<String>,
    /// Running router version
    pub router_version: String,
    /// Artifact root
    pub data_dir: PathBuf,
    /// Upstream base URL
    pub osm_base_url: String,
    /// Re-download throttle stamped on new records
    pub download_cooldown: Duration,
    /// Time between runs
    pub run_interval: Duration,
    /// Cache build settings
    pub cache_generator: CacheGeneratorConfig,
}

impl Default for MapDataWorkerConfig {
    fn default() -> Self {
        Self {
            regions: Vec::new(),
            router_version: String::new(),
            data_dir: PathBuf::from(".data"),
            osm_base_url: "https://download.geofabrik.de".to_string(),
            download_cooldown: Duration::from_secs(168 * 3600),
            run_interval: Duration::from_secs(86_400),
            cache_generator: CacheGeneratorConfig::default(),
        }
    }
}

impl From<&Config> for MapDataWorkerConfig {
    fn from(config: &Config) -> Self {
        Self {
            regions: config.regions.clone(),
            router_version: config.router_version.clone(),
            data_dir: config.data_dir.clone(),
            osm_base_url: config.osm_data_base_url.clone(),
            download_cooldown: config.download_cooldown,
            run_interval: config.map_data_run_interval,
            cache_generator: CacheGeneratorConfig {
                startup_timeout: config.router_startup_timeout,
                ..Default::default()
            },
        }
    }
}

/// Runs the region list processor now and then on a fixed interval.
pub struct MapDataWorker {
    store: Arc<dyn Persistence>,
    processor: RegionListProcessor,
    config: MapDataWorkerConfig,
    shutdown: Arc<Notify>,
}

impl MapDataWorker {
    /// Create a new map-data worker.
    pub fn new(
        store: Arc<dyn Persistence>,
        downloader: Arc<dyn Downloader>,
        runner: Arc<dyn Runner>,
        config: MapDataWorkerConfig,
    ) -> Result<Self> {
        let processor = RegionListProcessor::new(store.clone(), downloader, runner, &config)?;
        Ok(Self {
            store,
            processor,
            config,
            shutdown: Arc::new(Notify::new()),
        })
    }

    /// Get a handle to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// One full run.
    pub async fn run_once(&self) -> Result<()> {
        self.processor.process().await
    }

    /// Run until shutdown is signalled.
    pub async fn run(self) -> Result<()> {
        self.store
            .service_upsert(service_names::MAP_DATA, &self.config.router_version)
            .await?;

        info!(
            regions = self.config.regions.len(),
            router_version = %self.config.router_version,
            run_interval_secs = self.config.run_interval.as_secs(),
            "Map-data worker started"
        );

        let mut interval = tokio::time::interval(self.config.run_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("Map-data worker shutting down");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.run_once().await {
                        error!(error = %e, "Map-data run failed");
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::MockDownloader;
    use crate::runner::MockRunner;
    use crate::testing::memory_store;

    #[test]
    fn test_config_default() {
        let config = MapDataWorkerConfig::default();
        assert_eq!(config.download_cooldown, Duration::from_secs(604_800));
        assert_eq!(config.run_interval, Duration::from_secs(86_400));
        assert_eq!(config.cache_generator.heartbeat_interval, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_worker_registers_service_and_stops() {
        let store = memory_store().await;
        let config = MapDataWorkerConfig {
            router_version: "v3".to_string(),
            ..Default::default()
        };
        let worker = MapDataWorker::new(
            store.clone(),
            Arc::new(MockDownloader::new()),
            Arc::new(MockRunner::new()),
            config,
        )
        .unwrap();
        let shutdown = worker.shutdown_handle();
        let handle = tokio::spawn(worker.run());

        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.notify_one();
        handle.await.unwrap().unwrap();

        let service = store.service_get(service_names::MAP_DATA).await.unwrap().unwrap();
        assert_eq!(service.router_version.as_deref(), Some("v3"));
    }
}

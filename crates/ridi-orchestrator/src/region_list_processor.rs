// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! One map-data run over the configured regions.
//!
//! For every region the upstream checksum is compared with the region's
//! `next` record, or its `current` record when no `next` exists, and the
//! outcome decides between a fresh download, resuming a download, a cache
//! (re)build, or nothing at all. A run ends once every scheduled build has
//! finished, followed by cleanup and a status update.

use std::path::Path;
use std::sync::Arc;

use chrono::{TimeDelta, Utc};
use ridi_core::Persistence;
use ridi_core::models::{MapDataRecord, MapDataStatus, NewMapData, ServiceStatus, service_names};
use ridi_core::persistence::ArtifactKind;
use tracing::{debug, error, info, warn};

use crate::cache_generator::CacheGenerator;
use crate::cleaner::Cleaner;
use crate::config::ConfigError;
use crate::downloader::Downloader;
use crate::error::{Error, Result};
use crate::locations::{Locations, OsmLocations};
use crate::map_data_worker::MapDataWorkerConfig;
use crate::region_downloader::RegionDownloader;
use crate::runner::Runner;
use crate::status::StatusChecker;

/// Reconciles local map data with upstream for every configured region.
pub struct RegionListProcessor {
    store: Arc<dyn Persistence>,
    downloader: Arc<dyn Downloader>,
    osm: OsmLocations,
    locations: Locations,
    region_downloader: RegionDownloader,
    cache_generator: CacheGenerator,
    cleaner: Cleaner,
    status: StatusChecker,
    regions: Vec<String>,
    router_version: String,
    download_cooldown: TimeDelta,
}

impl RegionListProcessor {
    /// Wire up the processor and start its cache build worker. Fails when the
    /// download cooldown does not fit a timestamp offset.
    pub fn new(
        store: Arc<dyn Persistence>,
        downloader: Arc<dyn Downloader>,
        runner: Arc<dyn Runner>,
        config: &MapDataWorkerConfig,
    ) -> Result<Self> {
        let download_cooldown = TimeDelta::from_std(config.download_cooldown)
            .ok()
            .filter(|cooldown| Utc::now().checked_add_signed(*cooldown).is_some())
            .ok_or_else(|| {
                Error::Config(ConfigError::InvalidValue {
                    var: "MAP_DATA_DOWNLOAD_COOLDOWN_HOURS",
                    value: format!("{}h", config.download_cooldown.as_secs() / 3600),
                })
            })?;
        let osm = OsmLocations::new(config.osm_base_url.clone());
        let status = StatusChecker::new(store.clone(), config.regions.clone());
        let cache_generator = CacheGenerator::start(
            store.clone(),
            runner,
            status.clone(),
            config.cache_generator.clone(),
        );
        let region_downloader = RegionDownloader::new(
            store.clone(),
            downloader.clone(),
            osm.clone(),
            cache_generator.clone(),
        );

        Ok(Self {
            cleaner: Cleaner::new(store.clone()),
            locations: Locations::new(config.data_dir.clone()),
            store,
            downloader,
            osm,
            region_downloader,
            cache_generator,
            status,
            regions: config.regions.clone(),
            router_version: config.router_version.clone(),
            download_cooldown,
        })
    }

    /// Run over every region, wait for the builds, clean up, update status.
    pub async fn process(&self) -> Result<()> {
        debug!("Starting region list processing");
        self.store
            .service_set_status(service_names::MAP_DATA, ServiceStatus::Processing)
            .await?;

        for region in &self.regions {
            if let Err(e) = self.process_region(region).await {
                error!(region = %region, error = %e, "Region processing failed");
            }
        }

        debug!(pending = self.cache_generator.pending(), "All regions checked");
        self.cache_generator.wait_till_done().await;

        let cleaned = self.cleaner.process_cleanup().await?;
        self.status.check_status().await?;

        info!(regions = self.regions.len(), cleaned, "Region list processed");
        Ok(())
    }

    async fn process_region(&self, region: &str) -> Result<()> {
        let md5 = match self.downloader.fetch_md5(&self.osm.md5_url(region)).await {
            Ok(md5) => md5,
            Err(e) => {
                warn!(region = %region, error = %e, "Could not fetch remote md5, skipping region");
                return Ok(());
            }
        };
        debug!(region = %region, md5 = %md5, "Remote md5");

        match self.store.map_data_get_next(region).await? {
            Some(next) => self.handle_next(region, &md5, next).await,
            None => {
                let current = self.store.map_data_get_current(region).await?;
                self.handle_current(region, &md5, current).await
            }
        }
    }

    async fn handle_next(&self, region: &str, md5: &str, next: MapDataRecord) -> Result<()> {
        let changed = md5 != next.pbf_md5 && cooldown_elapsed(&next);

        if changed || next.status == MapDataStatus::Error {
            info!(region = %region, old_md5 = %next.pbf_md5, md5 = %md5, status = %next.status, "Replacing next map data");
            self.store.map_data_set_discarded(&next.id).await?;
            self.store.region_set_discarded(region, &next.pbf_md5).await?;
            let record = self.create_next(region, md5).await?;
            self.download(&record).await;
        } else if next.status == MapDataStatus::New {
            debug!(region = %region, "Next map data not downloaded yet, downloading");
            self.download(&next).await;
        } else if matches!(
            next.status,
            MapDataStatus::Downloaded | MapDataStatus::Processing
        ) || next.router_version != self.router_version
        {
            let next = if next.router_version != self.router_version {
                self.retarget(next).await?
            } else {
                next
            };
            debug!(region = %region, status = %next.status, "Scheduling cache build for next map data");
            self.cache_generator.schedule(next);
        } else {
            debug!(region = %region, status = %next.status, "Next map data up to date");
        }
        Ok(())
    }

    async fn handle_current(
        &self,
        region: &str,
        md5: &str,
        current: Option<MapDataRecord>,
    ) -> Result<()> {
        match current {
            None => {
                info!(region = %region, md5 = %md5, "No map data for region, downloading");
                let record = self.create_next(region, md5).await?;
                self.download(&record).await;
            }
            Some(current) if md5 != current.pbf_md5 && cooldown_elapsed(&current) => {
                info!(region = %region, old_md5 = %current.pbf_md5, md5 = %md5, "Upstream extract changed, downloading");
                let record = self.create_next(region, md5).await?;
                self.download(&record).await;
            }
            Some(current) if current.router_version != self.router_version => {
                info!(
                    region = %region,
                    from = %current.router_version,
                    to = %self.router_version,
                    "Router version changed, rebuilding cache"
                );
                let record = self.create_rebuild(&current).await?;
                self.cache_generator.schedule(record);
            }
            Some(_) => debug!(region = %region, "Current map data up to date"),
        }
        Ok(())
    }

    async fn download(&self, record: &MapDataRecord) {
        // Failure is already recorded on the record; the next run retries.
        if let Err(e) = self.region_downloader.download_region(record).await {
            warn!(region = %record.region, error = %e, "Download failed, will retry on next run");
        }
    }

    async fn create_next(&self, region: &str, md5: &str) -> Result<MapDataRecord> {
        let record = self
            .store
            .map_data_create_next(&NewMapData {
                region: region.to_string(),
                pbf_md5: md5.to_string(),
                pbf_location: path_string(&self.locations.pbf_path(region, md5).await?),
                cache_location: path_string(
                    &self
                        .locations
                        .cache_dir(&self.router_version, region, md5)
                        .await?,
                ),
                kml_location: path_string(&self.locations.kml_path(region, md5).await?),
                router_version: self.router_version.clone(),
                next_download_after: Utc::now() + self.download_cooldown,
            })
            .await?;
        debug!(id = %record.id, region = %region, md5 = %md5, "Created next map data record");
        Ok(record)
    }

    /// A `next` record for the running router version that reuses the
    /// extract and boundary of `current`.
    async fn create_rebuild(&self, current: &MapDataRecord) -> Result<MapDataRecord> {
        let cache_location = self
            .locations
            .cache_dir(&self.router_version, &current.region, &current.pbf_md5)
            .await?;
        let record = self
            .store
            .map_data_create_next(&NewMapData {
                region: current.region.clone(),
                pbf_md5: current.pbf_md5.clone(),
                pbf_location: current.pbf_location.clone(),
                cache_location: path_string(&cache_location),
                kml_location: current.kml_location.clone(),
                router_version: self.router_version.clone(),
                next_download_after: current.next_download_after,
            })
            .await?;
        self.store
            .map_data_set_status(&record.id, MapDataStatus::Downloaded)
            .await?;
        self.reload(&record.id).await
    }

    /// Point a `next` record at the running router version.
    async fn retarget(&self, next: MapDataRecord) -> Result<MapDataRecord> {
        let cache_location = self
            .locations
            .cache_dir(&self.router_version, &next.region, &next.pbf_md5)
            .await?;
        info!(
            region = %next.region,
            from = %next.router_version,
            to = %self.router_version,
            "Retargeting next map data to running router version"
        );
        self.store
            .map_data_retarget(&next.id, &self.router_version, &path_string(&cache_location))
            .await?;

        // The cache built for the old version is no longer referenced by
        // this record; drop it unless another record still uses it.
        if !self
            .store
            .map_data_is_path_in_use(ArtifactKind::Cache, &next.cache_location, &next.id)
            .await?
        {
            match tokio::fs::remove_dir_all(&next.cache_location).await {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                    warn!(path = %next.cache_location, error = %e, "Failed to remove stale cache")
                }
                _ => {}
            }
        }

        self.reload(&next.id).await
    }

    async fn reload(&self, id: &str) -> Result<MapDataRecord> {
        self.store
            .map_data_get(id)
            .await?
            .ok_or_else(|| Error::Other(format!("map data {} vanished", id)))
    }
}

fn cooldown_elapsed(record: &MapDataRecord) -> bool {
    record.next_download_after < Utc::now()
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boundary::tests::ANDORRA_KML;
    use crate::downloader::MockDownloader;
    use crate::runner::MockRunner;
    use crate::testing::memory_store;
    use ridi_core::models::MapDataVersion;
    use std::time::Duration;
    use tempfile::TempDir;

    const BASE: &str = "http://osm.test";
    const REGION: &str = "europe/andorra";

    struct Fixture {
        dir: TempDir,
        store: Arc<dyn Persistence>,
        downloader: Arc<MockDownloader>,
        runner: Arc<MockRunner>,
    }

    impl Fixture {
        async fn new() -> Self {
            let downloader = Arc::new(MockDownloader::new());
            downloader.serve(&format!("{}/{}.kml", BASE, REGION), ANDORRA_KML);
            downloader.serve(
                &format!("{}/{}-latest.osm.pbf", BASE, REGION),
                vec![1u8; 4096],
            );
            let fx = Self {
                dir: TempDir::new().unwrap(),
                store: memory_store().await,
                downloader,
                runner: Arc::new(MockRunner::new()),
            };
            fx.publish_md5("md5-1");
            fx
        }

        fn publish_md5(&self, md5: &str) {
            self.downloader.serve(
                &format!("{}/{}-latest.osm.pbf.md5", BASE, REGION),
                format!("{}  andorra-latest.osm.pbf", md5),
            );
        }

        fn processor(&self, router_version: &str, cooldown: Duration) -> RegionListProcessor {
            let config = MapDataWorkerConfig {
                regions: vec![REGION.to_string()],
                router_version: router_version.to_string(),
                data_dir: self.dir.path().to_path_buf(),
                osm_base_url: BASE.to_string(),
                download_cooldown: cooldown,
                ..Default::default()
            };
            RegionListProcessor::new(
                self.store.clone(),
                self.downloader.clone(),
                self.runner.clone(),
                &config,
            )
            .unwrap()
        }

        fn pbf_downloads(&self) -> usize {
            self.downloader
                .request_count(&format!("{}/{}-latest.osm.pbf", BASE, REGION))
        }

        async fn promote(&self) {
            self.store.promote_next().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_unrepresentable_cooldown_is_rejected() {
        let fx = Fixture::new().await;
        let config = MapDataWorkerConfig {
            download_cooldown: Duration::from_secs(u64::MAX),
            ..Default::default()
        };

        let result = RegionListProcessor::new(
            fx.store.clone(),
            fx.downloader.clone(),
            fx.runner.clone(),
            &config,
        );

        assert!(matches!(
            result,
            Err(Error::Config(ConfigError::InvalidValue { .. }))
        ));
    }

    #[tokio::test]
    async fn test_first_run_downloads_and_builds() {
        let fx = Fixture::new().await;
        fx.processor("v1", Duration::ZERO).process().await.unwrap();

        let next = fx.store.map_data_get_next(REGION).await.unwrap().unwrap();
        assert_eq!(next.status, MapDataStatus::Ready);
        assert_eq!(next.pbf_md5, "md5-1");
        assert!(next.cache_location.ends_with("cache/v1/europe/andorra/md5-1"));
        assert_eq!(fx.pbf_downloads(), 1);

        let service = fx.store.service_get(service_names::MAP_DATA).await.unwrap().unwrap();
        assert_eq!(service.status, ServiceStatus::Done);
    }

    #[tokio::test]
    async fn test_unchanged_md5_is_idempotent() {
        let fx = Fixture::new().await;
        let processor = fx.processor("v1", Duration::ZERO);
        processor.process().await.unwrap();
        let first = fx.store.map_data_get_next(REGION).await.unwrap().unwrap();

        processor.process().await.unwrap();

        let second = fx.store.map_data_get_next(REGION).await.unwrap().unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(fx.pbf_downloads(), 1);
        assert_eq!(fx.runner.prep_calls().await.len(), 1);
    }

    #[tokio::test]
    async fn test_changed_md5_replaces_next_and_cleans_old() {
        let fx = Fixture::new().await;
        let processor = fx.processor("v1", Duration::ZERO);
        processor.process().await.unwrap();
        let old = fx.store.map_data_get_next(REGION).await.unwrap().unwrap();

        fx.publish_md5("md5-2");
        processor.process().await.unwrap();

        let new = fx.store.map_data_get_next(REGION).await.unwrap().unwrap();
        assert_ne!(new.id, old.id);
        assert_eq!(new.pbf_md5, "md5-2");
        assert_eq!(new.status, MapDataStatus::Ready);
        assert!(fx.store.map_data_get(&old.id).await.unwrap().is_none());
        assert!(!Path::new(&old.pbf_location).exists());
        assert!(fx.store.region_get(REGION, "md5-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_changed_md5_within_cooldown_is_ignored() {
        let fx = Fixture::new().await;
        let processor = fx.processor("v1", Duration::from_secs(3600));
        processor.process().await.unwrap();

        fx.publish_md5("md5-2");
        processor.process().await.unwrap();

        let next = fx.store.map_data_get_next(REGION).await.unwrap().unwrap();
        assert_eq!(next.pbf_md5, "md5-1");
        assert_eq!(fx.pbf_downloads(), 1);
    }

    #[tokio::test]
    async fn test_errored_next_is_replaced() {
        let fx = Fixture::new().await;
        let processor = fx.processor("v1", Duration::from_secs(3600));
        processor.process().await.unwrap();
        let old = fx.store.map_data_get_next(REGION).await.unwrap().unwrap();
        fx.store.map_data_set_failed(&old.id, "disk full").await.unwrap();

        processor.process().await.unwrap();

        let new = fx.store.map_data_get_next(REGION).await.unwrap().unwrap();
        assert_ne!(new.id, old.id);
        assert_eq!(new.status, MapDataStatus::Ready);
        assert_eq!(fx.pbf_downloads(), 2);
        // Same checksum, same paths: the files are still in use.
        assert!(Path::new(&new.pbf_location).exists());
    }

    #[tokio::test]
    async fn test_router_version_change_rebuilds_without_download() {
        let fx = Fixture::new().await;
        fx.processor("v1", Duration::from_secs(3600)).process().await.unwrap();
        fx.promote().await;
        let current = fx.store.map_data_get_current(REGION).await.unwrap().unwrap();

        fx.processor("v2", Duration::from_secs(3600)).process().await.unwrap();

        let next = fx.store.map_data_get_next(REGION).await.unwrap().unwrap();
        assert_eq!(next.router_version, "v2");
        assert_eq!(next.status, MapDataStatus::Ready);
        assert_eq!(next.pbf_md5, current.pbf_md5);
        assert_eq!(next.pbf_location, current.pbf_location);
        assert!(next.cache_location.ends_with("cache/v2/europe/andorra/md5-1"));
        assert_eq!(fx.pbf_downloads(), 1);
        assert_eq!(fx.runner.prep_calls().await.len(), 2);

        // The boundary stays current; promotion will keep it current.
        let region = fx.store.region_get(REGION, "md5-1").await.unwrap().unwrap();
        assert_eq!(region.version, MapDataVersion::Current);
    }

    #[tokio::test]
    async fn test_next_with_old_router_version_is_retargeted() {
        let fx = Fixture::new().await;
        fx.processor("v1", Duration::from_secs(3600)).process().await.unwrap();

        fx.processor("v2", Duration::from_secs(3600)).process().await.unwrap();

        let next = fx.store.map_data_get_next(REGION).await.unwrap().unwrap();
        assert_eq!(next.router_version, "v2");
        assert!(next.cache_location.ends_with("cache/v2/europe/andorra/md5-1"));
        assert_eq!(next.status, MapDataStatus::Ready);
        assert_eq!(fx.pbf_downloads(), 1);
        assert!(!fx.dir.path().join("cache/v1/europe/andorra/md5-1").exists());
    }

    #[tokio::test]
    async fn test_md5_failure_skips_region() {
        let fx = Fixture::new().await;
        fx.downloader
            .remove(&format!("{}/{}-latest.osm.pbf.md5", BASE, REGION));

        fx.processor("v1", Duration::ZERO).process().await.unwrap();

        assert!(fx.store.map_data_get_next(REGION).await.unwrap().is_none());
        assert_eq!(fx.pbf_downloads(), 0);
    }
}

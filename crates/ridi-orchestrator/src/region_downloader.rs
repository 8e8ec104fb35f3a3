// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Downloads a region's boundary and raw extract into a `next` record.

use std::path::Path;
use std::sync::Arc;

use ridi_core::Persistence;
use ridi_core::models::{MapDataRecord, MapDataStatus};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::cache_generator::CacheGenerator;
use crate::downloader::{DownloadProgress, Downloader};
use crate::error::{Error, Result};
use crate::locations::OsmLocations;

/// Minimum progress between two persisted download counters.
const PROGRESS_WRITE_STEP: u64 = 1024 * 1024;

/// Fetches artifacts for a record and hands it to the cache generator.
#[derive(Clone)]
pub struct RegionDownloader {
    store: Arc<dyn Persistence>,
    downloader: Arc<dyn Downloader>,
    osm: OsmLocations,
    cache_generator: CacheGenerator,
}

impl RegionDownloader {
    /// Create a region downloader.
    pub fn new(
        store: Arc<dyn Persistence>,
        downloader: Arc<dyn Downloader>,
        osm: OsmLocations,
        cache_generator: CacheGenerator,
    ) -> Self {
        Self {
            store,
            downloader,
            osm,
            cache_generator,
        }
    }

    /// Download the boundary, then the extract, into the record's paths.
    ///
    /// On success the record becomes `downloaded` and its cache build is
    /// scheduled. On failure the record is marked `error` and the error is
    /// returned.
    pub async fn download_region(&self, record: &MapDataRecord) -> Result<()> {
        info!(region = %record.region, md5 = %record.pbf_md5, id = %record.id, "Starting region download");

        match self.fetch(record).await {
            Ok(()) => {
                self.store
                    .map_data_set_status(&record.id, MapDataStatus::Downloaded)
                    .await?;
                let record = self
                    .store
                    .map_data_get(&record.id)
                    .await?
                    .ok_or_else(|| Error::Other(format!("map data {} vanished", record.id)))?;
                self.cache_generator.schedule(record);
                Ok(())
            }
            Err(e) => {
                error!(region = %record.region, id = %record.id, error = %e, "Region download failed");
                self.store
                    .map_data_set_failed(&record.id, &e.to_string())
                    .await?;
                Err(e)
            }
        }
    }

    async fn fetch(&self, record: &MapDataRecord) -> Result<()> {
        let kml_url = self.osm.kml_url(&record.region);
        let pbf_url = self.osm.pbf_url(&record.region);

        for path in [&record.kml_location, &record.pbf_location] {
            if let Some(parent) = Path::new(path).parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        debug!(url = %kml_url, dest = %record.kml_location, "Downloading boundary");
        self.downloader
            .download(&kml_url, Path::new(&record.kml_location), None)
            .await?;

        debug!(url = %pbf_url, dest = %record.pbf_location, "Downloading extract");
        let (tx, rx) = mpsc::unbounded_channel();
        let progress = tokio::spawn(track_progress(self.store.clone(), record.id.clone(), rx));

        let result = self
            .downloader
            .download(&pbf_url, Path::new(&record.pbf_location), Some(tx))
            .await;

        // The sender was moved into the download, so the tracker sees the
        // channel close once the download returns.
        if let Err(e) = progress.await {
            warn!(id = %record.id, error = %e, "Progress tracker panicked");
        }

        let bytes = result?;
        info!(region = %record.region, bytes, "Extract downloaded");
        Ok(())
    }
}

/// Persist progress events, at most once per [`PROGRESS_WRITE_STEP`] plus a
/// final write.
async fn track_progress(
    store: Arc<dyn Persistence>,
    id: String,
    mut rx: mpsc::UnboundedReceiver<DownloadProgress>,
) {
    let mut downloaded = 0u64;
    let mut written = 0u64;

    while let Some(event) = rx.recv().await {
        let result = match event {
            DownloadProgress::Total(total) => store.map_data_set_pbf_size(&id, total as i64).await,
            DownloadProgress::Chunk(bytes) => {
                downloaded += bytes;
                if downloaded - written < PROGRESS_WRITE_STEP {
                    continue;
                }
                written = downloaded;
                store
                    .map_data_set_pbf_downloaded_size(&id, downloaded as i64)
                    .await
            }
        };
        if let Err(e) = result {
            warn!(id = %id, error = %e, "Failed to persist download progress");
        }
    }

    if downloaded != written
        && let Err(e) = store
            .map_data_set_pbf_downloaded_size(&id, downloaded as i64)
            .await
    {
        warn!(id = %id, error = %e, "Failed to persist download progress");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boundary::tests::ANDORRA_KML;
    use crate::cache_generator::CacheGeneratorConfig;
    use crate::downloader::MockDownloader;
    use crate::runner::MockRunner;
    use crate::status::StatusChecker;
    use crate::testing::memory_store;
    use chrono::Utc;
    use ridi_core::models::NewMapData;
    use tempfile::TempDir;

    const BASE: &str = "http://osm.test";

    async fn setup(
        dir: &TempDir,
        downloader: Arc<MockDownloader>,
    ) -> (Arc<dyn Persistence>, RegionDownloader, CacheGenerator, MapDataRecord) {
        let store = memory_store().await;
        let generator = CacheGenerator::start(
            store.clone(),
            Arc::new(MockRunner::new()),
            StatusChecker::new(store.clone(), vec!["europe/andorra".to_string()]),
            CacheGeneratorConfig::default(),
        );
        let region_downloader = RegionDownloader::new(
            store.clone(),
            downloader,
            OsmLocations::new(BASE),
            generator.clone(),
        );
        let root = dir.path();
        let record = store
            .map_data_create_next(&NewMapData {
                region: "europe/andorra".to_string(),
                pbf_md5: "abc".to_string(),
                pbf_location: root.join("pbf/abc/osm.pbf").to_string_lossy().into_owned(),
                cache_location: root.join("cache/abc").to_string_lossy().into_owned(),
                kml_location: root.join("pbf/abc/osm.kml").to_string_lossy().into_owned(),
                router_version: "v1".to_string(),
                next_download_after: Utc::now(),
            })
            .await
            .unwrap();
        (store, region_downloader, generator, record)
    }

    #[tokio::test]
    async fn test_download_then_build() {
        let dir = TempDir::new().unwrap();
        let downloader = Arc::new(MockDownloader::new());
        downloader.serve(&format!("{}/europe/andorra.kml", BASE), ANDORRA_KML);
        downloader.serve(
            &format!("{}/europe/andorra-latest.osm.pbf", BASE),
            vec![1u8; 2_500_000],
        );
        let (store, region_downloader, generator, record) = setup(&dir, downloader).await;

        region_downloader.download_region(&record).await.unwrap();
        generator.wait_till_done().await;

        let record = store.map_data_get(&record.id).await.unwrap().unwrap();
        assert_eq!(record.pbf_size, Some(2_500_000));
        assert_eq!(record.pbf_downloaded_size, Some(2_500_000));
        assert_eq!(record.status, MapDataStatus::Ready);
        assert_eq!(
            std::fs::metadata(&record.pbf_location).unwrap().len(),
            2_500_000
        );
    }

    #[tokio::test]
    async fn test_failed_download_marks_error() {
        let dir = TempDir::new().unwrap();
        let downloader = Arc::new(MockDownloader::new());
        downloader.serve(&format!("{}/europe/andorra.kml", BASE), ANDORRA_KML);
        let (store, region_downloader, generator, record) = setup(&dir, downloader).await;

        let result = region_downloader.download_region(&record).await;
        assert!(matches!(result, Err(Error::Download(_))));
        assert_eq!(generator.pending(), 0);

        let record = store.map_data_get(&record.id).await.unwrap().unwrap();
        assert_eq!(record.status, MapDataStatus::Error);
        assert!(record.error.unwrap().contains("404"));
    }

    #[tokio::test]
    async fn test_progress_writes_are_throttled() {
        let store = memory_store().await;
        let record = store
            .map_data_create_next(&crate::testing::new_map_data("europe/andorra", "abc"))
            .await
            .unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        let tracker = tokio::spawn(track_progress(store.clone(), record.id.clone(), rx));
        tx.send(DownloadProgress::Total(3 * PROGRESS_WRITE_STEP)).unwrap();
        for _ in 0..10 {
            tx.send(DownloadProgress::Chunk(PROGRESS_WRITE_STEP / 4)).unwrap();
        }
        drop(tx);
        tracker.await.unwrap();

        let record = store.map_data_get(&record.id).await.unwrap().unwrap();
        assert_eq!(record.pbf_size, Some(3 * PROGRESS_WRITE_STEP as i64));
        assert_eq!(
            record.pbf_downloaded_size,
            Some((10 * PROGRESS_WRITE_STEP / 4) as i64)
        );
    }
}

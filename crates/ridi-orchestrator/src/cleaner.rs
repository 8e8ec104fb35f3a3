// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Garbage collection of superseded map-data generations.
//!
//! Several records may point at the same files (a rebuild for a new router
//! version reuses the extract and boundary of the record it replaces), so a
//! file is only removed once no other record references its path.

use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;

use ridi_core::Persistence;
use ridi_core::models::MapDataRecord;
use ridi_core::persistence::ArtifactKind;
use tracing::{debug, error, info};

use crate::error::Result;

/// Deletes files and rows of `discarded` and `previous` records.
#[derive(Clone)]
pub struct Cleaner {
    store: Arc<dyn Persistence>,
}

impl Cleaner {
    /// Cleaner over `store`.
    pub fn new(store: Arc<dyn Persistence>) -> Self {
        Self { store }
    }

    /// Clean every cleanup candidate; returns how many records were removed.
    /// A record that fails to clean is kept for the next run.
    pub async fn process_cleanup(&self) -> Result<usize> {
        let records = self.store.map_data_list_discarded_and_previous().await?;
        debug!(count = records.len(), "Records for cleanup found");

        let mut cleaned = 0;
        for record in &records {
            match self.clean_record(record).await {
                Ok(()) => cleaned += 1,
                Err(e) => error!(
                    id = %record.id,
                    region = %record.region,
                    error = %e,
                    "Map data record cleanup failed, retry next run"
                ),
            }
        }

        Ok(cleaned)
    }

    async fn clean_record(&self, record: &MapDataRecord) -> Result<()> {
        debug!(id = %record.id, region = %record.region, version = %record.version, "Record cleanup");

        if !self.in_use(ArtifactKind::Cache, &record.cache_location, &record.id).await? {
            remove_dir(Path::new(&record.cache_location)).await?;
        }
        if !self.in_use(ArtifactKind::Pbf, &record.pbf_location, &record.id).await? {
            remove_file(Path::new(&record.pbf_location)).await?;
        }
        if !self.in_use(ArtifactKind::Kml, &record.kml_location, &record.id).await? {
            remove_file(Path::new(&record.kml_location)).await?;
        }

        self.store.map_data_delete(&record.id).await?;
        self.store
            .region_delete_discarded_and_previous(&record.region, &record.pbf_md5)
            .await?;

        info!(id = %record.id, region = %record.region, md5 = %record.pbf_md5, "Map data record cleaned up");
        Ok(())
    }

    async fn in_use(&self, kind: ArtifactKind, path: &str, except_id: &str) -> Result<bool> {
        let in_use = self
            .store
            .map_data_is_path_in_use(kind, path, except_id)
            .await?;
        if in_use {
            debug!(?kind, path = %path, "Artifact still referenced, keeping");
        }
        Ok(in_use)
    }
}

async fn remove_dir(path: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

async fn remove_file(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

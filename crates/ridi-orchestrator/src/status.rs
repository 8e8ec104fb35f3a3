// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Map-data service heartbeat.

use std::sync::Arc;

use ridi_core::Persistence;
use ridi_core::models::{MapDataStatus, MapDataVersion, ServiceStatus, service_names};
use tracing::debug;

use crate::error::Result;

/// Marks the `map-data` service idle once every configured region's `next`
/// record has settled, otherwise refreshes its heartbeat.
#[derive(Clone)]
pub struct StatusChecker {
    store: Arc<dyn Persistence>,
    regions: Arc<Vec<String>>,
}

impl StatusChecker {
    /// Checker over the configured regions.
    pub fn new(store: Arc<dyn Persistence>, regions: Vec<String>) -> Self {
        Self {
            store,
            regions: Arc::new(regions),
        }
    }

    /// Whether no `next` work remains outstanding.
    pub async fn all_regions_processed(&self) -> Result<bool> {
        let next = self
            .store
            .map_data_list_by_version(MapDataVersion::Next)
            .await?;

        Ok(next.is_empty()
            || self.regions.iter().all(|region| {
                next.iter().any(|record| {
                    &record.region == region
                        && matches!(record.status, MapDataStatus::Ready | MapDataStatus::Error)
                })
            }))
    }

    /// Update the `map-data` service record.
    pub async fn check_status(&self) -> Result<()> {
        if self.all_regions_processed().await? {
            debug!("All regions processed, marking map-data service done");
            self.store
                .service_set_status(service_names::MAP_DATA, ServiceStatus::Done)
                .await?;
        } else {
            self.store.service_touch(service_names::MAP_DATA).await?;
        }
        Ok(())
    }
}

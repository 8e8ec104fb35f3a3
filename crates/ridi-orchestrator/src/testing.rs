// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared fixtures for unit tests.

use std::sync::Arc;

use chrono::Utc;
use ridi_core::models::{MapDataStatus, NewMapData, NewRegionBoundary};
use ridi_core::{Persistence, SqlitePersistence};

/// Fresh in-memory store with migrations applied.
pub(crate) async fn memory_store() -> Arc<dyn Persistence> {
    Arc::new(
        SqlitePersistence::connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory store"),
    )
}

/// `next` record fields with paths derived from region and checksum.
pub(crate) fn new_map_data(region: &str, md5: &str) -> NewMapData {
    NewMapData {
        region: region.to_string(),
        pbf_md5: md5.to_string(),
        pbf_location: format!("/data/pbf/{}/{}/osm.pbf", region, md5),
        cache_location: format!("/data/cache/v1/{}/{}", region, md5),
        kml_location: format!("/data/pbf/{}/{}/osm.kml", region, md5),
        router_version: "v1".to_string(),
        next_download_after: Utc::now(),
    }
}

/// Axis-aligned ring `[lon, lat]` from `(min_lon, min_lat)` to `(max_lon, max_lat)`.
pub(crate) fn square(min_lon: f64, min_lat: f64, max_lon: f64, max_lat: f64) -> Vec<[f64; 2]> {
    vec![
        [min_lon, min_lat],
        [max_lon, min_lat],
        [max_lon, max_lat],
        [min_lon, max_lat],
        [min_lon, min_lat],
    ]
}

/// A region to seed as `current`.
pub(crate) struct SeedRegion<'a> {
    pub region: &'a str,
    pub ring: Vec<[f64; 2]>,
    pub cache_mb: i64,
}

/// Store ready `next` records and boundaries for the regions and promote
/// them to `current` together.
pub(crate) async fn seed_current(store: &dyn Persistence, regions: Vec<SeedRegion<'_>>) {
    for seed in regions {
        let record = store
            .map_data_create_next(&new_map_data(seed.region, "md5"))
            .await
            .unwrap();
        store
            .map_data_set_build_metrics(&record.id, seed.cache_mb * 1024 * 1024, 3)
            .await
            .unwrap();
        store
            .map_data_set_status(&record.id, MapDataStatus::Ready)
            .await
            .unwrap();
        store
            .region_upsert(&NewRegionBoundary {
                region: seed.region.to_string(),
                pbf_md5: "md5".to_string(),
                ring: seed.ring,
            })
            .await
            .unwrap();
    }
    store.promote_next().await.unwrap();
}

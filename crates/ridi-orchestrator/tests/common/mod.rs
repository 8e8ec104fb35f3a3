// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for ridi-orchestrator integration tests.
//!
//! Provides a [`TestContext`] wiring an in-memory store, a mock upstream and a
//! mock router binary together the way the two services share them.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use ridi_core::models::{NewPlan, PlanState, TripType};
use ridi_core::{Persistence, SqlitePersistence};
use tempfile::TempDir;

use ridi_orchestrator::dispatcher::DispatcherConfig;
use ridi_orchestrator::downloader::MockDownloader;
use ridi_orchestrator::fleet::FleetConfig;
use ridi_orchestrator::map_data_worker::{MapDataWorker, MapDataWorkerConfig};
use ridi_orchestrator::plan_listener::PlanListenerConfig;
use ridi_orchestrator::runner::MockRunner;
use ridi_orchestrator::runtime::{RouterRuntime, RouterRuntimeBuilder};

pub const BASE: &str = "http://osm.test";
pub const ANDORRA: &str = "europe/andorra";
pub const MONACO: &str = "europe/monaco";

/// Boundary of a region as served upstream: a rectangle in KML.
pub fn kml(name: &str, min_lon: f64, min_lat: f64, max_lon: f64, max_lat: f64) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<kml xmlns="http://www.opengis.net/kml/2.2">
  <Document>
    <Placemark>
      <name>{name}</name>
      <Polygon>
        <outerBoundaryIs>
          <LinearRing>
            <coordinates>{min_lon},{min_lat} {max_lon},{min_lat} {max_lon},{max_lat} {min_lon},{max_lat} {min_lon},{min_lat}</coordinates>
          </LinearRing>
        </outerBoundaryIs>
      </Polygon>
    </Placemark>
  </Document>
</kml>"#
    )
}

/// Router client output with one route per `(len_m, score)`.
pub fn routes_output(routes: &[(f64, f64)]) -> String {
    let routes: Vec<serde_json::Value> = routes
        .iter()
        .map(|(len_m, score)| {
            serde_json::json!({
                "coords": [{"lat": 42.5, "lon": 1.5}, {"lat": 42.55, "lon": 1.55}],
                "stats": {
                    "len_m": len_m,
                    "junction_count": 4,
                    "score": score,
                    "cluster": 0,
                    "highway": {"primary": {"len_m": len_m, "percentage": 100.0}},
                    "surface": {},
                    "smoothness": {},
                    "approximated_route": [],
                }
            })
        })
        .collect();
    serde_json::json!({"id": "test", "result": {"ok": {"routes": routes}}}).to_string()
}

/// Start-finish plan between two `(lat, lon)` points.
pub fn start_finish(start: (f64, f64), finish: (f64, f64)) -> NewPlan {
    NewPlan {
        user_id: "user-1".to_string(),
        trip_type: Some(TripType::StartFinish),
        start_lat: start.0.to_string(),
        start_lon: start.1.to_string(),
        finish_lat: Some(finish.0.to_string()),
        finish_lon: Some(finish.1.to_string()),
        ..Default::default()
    }
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check().await
}

/// Store, upstream and router binary shared by both services.
pub struct TestContext {
    pub store: Arc<dyn Persistence>,
    pub downloader: Arc<MockDownloader>,
    pub runner: Arc<MockRunner>,
    pub dir: TempDir,
}

impl TestContext {
    /// Fresh context; nothing is published upstream.
    pub async fn new() -> Self {
        Self::with_runner(MockRunner::new()).await
    }

    /// Fresh context around a configured mock runner.
    pub async fn with_runner(runner: MockRunner) -> Self {
        let store = SqlitePersistence::connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory store");
        Self {
            store: Arc::new(store),
            downloader: Arc::new(MockDownloader::new()),
            runner: Arc::new(runner),
            dir: TempDir::new().expect("Failed to create temp dir"),
        }
    }

    /// Publish a region's extract, checksum and boundary upstream.
    pub fn publish(&self, region: &str, md5: &str, boundary: &str) {
        self.downloader
            .serve(&format!("{}/{}.kml", BASE, region), boundary.to_string());
        self.downloader
            .serve(&format!("{}/{}-latest.osm.pbf", BASE, region), vec![7u8; 2048]);
        self.publish_md5(region, md5);
    }

    /// Publish a new checksum for an already published region.
    pub fn publish_md5(&self, region: &str, md5: &str) {
        self.downloader.serve(
            &format!("{}/{}-latest.osm.pbf.md5", BASE, region),
            format!("{}  {}-latest.osm.pbf", md5, region),
        );
    }

    /// How often a region's extract was downloaded.
    pub fn pbf_downloads(&self, region: &str) -> usize {
        self.downloader
            .request_count(&format!("{}/{}-latest.osm.pbf", BASE, region))
    }

    /// One map-data run for `regions` built with `router_version`.
    pub async fn run_map_data(&self, regions: &[&str], router_version: &str) {
        let config = MapDataWorkerConfig {
            regions: regions.iter().map(|r| r.to_string()).collect(),
            router_version: router_version.to_string(),
            data_dir: self.dir.path().to_path_buf(),
            osm_base_url: BASE.to_string(),
            download_cooldown: Duration::ZERO,
            ..Default::default()
        };
        MapDataWorker::new(
            self.store.clone(),
            self.downloader.clone(),
            self.runner.clone(),
            config,
        )
        .expect("map-data worker config rejected")
        .run_once()
        .await
        .expect("map-data run failed");
    }

    /// Router runtime builder with fast timings and no health endpoint.
    pub fn router(&self, regions: &[&str], router_version: &str) -> RouterRuntimeBuilder {
        RouterRuntime::builder()
            .store(self.store.clone())
            .runner(self.runner.clone())
            .regions(regions.iter().map(|r| r.to_string()).collect())
            .router_version(router_version)
            .fleet_config(FleetConfig {
                tick_interval: Duration::from_millis(10),
                ..Default::default()
            })
            .listener_config(PlanListenerConfig {
                poll_interval: Duration::from_millis(10),
                ..Default::default()
            })
            .dispatcher_config(DispatcherConfig {
                retry_after: Duration::ZERO,
            })
    }

    /// Wait for a plan to reach `state`.
    pub async fn wait_for_plan(&self, plan_id: &str, state: PlanState) -> bool {
        let store = self.store.clone();
        let plan_id = plan_id.to_string();
        wait_until(Duration::from_secs(5), move || {
            let store = store.clone();
            let plan_id = plan_id.clone();
            async move {
                matches!(store.plan_get(&plan_id).await, Ok(Some(plan)) if plan.state == state)
            }
        })
        .await
    }
}

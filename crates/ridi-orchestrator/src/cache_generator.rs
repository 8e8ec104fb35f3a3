// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Routing cache builds.
//!
//! Builds run one at a time on a single worker task fed by an unbounded
//! channel. Each build runs `prep-cache`, measures the cache and the router's
//! cold-start latency, stores the region boundary and marks the record
//! `ready`. While a build runs the record's `updated_at` is refreshed
//! periodically so other observers can tell a live build from a stale one.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use ridi_core::Persistence;
use ridi_core::models::{MapDataRecord, MapDataStatus, MapDataVersion, NewRegionBoundary};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::boundary;
use crate::error::Result;
use crate::runner::{Runner, ServerOptions};
use crate::status::StatusChecker;

/// Configuration for the cache generator.
#[derive(Debug, Clone)]
pub struct CacheGeneratorConfig {
    /// Processing heartbeat period.
    pub heartbeat_interval: Duration,
    /// Readiness bound for the startup measurement.
    pub startup_timeout: Duration,
}

impl Default for CacheGeneratorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(60),
            startup_timeout: Duration::from_secs(600),
        }
    }
}

struct Inner {
    store: Arc<dyn Persistence>,
    runner: Arc<dyn Runner>,
    status: StatusChecker,
    config: CacheGeneratorConfig,
}

/// Single-concurrency cache build queue.
#[derive(Clone)]
pub struct CacheGenerator {
    tx: mpsc::UnboundedSender<MapDataRecord>,
    /// Ids queued or building.
    pending: Arc<watch::Sender<HashSet<String>>>,
}

impl CacheGenerator {
    /// Start the build worker. Must be called inside a Tokio runtime.
    pub fn start(
        store: Arc<dyn Persistence>,
        runner: Arc<dyn Runner>,
        status: StatusChecker,
        config: CacheGeneratorConfig,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (pending, _) = watch::channel(HashSet::new());
        let pending = Arc::new(pending);

        let inner = Arc::new(Inner {
            store,
            runner,
            status,
            config,
        });
        tokio::spawn(worker(inner, rx, pending.clone()));

        Self { tx, pending }
    }

    /// Queue a build. Returns immediately; a record already queued or
    /// building is not queued twice.
    pub fn schedule(&self, record: MapDataRecord) {
        let id = record.id.clone();
        let added = self.pending.send_if_modified(|pending| pending.insert(id.clone()));
        if !added {
            debug!(id = %id, "Cache build already scheduled");
            return;
        }

        debug!(id = %id, region = %record.region, "Cache build scheduled");
        if self.tx.send(record).is_err() {
            error!(id = %id, "Cache build worker is gone");
            self.pending.send_modify(|pending| {
                pending.remove(&id);
            });
        }
    }

    /// Number of builds queued or running.
    pub fn pending(&self) -> usize {
        self.pending.borrow().len()
    }

    /// Resolve once nothing is queued and no build runs.
    pub async fn wait_till_done(&self) {
        let mut rx = self.pending.subscribe();
        let _ = rx.wait_for(|pending| pending.is_empty()).await;
    }
}

async fn worker(
    inner: Arc<Inner>,
    mut rx: mpsc::UnboundedReceiver<MapDataRecord>,
    pending: Arc<watch::Sender<HashSet<String>>>,
) {
    while let Some(record) = rx.recv().await {
        if let Err(e) = inner.generate_cache(&record).await {
            error!(id = %record.id, region = %record.region, error = %e, "Cache generation failed");
        }
        if let Err(e) = inner.status.check_status().await {
            warn!(error = %e, "Status check after cache build failed");
        }
        pending.send_modify(|pending| {
            pending.remove(&record.id);
        });
    }
    debug!("Cache build worker stopped");
}

impl Inner {
    async fn generate_cache(&self, record: &MapDataRecord) -> Result<()> {
        info!(id = %record.id, region = %record.region, router_version = %record.router_version, "Starting cache generation");

        self.store
            .map_data_set_status(&record.id, MapDataStatus::Processing)
            .await?;

        let heartbeat = tokio::spawn(heartbeat(
            self.store.clone(),
            record.id.clone(),
            self.config.heartbeat_interval,
        ));
        let result = self.build(record).await;
        heartbeat.abort();

        if let Err(e) = &result {
            self.store
                .map_data_set_failed(&record.id, &e.to_string())
                .await?;
        }
        result
    }

    async fn build(&self, record: &MapDataRecord) -> Result<()> {
        let pbf = PathBuf::from(&record.pbf_location);
        let cache_dir = PathBuf::from(&record.cache_location);
        tokio::fs::create_dir_all(&cache_dir).await?;

        let prep = self.runner.prep_cache(&pbf, &cache_dir).await?;
        debug!(
            id = %record.id,
            exit_code = prep.exit_code,
            stdout = %prep.stdout,
            stderr = %prep.stderr,
            "Cache generation process output"
        );

        let cache_size = dir_size(&cache_dir).await?;

        let started = Instant::now();
        let mut server = self
            .runner
            .start_server(&ServerOptions {
                pbf,
                cache_dir,
                socket_name: format!("ridi-cache-{}", Uuid::new_v4()),
                startup_timeout: self.config.startup_timeout,
            })
            .await?;
        let startup = started.elapsed();
        server.kill().await;

        let startup_time_s = startup.as_secs_f64().ceil() as i64;
        self.store
            .map_data_set_build_metrics(&record.id, cache_size as i64, startup_time_s)
            .await?;

        self.store_boundary(record).await?;

        self.store
            .map_data_set_status(&record.id, MapDataStatus::Ready)
            .await?;

        if prep.success() {
            info!(id = %record.id, region = %record.region, cache_size, startup_time_s, "Cache ready");
        } else {
            error!(id = %record.id, exit_code = prep.exit_code, stderr = %prep.stderr, "Cache generation exited with error");
            self.store
                .map_data_set_error_message(
                    &record.id,
                    &format!("stdout: {}\n\nstderr: {}", prep.stdout, prep.stderr),
                )
                .await?;
        }
        Ok(())
    }

    /// Upsert the boundary unless it is already serving as `current`.
    async fn store_boundary(&self, record: &MapDataRecord) -> Result<()> {
        if let Some(existing) = self.store.region_get(&record.region, &record.pbf_md5).await?
            && existing.version == MapDataVersion::Current
        {
            debug!(region = %record.region, md5 = %record.pbf_md5, "Boundary already current");
            return Ok(());
        }

        let ring = boundary::read_kml(Path::new(&record.kml_location)).await?;
        self.store
            .region_upsert(&NewRegionBoundary {
                region: record.region.clone(),
                pbf_md5: record.pbf_md5.clone(),
                ring,
            })
            .await?;
        Ok(())
    }
}

async fn heartbeat(store: Arc<dyn Persistence>, id: String, period: Duration) {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    loop {
        interval.tick().await;
        if let Err(e) = store
            .map_data_set_status(&id, MapDataStatus::Processing)
            .await
        {
            warn!(id = %id, error = %e, "Processing heartbeat failed");
        }
    }
}

/// Total size of the files below `dir`.
pub async fn dir_size(dir: &Path) -> Result<u64> {
    let mut total = 0;
    let mut stack = vec![dir.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let metadata = tokio::fs::symlink_metadata(entry.path()).await?;
            if metadata.is_dir() {
                stack.push(entry.path());
            } else {
                total += metadata.len();
            }
        }
    }
    Ok(total)
}

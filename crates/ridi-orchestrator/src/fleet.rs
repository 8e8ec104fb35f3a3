// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Router process fleet.
//!
//! One router server per region, started on demand and stopped when memory
//! is needed for another region. Demand is tracked per region as a queue of
//! waiting request ids plus the set of requests currently talking to the
//! server.
//!
//! A control tick runs every few hundred milliseconds:
//!
//! 1. Running servers that exited on their own are reset to not-running and
//!    their in-flight requests go back to the waiting queue.
//! 2. Regions with waiting requests and no server are ordered by the age of
//!    their oldest waiting request, oldest first.
//! 3. Each of them is started if twice its cache size fits under the memory
//!    ceiling. Otherwise idle servers are stopped, smallest first, but only
//!    if stopping all idle servers would free enough memory.
//!
//! Servers start on spawned tasks so the tick never waits for readiness. The
//! registry is built from the `current` map-data records when the process
//! starts and is not refreshed afterwards; a promotion takes effect on the
//! next restart.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use ridi_core::Persistence;
use ridi_core::models::{MapDataRecord, MapDataVersion};
use tokio::sync::{Mutex, Notify};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::runner::{RouterServer, Runner, ServerOptions};

const MIB: u64 = 1024 * 1024;

/// Fleet configuration.
#[derive(Debug, Clone)]
pub struct FleetConfig {
    /// Memory available to router servers, in MiB.
    pub memory_ceiling_mb: u64,
    /// Readiness bound for a starting server.
    pub startup_timeout: Duration,
    /// Control tick period.
    pub tick_interval: Duration,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            memory_ceiling_mb: 4096,
            startup_timeout: Duration::from_secs(600),
            tick_interval: Duration::from_millis(500),
        }
    }
}

impl From<&Config> for FleetConfig {
    fn from(config: &Config) -> Self {
        Self {
            memory_ceiling_mb: config.router_memory_ceiling_mb,
            startup_timeout: config.router_startup_timeout,
            tick_interval: config.router_tick_interval,
        }
    }
}

/// Lifecycle of a region's server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// No server.
    NotRunning,
    /// Spawned, waiting for the readiness line.
    Starting,
    /// Accepting client requests.
    Running,
}

impl ProcessState {
    /// Lowercase name used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessState::NotRunning => "not-running",
            ProcessState::Starting => "starting",
            ProcessState::Running => "running",
        }
    }
}

/// Artifacts a region's server is started from.
#[derive(Debug, Clone, PartialEq)]
pub struct FleetRegion {
    /// Region key; also the server's socket name.
    pub region: String,
    /// Raw extract.
    pub pbf: PathBuf,
    /// Routing cache directory.
    pub cache_dir: PathBuf,
    /// Cache size in bytes.
    pub cache_size: u64,
}

impl From<&MapDataRecord> for FleetRegion {
    fn from(record: &MapDataRecord) -> Self {
        Self {
            region: record.region.clone(),
            pbf: PathBuf::from(&record.pbf_location),
            cache_dir: PathBuf::from(&record.cache_location),
            cache_size: record.cache_size_bytes(),
        }
    }
}

#[derive(Debug, Clone)]
struct QueuedRequest {
    id: String,
    enqueued_at: Instant,
}

struct RegionProcess {
    artifacts: FleetRegion,
    state: ProcessState,
    /// Ordered by enqueue time.
    waiting: Vec<QueuedRequest>,
    running: Vec<QueuedRequest>,
    server: Option<Box<dyn RouterServer>>,
    /// Bumped whenever a start begins or the server is torn down, so a start
    /// that finishes after a stop can be recognised as stale.
    generation: u64,
}

impl RegionProcess {
    fn new(artifacts: FleetRegion) -> Self {
        Self {
            artifacts,
            state: ProcessState::NotRunning,
            waiting: Vec::new(),
            running: Vec::new(),
            server: None,
            generation: 0,
        }
    }

    fn cache_size_mb(&self) -> u64 {
        self.artifacts.cache_size.div_ceil(MIB)
    }

    /// Loading a cache needs about twice its size.
    fn startup_memory_mb(&self) -> u64 {
        self.cache_size_mb() * 2
    }

    fn fits_ceiling(&self, ceiling_mb: u64) -> bool {
        self.startup_memory_mb() <= ceiling_mb
    }

    fn memory_usage_mb(&self) -> u64 {
        match self.state {
            ProcessState::NotRunning => 0,
            ProcessState::Starting => self.startup_memory_mb(),
            ProcessState::Running => self.cache_size_mb(),
        }
    }

    fn is_stoppable(&self) -> bool {
        self.state == ProcessState::Running && self.waiting.is_empty() && self.running.is_empty()
    }

    fn oldest_wait(&self, now: Instant) -> Duration {
        self.waiting
            .iter()
            .map(|r| now.saturating_duration_since(r.enqueued_at))
            .max()
            .unwrap_or_default()
    }

    /// Begin a start; returns the generation the start belongs to.
    fn mark_starting(&mut self) -> u64 {
        self.state = ProcessState::Starting;
        self.generation += 1;
        self.generation
    }

    /// Drop the server and put in-flight requests back in the queue.
    fn tear_down(&mut self) -> Option<Box<dyn RouterServer>> {
        self.state = ProcessState::NotRunning;
        self.generation += 1;
        for request in self.running.drain(..) {
            if !self.waiting.iter().any(|w| w.id == request.id) {
                self.waiting.push(request);
            }
        }
        self.waiting.sort_by_key(|r| r.enqueued_at);
        self.server.take()
    }

    fn server_options(&self, startup_timeout: Duration) -> ServerOptions {
        ServerOptions {
            pbf: self.artifacts.pbf.clone(),
            cache_dir: self.artifacts.cache_dir.clone(),
            socket_name: self.artifacts.region.clone(),
            startup_timeout,
        }
    }
}

/// What a tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Regions whose start was launched.
    pub started: Vec<String>,
    /// Idle regions stopped to free memory.
    pub stopped: Vec<String>,
    /// Regions whose server was found dead.
    pub crashed: Vec<String>,
    /// Regions that need a start but did not fit.
    pub deferred: Vec<String>,
}

/// Clears the tick flag when the tick ends, including on cancellation.
struct TickGuard<'a>(&'a AtomicBool);

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Registry of router servers, one per region.
pub struct RouterFleet {
    regions: Mutex<HashMap<String, RegionProcess>>,
    runner: Arc<dyn Runner>,
    config: FleetConfig,
    ticking: AtomicBool,
    shutdown: Arc<Notify>,
}

impl RouterFleet {
    /// Create a fleet with every region stopped.
    pub fn new(
        regions: impl IntoIterator<Item = FleetRegion>,
        runner: Arc<dyn Runner>,
        config: FleetConfig,
    ) -> Self {
        let regions = regions
            .into_iter()
            .map(|r| (r.region.clone(), RegionProcess::new(r)))
            .collect();
        Self {
            regions: Mutex::new(regions),
            runner,
            config,
            ticking: AtomicBool::new(false),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Create a fleet from the `current` map-data records.
    pub async fn from_store(
        store: &dyn Persistence,
        runner: Arc<dyn Runner>,
        config: FleetConfig,
    ) -> Result<Self> {
        let records = store.map_data_list_by_version(MapDataVersion::Current).await?;
        info!(
            regions = records.len(),
            memory_ceiling_mb = config.memory_ceiling_mb,
            "Router fleet created"
        );
        Ok(Self::new(records.iter().map(FleetRegion::from), runner, config))
    }

    /// Get a handle to signal shutdown of [`RouterFleet::run`].
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Whether the region is managed by this fleet.
    pub async fn contains(&self, region: &str) -> bool {
        self.regions.lock().await.contains_key(region)
    }

    /// Whether the region's startup memory fits under the ceiling at all.
    /// A region that does not fit would be deferred by every tick.
    pub async fn can_ever_start(&self, region: &str) -> bool {
        self.regions
            .lock()
            .await
            .get(region)
            .is_some_and(|p| p.fits_ceiling(self.config.memory_ceiling_mb))
    }

    /// Queue a request for a region. Registering the same id twice keeps the
    /// original enqueue time. Regions that can never start are refused.
    pub async fn register_request(&self, region: &str, request_id: &str) -> Result<()> {
        let mut regions = self.regions.lock().await;
        let process = regions.get_mut(region).ok_or_else(|| unknown_region(region))?;
        if !process.fits_ceiling(self.config.memory_ceiling_mb) {
            return Err(Error::Invariant(format!(
                "region '{}' needs {} MiB to start, ceiling is {} MiB",
                region,
                process.startup_memory_mb(),
                self.config.memory_ceiling_mb
            )));
        }
        if !process.waiting.iter().any(|r| r.id == request_id) {
            process.waiting.push(QueuedRequest {
                id: request_id.to_string(),
                enqueued_at: Instant::now(),
            });
            debug!(region = %region, request_id = %request_id, waiting = process.waiting.len(), "Request registered");
        }
        Ok(())
    }

    /// Move a request from waiting to running. A request that was never
    /// registered is enqueued as of now.
    pub async fn start_request(&self, region: &str, request_id: &str) -> Result<()> {
        let mut regions = self.regions.lock().await;
        let process = regions.get_mut(region).ok_or_else(|| unknown_region(region))?;
        let enqueued_at = match process.waiting.iter().position(|r| r.id == request_id) {
            Some(pos) => process.waiting.remove(pos).enqueued_at,
            None => Instant::now(),
        };
        if !process.running.iter().any(|r| r.id == request_id) {
            process.running.push(QueuedRequest {
                id: request_id.to_string(),
                enqueued_at,
            });
        }
        Ok(())
    }

    /// Forget a request, waiting or running.
    pub async fn finish_request(&self, region: &str, request_id: &str) {
        let mut regions = self.regions.lock().await;
        match regions.get_mut(region) {
            Some(process) => {
                process.waiting.retain(|r| r.id != request_id);
                process.running.retain(|r| r.id != request_id);
            }
            None => warn!(region = %region, request_id = %request_id, "Finished request for unknown region"),
        }
    }

    /// Forget a request in whichever region holds it. Used when a plan is
    /// abandoned without knowing which region it was queued for. Returns
    /// whether anything was removed.
    pub async fn cancel_request(&self, request_id: &str) -> bool {
        let mut regions = self.regions.lock().await;
        let mut removed = false;
        for (name, process) in regions.iter_mut() {
            let before = process.waiting.len() + process.running.len();
            process.waiting.retain(|r| r.id != request_id);
            process.running.retain(|r| r.id != request_id);
            if process.waiting.len() + process.running.len() != before {
                debug!(region = %name, request_id = %request_id, "Request cancelled");
                removed = true;
            }
        }
        removed
    }

    /// Whether the region's server accepts requests.
    pub async fn is_running(&self, region: &str) -> bool {
        self.state(region).await == Some(ProcessState::Running)
    }

    /// Lifecycle state of a region.
    pub async fn state(&self, region: &str) -> Option<ProcessState> {
        self.regions.lock().await.get(region).map(|p| p.state)
    }

    /// Number of requests waiting for a region.
    pub async fn waiting_count(&self, region: &str) -> usize {
        self.regions
            .lock()
            .await
            .get(region)
            .map(|p| p.waiting.len())
            .unwrap_or(0)
    }

    /// Memory accounted to a region in MiB: 0 when stopped, twice the cache
    /// while starting, the cache size while running.
    pub async fn memory_usage_mb(&self, region: &str) -> u64 {
        self.regions
            .lock()
            .await
            .get(region)
            .map(|p| p.memory_usage_mb())
            .unwrap_or(0)
    }

    /// Memory accounted to all regions in MiB.
    pub async fn total_memory_mb(&self) -> u64 {
        self.regions
            .lock()
            .await
            .values()
            .map(|p| p.memory_usage_mb())
            .sum()
    }

    /// One control step. Concurrent calls return immediately with an empty
    /// report while another tick is in progress.
    pub async fn tick(self: &Arc<Self>) -> TickReport {
        if self
            .ticking
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Fleet tick already in progress");
            return TickReport::default();
        }
        let _guard = TickGuard(&self.ticking);

        let mut report = TickReport::default();
        let mut to_kill = Vec::new();
        let mut to_start = Vec::new();

        {
            let mut regions = self.regions.lock().await;

            for (name, process) in regions.iter_mut() {
                if process.state != ProcessState::Running {
                    continue;
                }
                let exited = match process.server.as_mut() {
                    Some(server) => server.has_exited().await,
                    None => true,
                };
                if exited {
                    warn!(region = %name, in_flight = process.running.len(), "Router server exited unexpectedly");
                    process.tear_down();
                    report.crashed.push(name.clone());
                }
            }

            let ceiling = self.config.memory_ceiling_mb;
            let now = Instant::now();
            let mut must_start: Vec<(String, Duration)> = regions
                .iter()
                .filter(|(_, p)| p.state == ProcessState::NotRunning && !p.waiting.is_empty())
                .filter(|(_, p)| p.fits_ceiling(ceiling))
                .map(|(name, p)| (name.clone(), p.oldest_wait(now)))
                .collect();
            must_start.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

            let mut total: u64 = regions.values().map(|p| p.memory_usage_mb()).sum();

            for (region, wait) in must_start {
                let Some(needed) = regions.get(&region).map(|p| p.startup_memory_mb()) else {
                    continue;
                };
                let free = ceiling.saturating_sub(total);

                if needed > free {
                    let mut stoppable: Vec<(String, u64)> = regions
                        .iter()
                        .filter(|(_, p)| p.is_stoppable())
                        .map(|(name, p)| (name.clone(), p.memory_usage_mb()))
                        .collect();
                    stoppable.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));

                    let freeable: u64 = stoppable.iter().map(|(_, mb)| mb).sum();
                    if free + freeable < needed {
                        info!(
                            region = %region,
                            needed_mb = needed,
                            free_mb = free,
                            freeable_mb = freeable,
                            "Not enough memory to start router, all servers busy"
                        );
                        report.deferred.push(region);
                        continue;
                    }

                    let mut freed = 0;
                    for (name, mb) in stoppable {
                        if free + freed >= needed {
                            break;
                        }
                        if let Some(process) = regions.get_mut(&name) {
                            info!(region = %name, memory_mb = mb, for_region = %region, "Stopping idle router to free memory");
                            to_kill.extend(process.tear_down());
                            freed += mb;
                            report.stopped.push(name);
                        }
                    }
                    total -= freed;
                }

                if let Some(process) = regions.get_mut(&region) {
                    let generation = process.mark_starting();
                    total += needed;
                    info!(
                        region = %region,
                        memory_mb = needed,
                        waited_ms = wait.as_millis() as u64,
                        total_mb = total,
                        "Starting router"
                    );
                    to_start.push((
                        region.clone(),
                        generation,
                        process.server_options(self.config.startup_timeout),
                    ));
                    report.started.push(region);
                }
            }
        }

        for mut server in to_kill {
            server.kill().await;
        }

        for (region, generation, options) in to_start {
            let fleet = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = fleet.launch(&region, generation, options).await {
                    error!(region = %region, error = %e, "Unable to start router");
                }
            });
        }

        report
    }

    /// Start a region's server and wait for readiness. Does not check the
    /// memory budget.
    pub async fn start_region(&self, region: &str) -> Result<()> {
        let (generation, options) = {
            let mut regions = self.regions.lock().await;
            let process = regions.get_mut(region).ok_or_else(|| unknown_region(region))?;
            if process.state != ProcessState::NotRunning {
                debug!(region = %region, state = process.state.as_str(), "Router already started");
                return Ok(());
            }
            let generation = process.mark_starting();
            (generation, process.server_options(self.config.startup_timeout))
        };
        self.launch(region, generation, options).await
    }

    async fn launch(&self, region: &str, generation: u64, options: ServerOptions) -> Result<()> {
        let started_at = Instant::now();
        let result = self.runner.start_server(&options).await;

        let mut regions = self.regions.lock().await;
        let Some(process) = regions.get_mut(region) else {
            return Err(unknown_region(region));
        };
        let current = process.state == ProcessState::Starting && process.generation == generation;

        match result {
            Ok(server) if current => {
                process.state = ProcessState::Running;
                process.server = Some(server);
                info!(
                    region = %region,
                    startup_ms = started_at.elapsed().as_millis() as u64,
                    memory_mb = process.memory_usage_mb(),
                    "Router running"
                );
                Ok(())
            }
            Ok(mut server) => {
                drop(regions);
                debug!(region = %region, "Router stopped while starting, discarding server");
                server.kill().await;
                Ok(())
            }
            Err(e) => {
                if current {
                    process.state = ProcessState::NotRunning;
                }
                Err(e.into())
            }
        }
    }

    /// Stop a region's server. Requests that were talking to it go back to
    /// the waiting queue with their original enqueue time. Returns whether a
    /// server was running or starting.
    pub async fn stop_region(&self, region: &str) -> bool {
        let server = {
            let mut regions = self.regions.lock().await;
            let Some(process) = regions.get_mut(region) else {
                return false;
            };
            if process.state == ProcessState::NotRunning {
                return false;
            }
            process.tear_down()
        };
        if let Some(mut server) = server {
            server.kill().await;
        }
        info!(region = %region, "Router stopped");
        true
    }

    /// Stop a region whose server misbehaved.
    pub async fn force_stop(&self, region: &str) {
        warn!(region = %region, "Force stopping router");
        self.stop_region(region).await;
    }

    /// Stop every server.
    pub async fn stop_all(&self) {
        let servers: Vec<_> = {
            let mut regions = self.regions.lock().await;
            regions
                .values_mut()
                .filter(|p| p.state != ProcessState::NotRunning)
                .filter_map(|p| p.tear_down())
                .collect()
        };
        for mut server in servers {
            server.kill().await;
        }
    }

    /// Tick until shutdown is signalled, then stop every server.
    pub async fn run(self: Arc<Self>) {
        info!(
            tick_interval_ms = self.config.tick_interval.as_millis() as u64,
            "Router fleet control loop started"
        );

        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("Router fleet shutting down");
                    break;
                }
                _ = interval.tick() => {
                    self.tick().await;
                }
            }
        }

        self.stop_all().await;
    }
}

fn unknown_region(region: &str) -> Error {
    Error::Invariant(format!("region '{}' is not served by this fleet", region))
}

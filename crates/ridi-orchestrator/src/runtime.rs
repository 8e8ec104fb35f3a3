// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtimes for the two ridi services.
//!
//! [`RouterRuntime`] serves plans: it reconciles persisted map data with the
//! running router version, builds the fleet from the `current` generation and
//! spawns the fleet control loop, the plan listener and the health endpoint.
//! [`MapDataRuntime`] keeps map data fresh by running the map-data worker.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use ridi_orchestrator::config::Config;
//! use ridi_orchestrator::runner::ProcessRunner;
//! use ridi_orchestrator::runtime::RouterRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let store = ridi_core::connect(&config.database_url).await?;
//!
//!     let runtime = RouterRuntime::builder()
//!         .store(store)
//!         .runner(Arc::new(ProcessRunner::new(&config.router_bin)))
//!         .config(&config)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::Result;
use ridi_core::Persistence;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::Config;
use crate::dispatcher::{DispatcherConfig, PlanDispatcher};
use crate::downloader::Downloader;
use crate::fleet::{FleetConfig, RouterFleet};
use crate::health::{self, HealthState};
use crate::map_data_worker::{MapDataWorker, MapDataWorkerConfig};
use crate::plan_listener::{PlanListener, PlanListenerConfig};
use crate::reconcile::{ReconcileReport, reconcile};
use crate::runner::Runner;

/// Builder for creating a [`RouterRuntime`].
#[derive(Default)]
pub struct RouterRuntimeBuilder {
    store: Option<Arc<dyn Persistence>>,
    runner: Option<Arc<dyn Runner>>,
    regions: Vec<String>,
    router_version: Option<String>,
    health_addr: Option<SocketAddr>,
    fleet: FleetConfig,
    listener: PlanListenerConfig,
    dispatcher: DispatcherConfig,
}

impl RouterRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the persistence layer (required).
    pub fn store(mut self, store: Arc<dyn Persistence>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the router binary runner (required).
    pub fn runner(mut self, runner: Arc<dyn Runner>) -> Self {
        self.runner = Some(runner);
        self
    }

    /// Take regions, router version, health address and fleet settings from
    /// the service configuration.
    pub fn config(mut self, config: &Config) -> Self {
        self.regions = config.regions.clone();
        self.router_version = Some(config.router_version.clone());
        self.health_addr = Some(config.health_addr);
        self.fleet = FleetConfig::from(config);
        self
    }

    /// Set the configured regions.
    pub fn regions(mut self, regions: Vec<String>) -> Self {
        self.regions = regions;
        self
    }

    /// Set the running router version (required).
    pub fn router_version(mut self, version: impl Into<String>) -> Self {
        self.router_version = Some(version.into());
        self
    }

    /// Serve the health endpoint on this address.
    ///
    /// Default: no health endpoint.
    pub fn health_addr(mut self, addr: SocketAddr) -> Self {
        self.health_addr = Some(addr);
        self
    }

    /// Set the fleet configuration.
    pub fn fleet_config(mut self, config: FleetConfig) -> Self {
        self.fleet = config;
        self
    }

    /// Set the plan listener configuration.
    pub fn listener_config(mut self, config: PlanListenerConfig) -> Self {
        self.listener = config;
        self
    }

    /// Set the plan dispatcher configuration.
    pub fn dispatcher_config(mut self, config: DispatcherConfig) -> Self {
        self.dispatcher = config;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<RouterRuntimeConfig> {
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store is required"))?;
        let runner = self
            .runner
            .ok_or_else(|| anyhow::anyhow!("runner is required"))?;
        let router_version = self
            .router_version
            .ok_or_else(|| anyhow::anyhow!("router_version is required"))?;

        Ok(RouterRuntimeConfig {
            store,
            runner,
            regions: self.regions,
            router_version,
            health_addr: self.health_addr,
            fleet: self.fleet,
            listener: self.listener,
            dispatcher: self.dispatcher,
        })
    }
}

/// Configuration for a [`RouterRuntime`].
pub struct RouterRuntimeConfig {
    store: Arc<dyn Persistence>,
    runner: Arc<dyn Runner>,
    regions: Vec<String>,
    router_version: String,
    health_addr: Option<SocketAddr>,
    fleet: FleetConfig,
    listener: PlanListenerConfig,
    dispatcher: DispatcherConfig,
}

impl RouterRuntimeConfig {
    /// Reconcile persisted state and start all router service tasks.
    ///
    /// Fails without spawning anything when reconciliation finds the
    /// persisted map data unfit to serve.
    pub async fn start(self) -> Result<RouterRuntime> {
        let report = reconcile(self.store.as_ref(), &self.regions, &self.router_version).await?;

        let fleet = Arc::new(
            RouterFleet::from_store(self.store.as_ref(), self.runner.clone(), self.fleet).await?,
        );
        let fleet_shutdown = fleet.shutdown_handle();
        let fleet_handle = tokio::spawn(fleet.clone().run());

        let dispatcher = Arc::new(PlanDispatcher::new(
            self.store.clone(),
            fleet.clone(),
            self.runner.clone(),
            self.dispatcher,
        ));
        let listener = PlanListener::new(self.store.clone(), dispatcher, self.listener);
        let listener_shutdown = listener.shutdown_handle();
        let messaging_running = listener.running_flag();
        let listener_handle = tokio::spawn(listener.run());

        let (health_shutdown_tx, health_shutdown_rx) = watch::channel(false);
        let health_handle = self.health_addr.map(|addr| {
            let router = health::create_router(HealthState {
                store: self.store.clone(),
                messaging_running: messaging_running.clone(),
            });
            tokio::spawn(health::serve(addr, router, health_shutdown_rx))
        });

        info!(
            regions = self.regions.len(),
            router_version = %self.router_version,
            health_addr = ?self.health_addr,
            "RouterRuntime started"
        );

        Ok(RouterRuntime {
            report,
            fleet,
            fleet_handle,
            fleet_shutdown,
            listener_handle,
            listener_shutdown,
            health_handle,
            health_shutdown_tx,
            messaging_running,
        })
    }
}

/// A running router service.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct RouterRuntime {
    report: ReconcileReport,
    fleet: Arc<RouterFleet>,
    fleet_handle: JoinHandle<()>,
    fleet_shutdown: Arc<Notify>,
    listener_handle: JoinHandle<crate::error::Result<()>>,
    listener_shutdown: Arc<Notify>,
    health_handle: Option<JoinHandle<crate::error::Result<()>>>,
    health_shutdown_tx: watch::Sender<bool>,
    messaging_running: Arc<std::sync::atomic::AtomicBool>,
}

impl RouterRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> RouterRuntimeBuilder {
        RouterRuntimeBuilder::new()
    }

    /// What startup reconciliation did.
    pub fn reconcile_report(&self) -> &ReconcileReport {
        &self.report
    }

    /// The fleet serving the `current` regions.
    pub fn fleet(&self) -> &Arc<RouterFleet> {
        &self.fleet
    }

    /// Whether the plan listener is polling.
    pub fn is_messaging_running(&self) -> bool {
        self.messaging_running.load(Ordering::SeqCst)
    }

    /// Gracefully shut down the runtime.
    ///
    /// The listener stops first and finishes in-flight plans, then the fleet
    /// stops every router server, then the health endpoint closes.
    pub async fn shutdown(self) -> Result<()> {
        info!("RouterRuntime shutting down...");

        self.listener_shutdown.notify_one();
        match self.listener_handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Plan listener error during shutdown: {}", e),
            Err(e) => error!("Plan listener task panicked: {}", e),
        }

        self.fleet_shutdown.notify_one();
        if let Err(e) = self.fleet_handle.await {
            error!("Fleet control loop task panicked: {}", e);
        }

        let _ = self.health_shutdown_tx.send(true);
        match self.health_handle {
            None => {
                info!("RouterRuntime shutdown complete");
                Ok(())
            }
            Some(handle) => match handle.await {
                Ok(Ok(())) => {
                    info!("RouterRuntime shutdown complete");
                    Ok(())
                }
                Ok(Err(e)) => {
                    error!("Health endpoint error during shutdown: {}", e);
                    Err(e.into())
                }
                Err(e) => {
                    error!("Health endpoint task panicked: {}", e);
                    Err(anyhow::anyhow!("health task panicked: {}", e))
                }
            },
        }
    }

    /// Check if the runtime is still running.
    pub fn is_running(&self) -> bool {
        let health_running = self
            .health_handle
            .as_ref()
            .is_none_or(|h| !h.is_finished());
        !self.fleet_handle.is_finished() && !self.listener_handle.is_finished() && health_running
    }
}

/// Builder for creating a [`MapDataRuntime`].
#[derive(Default)]
pub struct MapDataRuntimeBuilder {
    store: Option<Arc<dyn Persistence>>,
    downloader: Option<Arc<dyn Downloader>>,
    runner: Option<Arc<dyn Runner>>,
    worker: MapDataWorkerConfig,
    health_addr: Option<SocketAddr>,
}

impl MapDataRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the persistence layer (required).
    pub fn store(mut self, store: Arc<dyn Persistence>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the upstream downloader (required).
    pub fn downloader(mut self, downloader: Arc<dyn Downloader>) -> Self {
        self.downloader = Some(downloader);
        self
    }

    /// Set the router binary runner used to build caches (required).
    pub fn runner(mut self, runner: Arc<dyn Runner>) -> Self {
        self.runner = Some(runner);
        self
    }

    /// Take the worker settings and health address from the service
    /// configuration.
    pub fn config(mut self, config: &Config) -> Self {
        self.worker = MapDataWorkerConfig::from(config);
        self.health_addr = Some(config.health_addr);
        self
    }

    /// Set the worker configuration.
    pub fn worker_config(mut self, config: MapDataWorkerConfig) -> Self {
        self.worker = config;
        self
    }

    /// Serve the health endpoint on this address.
    pub fn health_addr(mut self, addr: SocketAddr) -> Self {
        self.health_addr = Some(addr);
        self
    }

    /// Build the runtime configuration.
    pub fn build(self) -> Result<MapDataRuntimeConfig> {
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store is required"))?;
        let downloader = self
            .downloader
            .ok_or_else(|| anyhow::anyhow!("downloader is required"))?;
        let runner = self
            .runner
            .ok_or_else(|| anyhow::anyhow!("runner is required"))?;

        Ok(MapDataRuntimeConfig {
            store,
            downloader,
            runner,
            worker: self.worker,
            health_addr: self.health_addr,
        })
    }
}

/// Configuration for a [`MapDataRuntime`].
pub struct MapDataRuntimeConfig {
    store: Arc<dyn Persistence>,
    downloader: Arc<dyn Downloader>,
    runner: Arc<dyn Runner>,
    worker: MapDataWorkerConfig,
    health_addr: Option<SocketAddr>,
}

impl MapDataRuntimeConfig {
    /// Start the map-data worker and health endpoint.
    pub async fn start(self) -> Result<MapDataRuntime> {
        let regions = self.worker.regions.len();
        let worker = MapDataWorker::new(
            self.store.clone(),
            self.downloader,
            self.runner,
            self.worker,
        )?;
        let worker_shutdown = worker.shutdown_handle();
        let worker_handle = tokio::spawn(worker.run());

        let (health_shutdown_tx, health_shutdown_rx) = watch::channel(false);
        let health_handle = self.health_addr.map(|addr| {
            let router = health::create_map_data_router(self.store.clone());
            tokio::spawn(health::serve(addr, router, health_shutdown_rx))
        });

        info!(regions, health_addr = ?self.health_addr, "MapDataRuntime started");

        Ok(MapDataRuntime {
            worker_handle,
            worker_shutdown,
            health_handle,
            health_shutdown_tx,
        })
    }
}

/// A running map-data service.
pub struct MapDataRuntime {
    worker_handle: JoinHandle<crate::error::Result<()>>,
    worker_shutdown: Arc<Notify>,
    health_handle: Option<JoinHandle<crate::error::Result<()>>>,
    health_shutdown_tx: watch::Sender<bool>,
}

impl MapDataRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> MapDataRuntimeBuilder {
        MapDataRuntimeBuilder::new()
    }

    /// Gracefully shut down the runtime.
    ///
    /// A map-data run in progress finishes before the worker stops.
    pub async fn shutdown(self) -> Result<()> {
        info!("MapDataRuntime shutting down...");

        self.worker_shutdown.notify_one();
        let _ = self.health_shutdown_tx.send(true);

        let worker_result = match self.worker_handle.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                error!("Map-data worker error during shutdown: {}", e);
                Err(e.into())
            }
            Err(e) => {
                error!("Map-data worker task panicked: {}", e);
                Err(anyhow::anyhow!("map-data worker task panicked: {}", e))
            }
        };

        if let Some(handle) = self.health_handle {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Health endpoint error during shutdown: {}", e),
                Err(e) => error!("Health endpoint task panicked: {}", e),
            }
        }

        if worker_result.is_ok() {
            info!("MapDataRuntime shutdown complete");
        }
        worker_result
    }

    /// Check if the runtime is still running.
    pub fn is_running(&self) -> bool {
        let health_running = self
            .health_handle
            .as_ref()
            .is_none_or(|h| !h.is_finished());
        !self.worker_handle.is_finished() && health_running
    }
}

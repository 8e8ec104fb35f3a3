// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for ridi-orchestrator.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Orchestrator configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the external router binary
    pub router_bin: PathBuf,
    /// Version string of the router binary; caches are keyed by it
    pub router_version: String,
    /// Regions to keep map data for, e.g. `europe/latvia`
    pub regions: Vec<String>,
    /// Root directory for extracts, boundaries and caches
    pub data_dir: PathBuf,
    /// Database URL (`postgres://` or `sqlite:`)
    pub database_url: String,
    /// Memory budget shared by all router servers
    pub router_memory_ceiling_mb: u64,
    /// Health endpoint address
    pub health_addr: SocketAddr,
    /// Upstream extract base URL
    pub osm_data_base_url: String,
    /// How long a freshly created record suppresses re-downloads
    pub download_cooldown: Duration,
    /// Period between map-data runs
    pub map_data_run_interval: Duration,
    /// Upper bound on router server readiness
    pub router_startup_timeout: Duration,
    /// Fleet control tick
    pub router_tick_interval: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let router_bin = PathBuf::from(required("RIDI_ROUTER_BIN")?);
        let router_version = required("RIDI_ROUTER_VERSION")?;

        let region_list = required("REGION_LIST")?;
        let regions: Vec<String> =
            serde_json::from_str(&region_list).map_err(|_| ConfigError::InvalidValue {
                var: "REGION_LIST",
                value: region_list.clone(),
            })?;

        let database_url = required("DATABASE_URL")?;

        let data_dir =
            PathBuf::from(std::env::var("RIDI_DATA_DIR").unwrap_or_else(|_| ".data".to_string()));

        let router_memory_ceiling_mb = parsed("ROUTER_MEMORY_CEILING_MB", 4096u64)?;
        let port = parsed("PORT", 8080u16)?;
        let health_addr = SocketAddr::from(([0, 0, 0, 0], port));

        let osm_data_base_url = std::env::var("OSM_DATA_BASE_URL")
            .unwrap_or_else(|_| "https://download.geofabrik.de".to_string())
            .trim_end_matches('/')
            .to_string();

        let cooldown_hours = parsed("MAP_DATA_DOWNLOAD_COOLDOWN_HOURS", 168u64)?;
        let download_cooldown = cooldown_hours
            .checked_mul(3600)
            .map(Duration::from_secs)
            .ok_or_else(|| ConfigError::InvalidValue {
                var: "MAP_DATA_DOWNLOAD_COOLDOWN_HOURS",
                value: cooldown_hours.to_string(),
            })?;
        let run_interval_secs = parsed("MAP_DATA_RUN_INTERVAL_SECS", 86_400u64)?;
        let startup_timeout_secs = parsed("ROUTER_STARTUP_TIMEOUT_SECS", 600u64)?;
        let tick_interval_ms = parsed("ROUTER_TICK_INTERVAL_MS", 500u64)?;

        Ok(Self {
            router_bin,
            router_version,
            regions,
            data_dir,
            database_url,
            router_memory_ceiling_mb,
            health_addr,
            osm_data_base_url,
            download_cooldown,
            map_data_run_interval: Duration::from_secs(run_interval_secs),
            router_startup_timeout: Duration::from_secs(startup_timeout_secs),
            router_tick_interval: Duration::from_millis(tick_interval_ms),
        })
    }
}

fn required(var: &'static str) -> Result<String, ConfigError> {
    std::env::var(var).map_err(|_| ConfigError::MissingEnvVar(var))
}

fn parsed<T: FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(var) {
        Ok(value) => value
            .parse()
            .map_err(|_| ConfigError::InvalidValue { var, value }),
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// A variable is set but cannot be parsed.
    #[error("Invalid value for {var}: '{value}'")]
    InvalidValue {
        /// Variable name.
        var: &'static str,
        /// Raw value.
        value: String,
    },
}

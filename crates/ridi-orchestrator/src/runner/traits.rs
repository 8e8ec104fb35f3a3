// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runner trait definitions.
//!
//! The router binary has three entry points: `prep-cache` builds a routing
//! cache from a raw extract, `start-server` loads a cache and serves requests
//! on a local socket, and `start-client` sends one request to such a server.

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Token printed on stdout (among `;`-separated tokens) once a server accepts
/// requests.
pub const SERVER_READY_TOKEN: &str = "RIDI_ROUTER SERVER READY";

/// Errors from runner operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RunnerError {
    /// Process could not be spawned.
    #[error("Process start failed: {0}")]
    StartFailed(String),

    /// Process exited with non-zero code.
    #[error("Exit code {exit_code}: {stderr}")]
    ExitCode {
        /// Exit code from the process.
        exit_code: i32,
        /// Standard output.
        stdout: String,
        /// Standard error output.
        stderr: String,
    },

    /// Server did not report readiness in time.
    #[error("Server not ready after {0:?}")]
    ReadinessTimeout(Duration),

    /// Server closed stdout before reporting readiness.
    #[error("Server exited before becoming ready")]
    ReadinessEof,

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for runner operations.
pub type Result<T> = std::result::Result<T, RunnerError>;

/// Captured output of a finished process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOutput {
    /// Exit code, `-1` when terminated by a signal.
    pub exit_code: i32,
    /// Standard output.
    pub stdout: String,
    /// Standard error output.
    pub stderr: String,
}

impl RunOutput {
    /// Whether the process exited with code zero.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Turn a non-zero exit into [`RunnerError::ExitCode`].
    pub fn into_result(self) -> Result<RunOutput> {
        if self.success() {
            Ok(self)
        } else {
            Err(RunnerError::ExitCode {
                exit_code: self.exit_code,
                stdout: self.stdout,
                stderr: self.stderr,
            })
        }
    }
}

/// Options for starting a router server.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Raw extract.
    pub pbf: PathBuf,
    /// Routing cache directory.
    pub cache_dir: PathBuf,
    /// Local socket the server listens on; clients connect by this name.
    pub socket_name: String,
    /// Upper bound on the readiness wait.
    pub startup_timeout: Duration,
}

/// Geometry of a client request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClientTrip {
    /// Point to point.
    StartFinish {
        /// `(lat, lon)` of the start.
        start: (f64, f64),
        /// `(lat, lon)` of the finish.
        finish: (f64, f64),
    },
    /// Loop returning to the start.
    RoundTrip {
        /// `(lat, lon)` of the start and finish.
        start: (f64, f64),
        /// Initial bearing in degrees.
        bearing: f64,
        /// Requested length in meters.
        distance: f64,
    },
}

/// One routing request sent through `start-client`.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientRequest {
    /// Socket of the region's server.
    pub socket_name: String,
    /// Correlates the response with the plan.
    pub route_req_id: String,
    /// Request geometry.
    pub trip: ClientTrip,
}

impl ClientRequest {
    /// Command line arguments after the binary name.
    pub fn args(&self) -> Vec<String> {
        let latlon = |(lat, lon): (f64, f64)| format!("{},{}", lat, lon);
        let mut args = vec![
            "start-client".to_string(),
            "--socket-name".to_string(),
            self.socket_name.clone(),
            "--route-req-id".to_string(),
            self.route_req_id.clone(),
        ];
        match self.trip {
            ClientTrip::StartFinish { start, finish } => args.extend([
                "start-finish".to_string(),
                "--start".to_string(),
                latlon(start),
                "--finish".to_string(),
                latlon(finish),
            ]),
            ClientTrip::RoundTrip {
                start,
                bearing,
                distance,
            } => args.extend([
                "round-trip".to_string(),
                "--start-finish".to_string(),
                latlon(start),
                "--bearing".to_string(),
                bearing.to_string(),
                "--distance".to_string(),
                distance.to_string(),
            ]),
        }
        args
    }
}

/// A running router server.
#[async_trait]
pub trait RouterServer: Send {
    /// OS process id, if the server is backed by a process.
    fn pid(&self) -> Option<u32>;

    /// Terminate the server and reap it.
    async fn kill(&mut self);

    /// Whether the server has exited on its own.
    async fn has_exited(&mut self) -> bool;
}

/// Trait for router binary runners.
///
/// Runners are pure execution engines; they do not touch the database.
#[async_trait]
pub trait Runner: Send + Sync {
    /// Build a routing cache. A non-zero exit is returned as data.
    async fn prep_cache(&self, pbf: &std::path::Path, cache_dir: &std::path::Path)
    -> Result<RunOutput>;

    /// Start a server and wait until it reports readiness.
    ///
    /// On timeout or early exit the child is killed before returning.
    async fn start_server(&self, options: &ServerOptions) -> Result<Box<dyn RouterServer>>;

    /// Run one client request, feeding `stdin_json` (the routing rules) on
    /// standard input. A non-zero exit is returned as data.
    async fn run_client(&self, request: &ClientRequest, stdin_json: &str) -> Result<RunOutput>;
}

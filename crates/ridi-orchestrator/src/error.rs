// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for ridi-orchestrator.

use thiserror::Error;

/// Orchestrator errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Persistence operation failed.
    #[error("Core error: {0}")]
    Core(#[from] ridi_core::CoreError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Router subprocess failed.
    #[error("Runner error: {0}")]
    Runner(#[from] crate::runner::RunnerError),

    /// Upstream download failed.
    #[error("Download error: {0}")]
    Download(String),

    /// Boundary file could not be turned into a polygon.
    #[error("Boundary error: {0}")]
    Boundary(String),

    /// Router client printed something we cannot decode.
    #[error("Protocol error: {0}")]
    Protocol(#[from] crate::dispatcher::ProtocolError),

    /// Persisted state contradicts what the router needs to serve.
    #[error("Invariant violated: {0}")]
    Invariant(String),

    /// Plan was not found.
    #[error("Plan not found: {0}")]
    PlanNotFound(String),

    /// Plan fields are missing or not numeric.
    #[error("Invalid plan: {0}")]
    PlanValidation(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Download(err.to_string())
    }
}

/// Result type using orchestrator Error.
pub type Result<T> = std::result::Result<T, Error>;

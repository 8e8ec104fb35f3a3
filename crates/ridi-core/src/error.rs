// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for ridi-core.

use thiserror::Error;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors raised by the persistence layer.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CoreError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Applying embedded migrations failed.
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// A row that was expected to exist is missing.
    #[error("{entity} '{id}' not found")]
    NotFound {
        /// Kind of row (map_data, plan, ...).
        entity: &'static str,
        /// Key that was looked up.
        id: String,
    },

    /// A stored value cannot be mapped onto its enum.
    #[error("invalid value '{value}' for {field}")]
    InvalidValue {
        /// Column or field name.
        field: &'static str,
        /// Offending value.
        value: String,
    },

    /// JSON column could not be encoded or decoded.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Unsupported database URL scheme.
    #[error("unsupported database url: {0}")]
    UnsupportedUrl(String),
}

impl CoreError {
    pub(crate) fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        CoreError::NotFound {
            entity,
            id: id.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_display() {
        let err = CoreError::not_found("plan", "p-1");
        assert_eq!(err.to_string(), "plan 'p-1' not found");
    }

    #[test]
    fn test_invalid_value_display() {
        let err = CoreError::InvalidValue {
            field: "status",
            value: "bogus".to_string(),
        };
        assert_eq!(err.to_string(), "invalid value 'bogus' for status");
    }
}

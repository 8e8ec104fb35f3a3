// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Ridi Core - persisted lifecycle store
//!
//! The single source of truth shared by the map-data orchestrator and the
//! router fleet:
//!
//! | Table | Contents |
//! |-------|----------|
//! | `map_data` | one row per region artifact generation (`current`/`next`/`previous`/`discarded`) |
//! | `services` | heartbeat and observed router version per subsystem |
//! | `regions` | boundary polygon per (region, checksum) |
//! | `plans`, `routes`, `route_breakdown_stats` | routing requests and results |
//! | `rule_set_road_tags` | per rule set road tag avoid/priority rules |
//! | `plan_queue` | visibility-timeout queue of plan notifications |
//!
//! Two backends implement [`persistence::Persistence`]: PostgreSQL for
//! deployments and SQLite for embedded use and tests. [`connect`] picks one
//! from the URL scheme.

#![deny(missing_docs)]

/// Error types.
pub mod error;
/// Embedded migrations.
pub mod migrations;
/// Row types and text enums.
pub mod models;
/// The `Persistence` trait and its backends.
pub mod persistence;

use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use tracing::info;

pub use error::{CoreError, Result};
pub use persistence::{Persistence, PostgresPersistence, SqlitePersistence};

/// Connect to `postgres://` or `sqlite:` URLs and run migrations.
pub async fn connect(database_url: &str) -> Result<Arc<dyn Persistence>> {
    if database_url.starts_with("postgres://") || database_url.starts_with("postgresql://") {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        migrations::run_postgres(&pool).await?;
        info!("Connected to PostgreSQL, migrations applied");
        Ok(Arc::new(PostgresPersistence::new(pool)))
    } else if database_url.starts_with("sqlite:") {
        let store = SqlitePersistence::connect(database_url).await?;
        info!("Connected to SQLite, migrations applied");
        Ok(Arc::new(store))
    } else {
        Err(CoreError::UnsupportedUrl(database_url.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_rejects_unknown_scheme() {
        let err = connect("mysql://localhost/db").await.err().unwrap();
        assert!(matches!(err, CoreError::UnsupportedUrl(_)));
    }

    #[tokio::test]
    async fn test_connect_sqlite_memory() {
        let store = connect("sqlite::memory:").await.unwrap();
        assert!(store.health_check_db().await.unwrap());
    }
}

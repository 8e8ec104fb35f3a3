// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Ridi Orchestrator - map-data lifecycle and router process fleet
//!
//! Two services share one [`ridi_core::Persistence`] store:
//!
//! ```text
//! ┌──────────────────────────────┐        ┌──────────────────────────────┐
//! │    ridi-map-data-handler     │        │     ridi-router-handler      │
//! │  ┌────────────┐ ┌─────────┐  │        │  ┌───────────┐ ┌──────────┐  │
//! │  │  Region    │ │ Cache   │  │        │  │   Plan    │ │  Plan    │  │
//! │  │ downloader │ │generator│  │        │  │ listener  │ │dispatcher│  │
//! │  └────────────┘ └─────────┘  │        │  └───────────┘ └──────────┘  │
//! │  ┌────────────┐ ┌─────────┐  │        │  ┌───────────┐ ┌──────────┐  │
//! │  │  Cleaner   │ │ Status  │  │        │  │  Router   │ │Reconcile │  │
//! │  └────────────┘ └─────────┘  │        │  │   fleet   │ │          │  │
//! └──────────────────────────────┘        │  └───────────┘ └──────────┘  │
//!                │                        └──────────────────────────────┘
//!                │ next generation                       │ current generation
//!                ▼                                       ▼
//! ┌───────────────────────────────────────────────────────────────────────┐
//! │                    PostgreSQL / SQLite (ridi-core)                     │
//! │         map_data, regions, services, plans, routes, plan_queue         │
//! └───────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The map-data side downloads region extracts, builds routing caches with
//! the external router binary and records a `next` generation. The router
//! side promotes a complete `next` generation at startup, then runs one
//! router server per region within a memory ceiling and answers plans.
//!
//! # Configuration
//!
//! Both binaries read [`config::Config`] from the environment (a `.env` file
//! is loaded when present).
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `RIDI_ROUTER_BIN` | required | Router binary path |
//! | `RIDI_ROUTER_VERSION` | required | Router binary version |
//! | `REGION_LIST` | required | JSON array of region keys |
//! | `DATABASE_URL` | required | `postgres://` or `sqlite:` URL |
//! | `RIDI_DATA_DIR` | `.data` | Artifact root |
//! | `ROUTER_MEMORY_CEILING_MB` | `4096` | Fleet memory ceiling |
//! | `PORT` | `8080` | Health endpoint port |

pub mod boundary;
pub mod cache_generator;
pub mod cleaner;
pub mod config;
pub mod dispatcher;
pub mod downloader;
pub mod error;
pub mod fleet;
pub mod health;
pub mod locations;
pub mod map_data_worker;
pub mod plan_listener;
pub mod reconcile;
pub mod region_downloader;
pub mod region_list_processor;
pub mod rules;
pub mod runner;
pub mod runtime;
pub mod selection;
pub mod status;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use error::{Error, Result};

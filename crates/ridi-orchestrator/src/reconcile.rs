// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Startup reconciliation of the router service.
//!
//! Runs once before the fleet is built. Promotes a complete `next`
//! generation and then refuses to start unless every configured region has
//! a servable `current` generation built for the running router version.

use ridi_core::Persistence;
use ridi_core::models::{MapDataStatus, MapDataVersion, service_names};
use ridi_core::persistence::PromotionSummary;
use tracing::{error, info, warn};

use crate::error::{Error, Result};

/// What reconciliation changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Router version recorded before this start, if it differed.
    pub previous_router_version: Option<String>,
    /// Set when a `next` generation was promoted.
    pub promotion: Option<PromotionSummary>,
}

/// Reconcile persisted map data with the running router version.
pub async fn reconcile(
    store: &dyn Persistence,
    regions: &[String],
    router_version: &str,
) -> Result<ReconcileReport> {
    let mut report = ReconcileReport::default();

    let recorded = store.service_get(service_names::ROUTER).await?;
    let recorded_version = recorded.and_then(|s| s.router_version);
    if recorded_version.as_deref() != Some(router_version) {
        store
            .service_upsert(service_names::ROUTER, router_version)
            .await?;
        info!(
            old = ?recorded_version,
            new = %router_version,
            "New router version"
        );
        report.previous_router_version = recorded_version;
    }

    let next = store.map_data_list_by_version(MapDataVersion::Next).await?;
    let all_ready = !regions.is_empty()
        && regions.iter().all(|region| {
            next.iter()
                .any(|r| &r.region == region && r.status == MapDataStatus::Ready)
        });

    if all_ready {
        info!(regions = ?next.iter().map(|r| r.region.as_str()).collect::<Vec<_>>(), "Next records found");

        // Promotion moves every `next` row, so rows of regions no longer
        // configured are discarded first.
        for record in next.iter().filter(|r| !regions.contains(&r.region)) {
            warn!(id = %record.id, region = %record.region, "Discarding next map data of unconfigured region");
            store.map_data_set_discarded(&record.id).await?;
            store
                .region_set_discarded(&record.region, &record.pbf_md5)
                .await?;
        }

        let stale: Vec<_> = next
            .iter()
            .filter(|r| regions.contains(&r.region) && r.router_version != router_version)
            .map(|r| format!("{} ({})", r.region, r.router_version))
            .collect();
        if !stale.is_empty() {
            error!(router_version = %router_version, stale = ?stale, "Some 'next' map data records do not have the correct router version");
            return Err(Error::Invariant(format!(
                "next map data built for another router version than {}: {}",
                router_version,
                stale.join(", ")
            )));
        }

        let summary = store.promote_next().await?;
        info!(
            demoted = summary.demoted,
            promoted = summary.promoted,
            regions_promoted = summary.regions_promoted,
            "Next generation promoted"
        );
        report.promotion = Some(summary);
    } else {
        let ready: Vec<&str> = next
            .iter()
            .filter(|r| r.status == MapDataStatus::Ready && r.router_version == router_version)
            .map(|r| r.region.as_str())
            .collect();
        if !ready.is_empty() {
            let current = store.map_data_list_by_version(MapDataVersion::Current).await?;
            let version_changed = current.iter().any(|r| r.router_version != router_version);
            if version_changed {
                error!(
                    router_version = %router_version,
                    ready = ?ready,
                    configured = regions.len(),
                    "Next generation incomplete for new router version"
                );
                return Err(Error::Invariant(format!(
                    "partial promotion refused: next map data for router {} is ready for {} of {} regions",
                    router_version,
                    ready.len(),
                    regions.len()
                )));
            }
            warn!(ready = ?ready, "Not all next records are ready, promotion skipped");
        }
    }

    let current = store.map_data_list_by_version(MapDataVersion::Current).await?;
    let boundaries = store.region_list_current().await?;

    let missing: Vec<&str> = regions
        .iter()
        .filter(|region| {
            let record = current.iter().find(|r| &r.region == *region);
            !matches!(record, Some(r) if r.status == MapDataStatus::Ready
                && boundaries.iter().any(|b| b.region == r.region && b.pbf_md5 == r.pbf_md5))
        })
        .map(String::as_str)
        .collect();
    if !missing.is_empty() {
        error!(regions = ?missing, "Map data or region records not found, critical failure");
        return Err(Error::Invariant(format!(
            "no ready current map data with boundary for: {}",
            missing.join(", ")
        )));
    }

    let stale: Vec<String> = current
        .iter()
        .filter(|r| regions.contains(&r.region) && r.router_version != router_version)
        .map(|r| format!("{} ({})", r.region, r.router_version))
        .collect();
    if !stale.is_empty() {
        error!(router_version = %router_version, stale = ?stale, "Some 'current' map data records do not have the correct router version");
        return Err(Error::Invariant(format!(
            "current map data built for another router version than {}: {}",
            router_version,
            stale.join(", ")
        )));
    }

    info!(regions = regions.len(), "Current records found");
    Ok(report)
}

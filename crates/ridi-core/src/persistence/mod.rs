//! Persistence interfaces and backends for ridi-core.
//!
//! Every orchestration decision is derived from querying and mutating this
//! store. All mutations are single-row updates keyed by id or region, with
//! the exception of [`Persistence::promote_next`], which moves a whole
//! generation in one transaction.

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PostgresPersistence;
pub use self::sqlite::SqlitePersistence;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{
    MapDataRecord, MapDataStatus, MapDataVersion, NewMapData, NewPlan, NewRegionBoundary,
    NewRoute, PlanQueueMessage, PlanRecord, PlanState, RegionRecord, RouteBreakdownStat,
    RouteRecord, RuleSetRoadTag, ServiceRecord, ServiceStatus,
};

/// Artifact path column of a map-data record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    /// Routing cache directory.
    Cache,
    /// Raw extract.
    Pbf,
    /// Boundary file.
    Kml,
}

impl ArtifactKind {
    pub(crate) fn column(&self) -> &'static str {
        match self {
            ArtifactKind::Cache => "cache_location",
            ArtifactKind::Pbf => "pbf_location",
            ArtifactKind::Kml => "kml_location",
        }
    }
}

/// Number of rows moved by a promotion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PromotionSummary {
    /// `current` map-data rows demoted to `previous`.
    pub demoted: u64,
    /// `next` map-data rows promoted to `current`.
    pub promoted: u64,
    /// Boundary rows promoted to `current`.
    pub regions_promoted: u64,
}

/// Transactional store for map data, services, boundaries, plans and the
/// plan queue.
#[async_trait]
pub trait Persistence: Send + Sync {
    // ------------------------------------------------------------------
    // Map data
    // ------------------------------------------------------------------

    /// Fetch a record by id.
    async fn map_data_get(&self, id: &str) -> Result<Option<MapDataRecord>>;

    /// The region's `next` record.
    async fn map_data_get_next(&self, region: &str) -> Result<Option<MapDataRecord>>;

    /// The region's `current` record.
    async fn map_data_get_current(&self, region: &str) -> Result<Option<MapDataRecord>>;

    /// All records in a version slot, ordered by region.
    async fn map_data_list_by_version(&self, version: MapDataVersion)
    -> Result<Vec<MapDataRecord>>;

    /// Cleanup candidates.
    async fn map_data_list_discarded_and_previous(&self) -> Result<Vec<MapDataRecord>>;

    /// Insert a `next` record in status `new`.
    async fn map_data_create_next(&self, new: &NewMapData) -> Result<MapDataRecord>;

    /// Move a record to the `discarded` slot.
    async fn map_data_set_discarded(&self, id: &str) -> Result<()>;

    /// Set the status; also refreshes `updated_at`.
    async fn map_data_set_status(&self, id: &str, status: MapDataStatus) -> Result<()>;

    /// Set status `error` with a message.
    async fn map_data_set_failed(&self, id: &str, error: &str) -> Result<()>;

    /// Record an error message without touching the status.
    async fn map_data_set_error_message(&self, id: &str, error: &str) -> Result<()>;

    /// Expected raw extract size.
    async fn map_data_set_pbf_size(&self, id: &str, size: i64) -> Result<()>;

    /// Download progress.
    async fn map_data_set_pbf_downloaded_size(&self, id: &str, size: i64) -> Result<()>;

    /// Cache size (bytes) and router cold-start latency (seconds).
    async fn map_data_set_build_metrics(
        &self,
        id: &str,
        cache_size: i64,
        startup_time_s: i64,
    ) -> Result<()>;

    /// Point a record at another router version and cache directory.
    async fn map_data_retarget(
        &self,
        id: &str,
        router_version: &str,
        cache_location: &str,
    ) -> Result<()>;

    /// Whether any record other than `except_id` references `path`.
    async fn map_data_is_path_in_use(
        &self,
        kind: ArtifactKind,
        path: &str,
        except_id: &str,
    ) -> Result<bool>;

    /// Delete a record.
    async fn map_data_delete(&self, id: &str) -> Result<()>;

    /// Demote every `current` record and boundary to `previous` and promote
    /// every `next` record, plus the boundary matching its checksum, to
    /// `current`. Runs in a single transaction.
    async fn promote_next(&self) -> Result<PromotionSummary>;

    // ------------------------------------------------------------------
    // Services
    // ------------------------------------------------------------------

    /// Fetch a service record.
    async fn service_get(&self, name: &str) -> Result<Option<ServiceRecord>>;

    /// Create the record or update its router version.
    async fn service_upsert(&self, name: &str, router_version: &str) -> Result<()>;

    /// Update status and heartbeat.
    async fn service_set_status(&self, name: &str, status: ServiceStatus) -> Result<()>;

    /// Refresh the heartbeat only.
    async fn service_touch(&self, name: &str) -> Result<()>;

    // ------------------------------------------------------------------
    // Region boundaries
    // ------------------------------------------------------------------

    /// Insert a boundary as `next`, or refresh the polygon of an existing
    /// (region, checksum) row. A `current` row keeps its slot.
    async fn region_upsert(&self, boundary: &NewRegionBoundary) -> Result<()>;

    /// Fetch a boundary by (region, checksum).
    async fn region_get(&self, region: &str, pbf_md5: &str) -> Result<Option<RegionRecord>>;

    /// Discard a non-current boundary.
    async fn region_set_discarded(&self, region: &str, pbf_md5: &str) -> Result<()>;

    /// All `current` boundaries.
    async fn region_list_current(&self) -> Result<Vec<RegionRecord>>;

    /// Number of `current` boundaries.
    async fn region_count_current(&self) -> Result<i64>;

    /// `current` boundaries whose bounding box contains the point.
    async fn region_candidates_at(&self, lat: f64, lon: f64) -> Result<Vec<RegionRecord>>;

    /// Remove `discarded`/`previous` boundaries of a generation.
    async fn region_delete_discarded_and_previous(&self, region: &str, pbf_md5: &str)
    -> Result<()>;

    // ------------------------------------------------------------------
    // Plans and routes
    // ------------------------------------------------------------------

    /// Insert a plan in state `new`.
    async fn plan_insert(&self, plan: &NewPlan) -> Result<PlanRecord>;

    /// Fetch a plan.
    async fn plan_get(&self, id: &str) -> Result<Option<PlanRecord>>;

    /// Update plan state.
    async fn plan_set_state(&self, id: &str, state: PlanState) -> Result<()>;

    /// Persist the resolved region.
    async fn plan_set_region(&self, id: &str, region: &str) -> Result<()>;

    /// Insert a route, returning its id.
    async fn route_insert(&self, route: &NewRoute) -> Result<String>;

    /// Insert one breakdown row.
    async fn route_breakdown_insert(&self, stat: &RouteBreakdownStat) -> Result<()>;

    /// Routes of a plan in insertion order.
    async fn routes_for_plan(&self, plan_id: &str) -> Result<Vec<RouteRecord>>;

    /// Breakdown rows of a route.
    async fn route_breakdown_for_route(&self, route_id: &str) -> Result<Vec<RouteBreakdownStat>>;

    /// Road tag rules of a rule set.
    async fn rule_set_road_tags(&self, rule_set_id: &str) -> Result<Vec<RuleSetRoadTag>>;

    /// Create or replace a road tag rule.
    async fn rule_set_road_tag_upsert(&self, tag: &RuleSetRoadTag) -> Result<()>;

    // ------------------------------------------------------------------
    // Plan queue
    // ------------------------------------------------------------------

    /// Enqueue a plan notification, returning the message id.
    async fn plan_queue_send(&self, plan_id: &str) -> Result<i64>;

    /// Lease up to `qty` visible messages for `visibility_secs`.
    async fn plan_queue_read(&self, visibility_secs: i64, qty: i64)
    -> Result<Vec<PlanQueueMessage>>;

    /// Hide a message for `visibility_secs` from now.
    async fn plan_queue_set_visibility(&self, msg_id: i64, visibility_secs: i64) -> Result<()>;

    /// Remove a message.
    async fn plan_queue_delete(&self, msg_id: i64) -> Result<()>;

    // ------------------------------------------------------------------
    // Health
    // ------------------------------------------------------------------

    /// Round-trip to the database.
    async fn health_check_db(&self) -> Result<bool>;
}

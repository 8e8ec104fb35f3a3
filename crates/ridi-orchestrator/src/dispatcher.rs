// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Plan dispatch.
//!
//! Resolves the region a plan belongs to, waits for the fleet to start that
//! region's server, runs the router client and stores the selected routes.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use ridi_core::Persistence;
use ridi_core::models::{
    MapDataRecord, NewRoute, PlanRecord, PlanState, RegionRecord, RouteBreakdownStat, StatType,
    TripType,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::boundary;
use crate::error::{Error, Result};
use crate::fleet::RouterFleet;
use crate::rules;
use crate::runner::{ClientRequest, ClientTrip, RunOutput, Runner};
use crate::selection;

/// Router client output that does not match the expected shape.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Nothing was printed.
    #[error("Router client printed no output")]
    Empty,

    /// Output is not a known result document.
    #[error("Malformed router output: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Latitude/longitude pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coord {
    /// Latitude.
    pub lat: f64,
    /// Longitude.
    pub lon: f64,
}

/// Length and share of one tag value along a route.
#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize)]
pub struct TagStat {
    /// Meters.
    pub len_m: f64,
    /// Share of the route length.
    pub percentage: f64,
}

/// Statistics the router computes for a route.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct RouteStats {
    /// Route length in meters.
    pub len_m: f64,
    /// Number of junctions.
    pub junction_count: i64,
    /// Breakdown by `highway` tag.
    #[serde(default)]
    pub highway: BTreeMap<String, TagStat>,
    /// Breakdown by `surface` tag.
    #[serde(default)]
    pub surface: BTreeMap<String, TagStat>,
    /// Breakdown by `smoothness` tag.
    #[serde(default)]
    pub smoothness: BTreeMap<String, TagStat>,
    /// Router score, higher is better.
    pub score: f64,
    /// Similarity cluster.
    #[serde(default)]
    pub cluster: Option<i64>,
    /// Coarse shape used for clustering.
    #[serde(default)]
    pub approximated_route: Vec<[f64; 2]>,
}

/// One candidate route.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RouterRoute {
    /// Geometry.
    pub coords: Vec<Coord>,
    /// Statistics.
    pub stats: RouteStats,
}

/// Result part of the client output.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub enum RouterResult {
    /// Candidates found.
    #[serde(rename = "ok")]
    Ok {
        /// Candidate routes.
        routes: Vec<RouterRoute>,
    },
    /// Routing failed.
    #[serde(rename = "err")]
    Err(String),
}

/// Document printed by `start-client` on stdout.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RouterOutput {
    /// Request id echoed back.
    pub id: String,
    /// Outcome.
    pub result: RouterResult,
}

impl RouterOutput {
    /// Decode client stdout.
    pub fn decode(stdout: &str) -> std::result::Result<Self, ProtocolError> {
        let stdout = stdout.trim();
        if stdout.is_empty() {
            return Err(ProtocolError::Empty);
        }
        Ok(serde_json::from_str(stdout)?)
    }
}

/// What the queue should do with the notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Routes stored.
    Done,
    /// Plan marked `error`; retrying will not help.
    Failed,
    /// Region is not serving yet; redeliver after the delay.
    RetryAfter(Duration),
}

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Redelivery delay while the region's server is not running.
    pub retry_after: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            retry_after: Duration::from_secs(10),
        }
    }
}

/// Validated plan geometry.
#[derive(Debug, Clone, Copy, PartialEq)]
struct PlanGeometry {
    trip: ClientTrip,
    distance: Option<f64>,
}

impl PlanGeometry {
    fn start(&self) -> (f64, f64) {
        match self.trip {
            ClientTrip::StartFinish { start, .. } | ClientTrip::RoundTrip { start, .. } => start,
        }
    }

    fn finish(&self) -> Option<(f64, f64)> {
        match self.trip {
            ClientTrip::StartFinish { finish, .. } => Some(finish),
            ClientTrip::RoundTrip { .. } => None,
        }
    }
}

fn number(field: &str, value: Option<&str>) -> Result<f64> {
    let value = value.ok_or_else(|| Error::PlanValidation(format!("{} is missing", field)))?;
    match value.trim().parse::<f64>() {
        Ok(n) if n.is_finite() => Ok(n),
        _ => Err(Error::PlanValidation(format!(
            "{} is not a number: '{}'",
            field, value
        ))),
    }
}

fn validate(plan: &PlanRecord) -> Result<PlanGeometry> {
    let start = (
        number("start_lat", Some(&plan.start_lat))?,
        number("start_lon", Some(&plan.start_lon))?,
    );
    match plan.trip_type {
        TripType::StartFinish => {
            let finish = (
                number("finish_lat", plan.finish_lat.as_deref())?,
                number("finish_lon", plan.finish_lon.as_deref())?,
            );
            Ok(PlanGeometry {
                trip: ClientTrip::StartFinish { start, finish },
                distance: plan
                    .distance
                    .as_deref()
                    .and_then(|d| d.trim().parse::<f64>().ok())
                    .filter(|d| d.is_finite()),
            })
        }
        TripType::RoundTrip => {
            let bearing = number("bearing", plan.bearing.as_deref())?;
            let distance = number("distance", plan.distance.as_deref())?;
            Ok(PlanGeometry {
                trip: ClientTrip::RoundTrip {
                    start,
                    bearing,
                    distance,
                },
                distance: Some(distance),
            })
        }
    }
}

/// Turns plan notifications into stored routes.
pub struct PlanDispatcher {
    store: Arc<dyn Persistence>,
    fleet: Arc<RouterFleet>,
    runner: Arc<dyn Runner>,
    config: DispatcherConfig,
}

impl PlanDispatcher {
    /// Create a new dispatcher.
    pub fn new(
        store: Arc<dyn Persistence>,
        fleet: Arc<RouterFleet>,
        runner: Arc<dyn Runner>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            fleet,
            runner,
            config,
        }
    }

    /// Handle one plan notification.
    pub async fn handle_plan_notification(&self, plan_id: &str) -> Result<DispatchOutcome> {
        let plan = self
            .store
            .plan_get(plan_id)
            .await?
            .ok_or_else(|| Error::PlanNotFound(plan_id.to_string()))?;

        let geometry = match validate(&plan) {
            Ok(geometry) => geometry,
            Err(e) => {
                error!(plan_id = %plan_id, trip_type = %plan.trip_type, error = %e, "Plan validation failed");
                self.store.plan_set_state(plan_id, PlanState::Error).await?;
                return Err(e);
            }
        };

        let Some(record) = self.resolve_region(&geometry).await? else {
            error!(plan_id = %plan_id, start = ?geometry.start(), finish = ?geometry.finish(), "No current region covers the plan");
            self.store.plan_set_state(plan_id, PlanState::Error).await?;
            return Ok(DispatchOutcome::Failed);
        };
        let region = record.region.as_str();

        if !self.fleet.can_ever_start(region).await {
            error!(
                plan_id = %plan_id,
                region = %region,
                cache_size_bytes = record.cache_size_bytes(),
                "Region does not fit under the router memory ceiling"
            );
            self.store.plan_set_state(plan_id, PlanState::Error).await?;
            return Ok(DispatchOutcome::Failed);
        }

        self.store.plan_set_state(plan_id, PlanState::Planning).await?;
        self.store.plan_set_region(plan_id, region).await?;

        if !self.fleet.is_running(region).await {
            self.fleet.register_request(region, plan_id).await?;
            debug!(plan_id = %plan_id, region = %region, "Router not running, retry later");
            return Ok(DispatchOutcome::RetryAfter(self.config.retry_after));
        }

        self.fleet.start_request(region, plan_id).await?;
        let output = self.run_client(&plan, region, geometry.trip).await;
        self.fleet.finish_request(region, plan_id).await;
        let output = output?;

        for line in output.stderr.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<serde_json::Value>(line) {
                Ok(value) => debug!(plan_id = %plan_id, output = %value, "Router client output"),
                Err(_) => warn!(plan_id = %plan_id, raw = %line, "Router client unparsable output"),
            }
        }

        if !output.success() {
            error!(
                plan_id = %plan_id,
                region = %region,
                exit_code = output.exit_code,
                stdout = %output.stdout,
                "Router client failed"
            );
            self.fleet.force_stop(region).await;
            self.store.plan_set_state(plan_id, PlanState::Error).await?;
            return Ok(DispatchOutcome::Failed);
        }

        let decoded = match RouterOutput::decode(&output.stdout) {
            Ok(decoded) => decoded,
            Err(e) => {
                error!(plan_id = %plan_id, region = %region, error = %e, "Unexpected router output");
                self.store.plan_set_state(plan_id, PlanState::Error).await?;
                return Err(e.into());
            }
        };

        let routes = match decoded.result {
            RouterResult::Ok { routes } => routes,
            RouterResult::Err(message) => {
                error!(plan_id = %plan_id, region = %region, error = %message, "Router returned an error");
                self.store.plan_set_state(plan_id, PlanState::Error).await?;
                return Ok(DispatchOutcome::Failed);
            }
        };

        let candidates = routes.len();
        let selected = selection::select_routes(routes, plan.trip_type, geometry.distance);
        self.store_routes(&plan, &selected).await?;
        self.store.plan_set_state(plan_id, PlanState::Done).await?;

        info!(
            plan_id = %plan_id,
            region = %region,
            candidates,
            stored = selected.len(),
            "Plan done"
        );
        Ok(DispatchOutcome::Done)
    }

    /// Drop whatever the fleet still holds for a plan that will not be
    /// dispatched again.
    pub async fn abandon(&self, plan_id: &str) {
        if self.fleet.cancel_request(plan_id).await {
            info!(plan_id = %plan_id, "Abandoned plan removed from router queue");
        }
    }

    /// Current map data of the smallest region containing both ends.
    async fn resolve_region(&self, geometry: &PlanGeometry) -> Result<Option<MapDataRecord>> {
        let (lat, lon) = geometry.start();
        let from = self.regions_containing(lat, lon).await?;
        let to = match geometry.finish() {
            Some((lat, lon)) => Some(self.regions_containing(lat, lon).await?),
            None => None,
        };

        let mut candidates = Vec::new();
        for region in from {
            if let Some(to) = &to
                && !to.iter().any(|r| r.id == region.id)
            {
                continue;
            }
            if let Some(record) = self.store.map_data_get_current(&region.region).await? {
                candidates.push(record);
            }
        }
        candidates.sort_by_key(|r| r.cache_size_bytes());
        debug!(
            candidates = ?candidates.iter().map(|r| r.region.as_str()).collect::<Vec<_>>(),
            "Regions covering plan"
        );
        Ok(candidates.into_iter().next())
    }

    async fn regions_containing(&self, lat: f64, lon: f64) -> Result<Vec<RegionRecord>> {
        let mut regions = Vec::new();
        for region in self.store.region_candidates_at(lat, lon).await? {
            if boundary::region_contains(&region, lat, lon)? {
                regions.push(region);
            }
        }
        Ok(regions)
    }

    async fn run_client(&self, plan: &PlanRecord, region: &str, trip: ClientTrip) -> Result<RunOutput> {
        let tags = match &plan.rule_set_id {
            Some(rule_set_id) => self.store.rule_set_road_tags(rule_set_id).await?,
            None => Vec::new(),
        };
        let rules = rules::rules_json(&tags)?;
        let request = ClientRequest {
            socket_name: region.to_string(),
            route_req_id: plan.id.clone(),
            trip,
        };
        debug!(plan_id = %plan.id, region = %region, rules = %rules, "Starting router client");
        Ok(self.runner.run_client(&request, &rules).await?)
    }

    async fn store_routes(&self, plan: &PlanRecord, routes: &[RouterRoute]) -> Result<()> {
        for (index, route) in routes.iter().enumerate() {
            let route_id = self
                .store
                .route_insert(&NewRoute {
                    plan_id: plan.id.clone(),
                    user_id: plan.user_id.clone(),
                    name: format!("Route {}", index + 1),
                    coords: serde_json::to_string(&route.coords)?,
                    stats_len_m: route.stats.len_m,
                    stats_junction_count: route.stats.junction_count,
                    stats_score: route.stats.score,
                })
                .await?;

            let breakdowns = [
                (StatType::Type, &route.stats.highway),
                (StatType::Surface, &route.stats.surface),
                (StatType::Smoothness, &route.stats.smoothness),
            ];
            for (stat_type, stats) in breakdowns {
                for (name, stat) in stats {
                    self.store
                        .route_breakdown_insert(&RouteBreakdownStat {
                            route_id: route_id.clone(),
                            user_id: plan.user_id.clone(),
                            stat_type,
                            stat_name: name.clone(),
                            len_m: stat.len_m,
                            percentage: stat.percentage,
                        })
                        .await?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::{FleetConfig, FleetRegion};
    use crate::runner::MockRunner;
    use crate::testing::{SeedRegion, memory_store, seed_current, square};
    use ridi_core::models::{MapDataVersion, NewPlan, RuleSetRoadTag};

    const ONE_ROUTE: &str = r#"{"id":"x","result":{"ok":{"routes":[{
        "coords":[{"lat":42.5,"lon":1.5},{"lat":42.51,"lon":1.52}],
        "stats":{"len_m":1500.5,"junction_count":3,"score":7.5,"cluster":1,
            "highway":{"primary":{"len_m":1000.0,"percentage":66.6},"track":{"len_m":500.5,"percentage":33.4}},
            "surface":{"asphalt":{"len_m":1500.5,"percentage":100.0}},
            "smoothness":{},
            "approximated_route":[[42.5,1.5]]}}]}}}"#;

    struct Fixture {
        store: Arc<dyn Persistence>,
        runner: Arc<MockRunner>,
        fleet: Arc<RouterFleet>,
        dispatcher: PlanDispatcher,
    }

    async fn fixture(regions: Vec<SeedRegion<'_>>) -> Fixture {
        fixture_with_ceiling(regions, FleetConfig::default().memory_ceiling_mb).await
    }

    async fn fixture_with_ceiling(regions: Vec<SeedRegion<'_>>, ceiling_mb: u64) -> Fixture {
        let store = memory_store().await;
        seed_current(store.as_ref(), regions).await;
        let runner = Arc::new(MockRunner::new());
        let records = store
            .map_data_list_by_version(MapDataVersion::Current)
            .await
            .unwrap();
        let fleet = Arc::new(RouterFleet::new(
            records.iter().map(FleetRegion::from),
            runner.clone(),
            FleetConfig {
                memory_ceiling_mb: ceiling_mb,
                ..Default::default()
            },
        ));
        let dispatcher = PlanDispatcher::new(
            store.clone(),
            fleet.clone(),
            runner.clone(),
            DispatcherConfig::default(),
        );
        Fixture {
            store,
            runner,
            fleet,
            dispatcher,
        }
    }

    fn andorra() -> SeedRegion<'static> {
        SeedRegion {
            region: "europe/andorra",
            ring: square(1.4, 42.4, 1.8, 42.7),
            cache_mb: 10,
        }
    }

    fn start_finish(start: (&str, &str), finish: (&str, &str)) -> NewPlan {
        NewPlan {
            user_id: "user-1".to_string(),
            trip_type: Some(TripType::StartFinish),
            start_lat: start.0.to_string(),
            start_lon: start.1.to_string(),
            finish_lat: Some(finish.0.to_string()),
            finish_lon: Some(finish.1.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_decode_ok_output() {
        let output = RouterOutput::decode(ONE_ROUTE).unwrap();
        let RouterResult::Ok { routes } = output.result else {
            panic!("expected ok result");
        };
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].stats.junction_count, 3);
        assert_eq!(routes[0].stats.highway["primary"].len_m, 1000.0);
    }

    #[test]
    fn test_decode_err_output() {
        let output = RouterOutput::decode(r#"{"id":"x","result":{"err":"no route"}}"#).unwrap();
        assert_eq!(output.result, RouterResult::Err("no route".to_string()));
    }

    #[test]
    fn test_decode_unknown_shape() {
        assert!(matches!(
            RouterOutput::decode(r#"{"id":"x","result":{"maybe":[]}}"#),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(RouterOutput::decode("  \n"), Err(ProtocolError::Empty)));
    }

    #[test]
    fn test_validate_round_trip_requires_bearing_and_distance() {
        let mut plan = PlanRecord {
            id: "p".to_string(),
            user_id: "u".to_string(),
            trip_type: TripType::RoundTrip,
            start_lat: "42.5".to_string(),
            start_lon: "1.5".to_string(),
            finish_lat: None,
            finish_lon: None,
            bearing: Some("90".to_string()),
            distance: None,
            rule_set_id: None,
            region: None,
            state: PlanState::New,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };
        assert!(matches!(validate(&plan), Err(Error::PlanValidation(_))));

        plan.distance = Some("100000".to_string());
        let geometry = validate(&plan).unwrap();
        assert_eq!(geometry.finish(), None);
        assert_eq!(geometry.distance, Some(100_000.0));

        plan.start_lat = "north".to_string();
        assert!(matches!(validate(&plan), Err(Error::PlanValidation(_))));
        plan.start_lat = "NaN".to_string();
        assert!(matches!(validate(&plan), Err(Error::PlanValidation(_))));
    }

    #[tokio::test]
    async fn test_missing_plan() {
        let fx = fixture(vec![andorra()]).await;
        let err = fx
            .dispatcher
            .handle_plan_notification("missing")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PlanNotFound(_)));
    }

    #[tokio::test]
    async fn test_invalid_plan_marked_error() {
        let fx = fixture(vec![andorra()]).await;
        let plan = fx
            .store
            .plan_insert(&start_finish(("42.5", "1.5"), ("x", "1.6")))
            .await
            .unwrap();

        let err = fx
            .dispatcher
            .handle_plan_notification(&plan.id)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::PlanValidation(_)));
        let plan = fx.store.plan_get(&plan.id).await.unwrap().unwrap();
        assert_eq!(plan.state, PlanState::Error);
    }

    #[tokio::test]
    async fn test_plan_outside_regions_fails() {
        let fx = fixture(vec![andorra()]).await;
        let plan = fx
            .store
            .plan_insert(&start_finish(("48.8", "2.3"), ("42.5", "1.5")))
            .await
            .unwrap();

        let outcome = fx.dispatcher.handle_plan_notification(&plan.id).await.unwrap();

        assert_eq!(outcome, DispatchOutcome::Failed);
        let plan = fx.store.plan_get(&plan.id).await.unwrap().unwrap();
        assert_eq!(plan.state, PlanState::Error);
        assert_eq!(fx.fleet.waiting_count("europe/andorra").await, 0);
    }

    #[tokio::test]
    async fn test_not_running_region_registers_and_retries() {
        let fx = fixture(vec![andorra()]).await;
        let plan = fx
            .store
            .plan_insert(&start_finish(("42.5", "1.5"), ("42.6", "1.6")))
            .await
            .unwrap();

        let outcome = fx.dispatcher.handle_plan_notification(&plan.id).await.unwrap();

        assert_eq!(outcome, DispatchOutcome::RetryAfter(Duration::from_secs(10)));
        assert_eq!(fx.fleet.waiting_count("europe/andorra").await, 1);
        let plan = fx.store.plan_get(&plan.id).await.unwrap().unwrap();
        assert_eq!(plan.state, PlanState::Planning);
        assert_eq!(plan.region.as_deref(), Some("europe/andorra"));
        assert!(fx.runner.client_calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_region_above_memory_ceiling_fails_plan() {
        // Starting needs 20 MiB.
        let fx = fixture_with_ceiling(vec![andorra()], 15).await;
        let plan = fx
            .store
            .plan_insert(&start_finish(("42.5", "1.5"), ("42.6", "1.6")))
            .await
            .unwrap();

        let outcome = fx.dispatcher.handle_plan_notification(&plan.id).await.unwrap();

        assert_eq!(outcome, DispatchOutcome::Failed);
        assert_eq!(fx.fleet.waiting_count("europe/andorra").await, 0);
        let plan = fx.store.plan_get(&plan.id).await.unwrap().unwrap();
        assert_eq!(plan.state, PlanState::Error);
        assert!(fx.runner.server_starts().await.is_empty());
    }

    #[tokio::test]
    async fn test_abandon_clears_waiting_request() {
        let fx = fixture(vec![andorra()]).await;
        let plan = fx
            .store
            .plan_insert(&start_finish(("42.5", "1.5"), ("42.6", "1.6")))
            .await
            .unwrap();
        fx.dispatcher.handle_plan_notification(&plan.id).await.unwrap();
        assert_eq!(fx.fleet.waiting_count("europe/andorra").await, 1);

        fx.dispatcher.abandon(&plan.id).await;

        assert_eq!(fx.fleet.waiting_count("europe/andorra").await, 0);
    }

    #[tokio::test]
    async fn test_running_region_stores_routes() {
        let fx = fixture(vec![andorra()]).await;
        fx.store
            .rule_set_road_tag_upsert(&RuleSetRoadTag {
                rule_set_id: "rs-1".to_string(),
                tag_key: "motorway".to_string(),
                value: None,
            })
            .await
            .unwrap();
        let plan = fx
            .store
            .plan_insert(&NewPlan {
                rule_set_id: Some("rs-1".to_string()),
                ..start_finish(("42.5", "1.5"), ("42.6", "1.6"))
            })
            .await
            .unwrap();
        fx.fleet.start_region("europe/andorra").await.unwrap();
        fx.runner
            .set_client_output(
                "europe/andorra",
                RunOutput {
                    exit_code: 0,
                    stdout: ONE_ROUTE.to_string(),
                    stderr: "{\"level\":\"info\"}\n".to_string(),
                },
            )
            .await;

        let outcome = fx.dispatcher.handle_plan_notification(&plan.id).await.unwrap();

        assert_eq!(outcome, DispatchOutcome::Done);
        let calls = fx.runner.client_calls().await;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].request.route_req_id, plan.id);
        assert_eq!(
            calls[0].request.trip,
            ClientTrip::StartFinish {
                start: (42.5, 1.5),
                finish: (42.6, 1.6)
            }
        );
        assert_eq!(calls[0].stdin, r#"{"highway":{"motorway":{"action":"avoid"}}}"#);

        let routes = fx.store.routes_for_plan(&plan.id).await.unwrap();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].name, "Route 1");
        assert_eq!(routes[0].stats_len_m, 1500.5);
        assert_eq!(routes[0].user_id, "user-1");

        let stats = fx
            .store
            .route_breakdown_for_route(&routes[0].id)
            .await
            .unwrap();
        assert_eq!(stats.len(), 3);
        assert_eq!(
            stats.iter().filter(|s| s.stat_type == StatType::Type).count(),
            2
        );

        let plan = fx.store.plan_get(&plan.id).await.unwrap().unwrap();
        assert_eq!(plan.state, PlanState::Done);
        assert_eq!(fx.fleet.waiting_count("europe/andorra").await, 0);
    }

    #[tokio::test]
    async fn test_smallest_covering_region_wins() {
        let fx = fixture(vec![
            SeedRegion {
                region: "a",
                ring: square(0.0, 0.0, 10.0, 10.0),
                cache_mb: 50,
            },
            SeedRegion {
                region: "b",
                ring: square(0.0, 0.0, 5.0, 5.0),
                cache_mb: 10,
            },
        ])
        .await;
        let plan = fx
            .store
            .plan_insert(&start_finish(("1", "1"), ("2", "2")))
            .await
            .unwrap();

        fx.dispatcher.handle_plan_notification(&plan.id).await.unwrap();

        let plan = fx.store.plan_get(&plan.id).await.unwrap().unwrap();
        assert_eq!(plan.region.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_finish_outside_smaller_region() {
        let fx = fixture(vec![
            SeedRegion {
                region: "a",
                ring: square(0.0, 0.0, 10.0, 10.0),
                cache_mb: 50,
            },
            SeedRegion {
                region: "b",
                ring: square(0.0, 0.0, 5.0, 5.0),
                cache_mb: 10,
            },
        ])
        .await;
        let plan = fx
            .store
            .plan_insert(&start_finish(("1", "1"), ("8", "8")))
            .await
            .unwrap();

        fx.dispatcher.handle_plan_notification(&plan.id).await.unwrap();

        let plan = fx.store.plan_get(&plan.id).await.unwrap().unwrap();
        assert_eq!(plan.region.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_client_failure_force_stops_region() {
        let fx = fixture(vec![andorra()]).await;
        let plan = fx
            .store
            .plan_insert(&start_finish(("42.5", "1.5"), ("42.6", "1.6")))
            .await
            .unwrap();
        fx.fleet.start_region("europe/andorra").await.unwrap();
        fx.runner
            .set_client_output(
                "europe/andorra",
                RunOutput {
                    exit_code: 2,
                    stdout: String::new(),
                    stderr: "socket closed".to_string(),
                },
            )
            .await;

        let outcome = fx.dispatcher.handle_plan_notification(&plan.id).await.unwrap();

        assert_eq!(outcome, DispatchOutcome::Failed);
        assert!(!fx.fleet.is_running("europe/andorra").await);
        assert_eq!(fx.fleet.waiting_count("europe/andorra").await, 0);
        assert_eq!(fx.runner.kills().await, vec!["europe/andorra".to_string()]);
        let plan = fx.store.plan_get(&plan.id).await.unwrap().unwrap();
        assert_eq!(plan.state, PlanState::Error);
    }

    #[tokio::test]
    async fn test_router_err_result_fails_plan() {
        let fx = fixture(vec![andorra()]).await;
        let plan = fx
            .store
            .plan_insert(&start_finish(("42.5", "1.5"), ("42.6", "1.6")))
            .await
            .unwrap();
        fx.fleet.start_region("europe/andorra").await.unwrap();
        fx.runner
            .set_client_output(
                "europe/andorra",
                RunOutput {
                    exit_code: 0,
                    stdout: r#"{"id":"x","result":{"err":"no route found"}}"#.to_string(),
                    stderr: String::new(),
                },
            )
            .await;

        let outcome = fx.dispatcher.handle_plan_notification(&plan.id).await.unwrap();

        assert_eq!(outcome, DispatchOutcome::Failed);
        assert!(fx.fleet.is_running("europe/andorra").await);
        assert!(fx.store.routes_for_plan(&plan.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_output_is_protocol_error() {
        let fx = fixture(vec![andorra()]).await;
        let plan = fx
            .store
            .plan_insert(&start_finish(("42.5", "1.5"), ("42.6", "1.6")))
            .await
            .unwrap();
        fx.fleet.start_region("europe/andorra").await.unwrap();
        fx.runner
            .set_client_output(
                "europe/andorra",
                RunOutput {
                    exit_code: 0,
                    stdout: "routes: none".to_string(),
                    stderr: String::new(),
                },
            )
            .await;

        let err = fx
            .dispatcher
            .handle_plan_notification(&plan.id)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Protocol(_)));
        let plan = fx.store.plan_get(&plan.id).await.unwrap().unwrap();
        assert_eq!(plan.state, PlanState::Error);
    }
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Row types and the text enums stored in their status/version columns.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;

/// Defines a text-backed enum with `as_str`, `FromStr`, `Display` and
/// `TryFrom<String>` (used by `#[sqlx(try_from = "String")]`).
macro_rules! text_enum {
    (
        $(#[$meta:meta])*
        $name:ident, $field:literal {
            $( $(#[$vmeta:meta])* $variant:ident => $text:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(
                $(#[$vmeta])*
                #[serde(rename = $text)]
                $variant,
            )+
        }

        impl $name {
            /// Column representation.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $( $name::$variant => $text, )+
                }
            }
        }

        impl FromStr for $name {
            type Err = CoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $( $text => Ok($name::$variant), )+
                    other => Err(CoreError::InvalidValue {
                        field: $field,
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl TryFrom<String> for $name {
            type Error = CoreError;

            fn try_from(value: String) -> Result<Self, <Self as TryFrom<String>>::Error> {
                value.parse()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

text_enum! {
    /// Version slot of a map-data artifact set (also used for boundary rows).
    MapDataVersion, "version" {
        /// Serving traffic.
        Current => "current",
        /// Being prepared; promoted at the next router startup.
        Next => "next",
        /// Demoted by a promotion, waiting for cleanup.
        Previous => "previous",
        /// Superseded before promotion, waiting for cleanup.
        Discarded => "discarded",
    }
}

text_enum! {
    /// Processing status of a map-data record.
    MapDataStatus, "status" {
        /// Created, nothing downloaded yet.
        New => "new",
        /// Raw extract and boundary are on disk.
        Downloaded => "downloaded",
        /// Cache build in progress.
        Processing => "processing",
        /// Cache built and measured.
        Ready => "ready",
        /// Download or build failed.
        Error => "error",
    }
}

text_enum! {
    /// Status of a named service record.
    ServiceStatus, "status" {
        /// Work requested but not yet picked up.
        Triggered => "triggered",
        /// Work in progress.
        Processing => "processing",
        /// Idle.
        Done => "done",
    }
}

text_enum! {
    /// Lifecycle of a routing plan.
    PlanState, "state" {
        /// Created by the API.
        New => "new",
        /// Region resolved, routes being computed.
        Planning => "planning",
        /// Routes stored.
        Done => "done",
        /// Terminal failure.
        Error => "error",
    }
}

text_enum! {
    /// Kind of routing request.
    TripType, "trip_type" {
        /// From start to finish.
        StartFinish => "start-finish",
        /// Loop from start with a bearing and distance.
        RoundTrip => "round-trip",
    }
}

text_enum! {
    /// Breakdown category of route statistics.
    StatType, "stat_type" {
        /// Road classification (`highway` tag).
        Type => "type",
        /// Surface tag.
        Surface => "surface",
        /// Smoothness tag.
        Smoothness => "smoothness",
    }
}

/// Well-known service record names.
pub mod service_names {
    /// The map-data lifecycle orchestrator.
    pub const MAP_DATA: &str = "map-data";
    /// The router fleet and plan dispatcher.
    pub const ROUTER: &str = "router";
    /// Deployment bookkeeping.
    pub const DEPLOY: &str = "deploy";
}

/// One artifact generation of a region.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct MapDataRecord {
    /// Record id (uuid).
    pub id: String,
    /// Region key, e.g. `europe/latvia`.
    pub region: String,
    /// Version slot.
    #[sqlx(try_from = "String")]
    pub version: MapDataVersion,
    /// Processing status.
    #[sqlx(try_from = "String")]
    pub status: MapDataStatus,
    /// Raw extract path.
    pub pbf_location: String,
    /// Upstream checksum of the raw extract.
    pub pbf_md5: String,
    /// Routing cache directory.
    pub cache_location: String,
    /// Boundary file path.
    pub kml_location: String,
    /// Router binary version the cache is built for.
    pub router_version: String,
    /// Cache directory size in bytes.
    pub cache_size: Option<i64>,
    /// Expected raw extract size in bytes.
    pub pbf_size: Option<i64>,
    /// Bytes downloaded so far.
    pub pbf_downloaded_size: Option<i64>,
    /// Measured router cold-start latency.
    pub startup_time_s: Option<i64>,
    /// Re-download attempts are throttled until this moment.
    pub next_download_after: DateTime<Utc>,
    /// Last failure message.
    pub error: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation (doubles as processing heartbeat).
    pub updated_at: DateTime<Utc>,
}

impl MapDataRecord {
    /// Cache size in bytes, zero when not measured yet.
    pub fn cache_size_bytes(&self) -> u64 {
        self.cache_size.unwrap_or(0).max(0) as u64
    }
}

/// Fields for a new `next` record.
#[derive(Debug, Clone)]
pub struct NewMapData {
    /// Region key.
    pub region: String,
    /// Upstream checksum.
    pub pbf_md5: String,
    /// Raw extract path.
    pub pbf_location: String,
    /// Cache directory.
    pub cache_location: String,
    /// Boundary file path.
    pub kml_location: String,
    /// Router binary version.
    pub router_version: String,
    /// Download cooldown.
    pub next_download_after: DateTime<Utc>,
}

/// A named subsystem's heartbeat and last observed router version.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct ServiceRecord {
    /// Service name, see [`service_names`].
    pub name: String,
    /// Router version last observed by the service.
    pub router_version: Option<String>,
    /// Current status.
    #[sqlx(try_from = "String")]
    pub status: ServiceStatus,
    /// Heartbeat.
    pub updated_at: DateTime<Utc>,
}

/// Boundary polygon of a region generation.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct RegionRecord {
    /// Row id.
    pub id: String,
    /// Region key.
    pub region: String,
    /// Checksum of the extract the boundary belongs to.
    pub pbf_md5: String,
    /// Version slot, follows the map-data record.
    #[sqlx(try_from = "String")]
    pub version: MapDataVersion,
    /// Outer ring as JSON `[[lon, lat], ...]`.
    pub polygon: String,
    /// Bounding box.
    pub min_lon: f64,
    /// Bounding box.
    pub min_lat: f64,
    /// Bounding box.
    pub max_lon: f64,
    /// Bounding box.
    pub max_lat: f64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl RegionRecord {
    /// Decode the outer ring.
    pub fn ring(&self) -> Result<Vec<[f64; 2]>, CoreError> {
        Ok(serde_json::from_str(&self.polygon)?)
    }
}

/// A boundary to upsert; the bounding box is derived from the ring.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRegionBoundary {
    /// Region key.
    pub region: String,
    /// Extract checksum.
    pub pbf_md5: String,
    /// Outer ring `[lon, lat]`.
    pub ring: Vec<[f64; 2]>,
}

impl NewRegionBoundary {
    /// `(min_lon, min_lat, max_lon, max_lat)`, or `None` for an empty ring.
    pub fn bbox(&self) -> Option<(f64, f64, f64, f64)> {
        let first = self.ring.first()?;
        let init = (first[0], first[1], first[0], first[1]);
        Some(self.ring.iter().fold(init, |(a, b, c, d), [lon, lat]| {
            (a.min(*lon), b.min(*lat), c.max(*lon), d.max(*lat))
        }))
    }
}

/// A routing request.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct PlanRecord {
    /// Plan id.
    pub id: String,
    /// Owner.
    pub user_id: String,
    /// Request kind.
    #[sqlx(try_from = "String")]
    pub trip_type: TripType,
    /// Start latitude (decimal text).
    pub start_lat: String,
    /// Start longitude (decimal text).
    pub start_lon: String,
    /// Finish latitude for start-finish trips.
    pub finish_lat: Option<String>,
    /// Finish longitude for start-finish trips.
    pub finish_lon: Option<String>,
    /// Round-trip bearing in degrees.
    pub bearing: Option<String>,
    /// Requested distance in meters.
    pub distance: Option<String>,
    /// Routing rule set.
    pub rule_set_id: Option<String>,
    /// Region resolved at dispatch time.
    pub region: Option<String>,
    /// Lifecycle state.
    #[sqlx(try_from = "String")]
    pub state: PlanState,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last state change.
    pub updated_at: DateTime<Utc>,
}

/// Fields for inserting a plan.
#[derive(Debug, Clone, Default)]
pub struct NewPlan {
    /// Owner.
    pub user_id: String,
    /// Request kind.
    pub trip_type: Option<TripType>,
    /// Start latitude.
    pub start_lat: String,
    /// Start longitude.
    pub start_lon: String,
    /// Finish latitude.
    pub finish_lat: Option<String>,
    /// Finish longitude.
    pub finish_lon: Option<String>,
    /// Bearing.
    pub bearing: Option<String>,
    /// Distance.
    pub distance: Option<String>,
    /// Rule set.
    pub rule_set_id: Option<String>,
}

/// A computed route.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct RouteRecord {
    /// Route id.
    pub id: String,
    /// Owning plan.
    pub plan_id: String,
    /// Owner.
    pub user_id: String,
    /// Display name.
    pub name: String,
    /// JSON `[{"lat":..,"lon":..}]`.
    pub coords: String,
    /// Length in meters.
    pub stats_len_m: f64,
    /// Number of junctions.
    pub stats_junction_count: i64,
    /// Router score.
    pub stats_score: f64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Fields for inserting a route.
#[derive(Debug, Clone)]
pub struct NewRoute {
    /// Owning plan.
    pub plan_id: String,
    /// Owner.
    pub user_id: String,
    /// Display name.
    pub name: String,
    /// JSON coordinates.
    pub coords: String,
    /// Length in meters.
    pub stats_len_m: f64,
    /// Number of junctions.
    pub stats_junction_count: i64,
    /// Router score.
    pub stats_score: f64,
}

/// One per-tag share of a route.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct RouteBreakdownStat {
    /// Route.
    pub route_id: String,
    /// Owner.
    pub user_id: String,
    /// Category.
    #[sqlx(try_from = "String")]
    pub stat_type: StatType,
    /// Tag value (e.g. `asphalt`).
    pub stat_name: String,
    /// Meters on this tag.
    pub len_m: f64,
    /// Share of the route.
    pub percentage: f64,
}

/// A road tag rule; `value == None` means avoid.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct RuleSetRoadTag {
    /// Rule set.
    pub rule_set_id: String,
    /// OSM tag value.
    pub tag_key: String,
    /// Priority, or `None` to avoid.
    pub value: Option<f64>,
}

/// A plan notification leased from the queue.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct PlanQueueMessage {
    /// Message id.
    pub msg_id: i64,
    /// Plan to dispatch.
    pub plan_id: String,
    /// How many times the message was read, including this read.
    pub read_ct: i64,
    /// Invisible to readers until this moment.
    pub visible_at: DateTime<Utc>,
    /// When it was sent.
    pub enqueued_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_enum_round_trip() {
        assert_eq!("next".parse::<MapDataVersion>().unwrap(), MapDataVersion::Next);
        assert_eq!(MapDataStatus::Processing.as_str(), "processing");
        assert_eq!(TripType::RoundTrip.to_string(), "round-trip");
        assert!("finished".parse::<PlanState>().is_err());
    }

    #[test]
    fn test_serde_uses_column_text() {
        let json = serde_json::to_string(&TripType::StartFinish).unwrap();
        assert_eq!(json, "\"start-finish\"");
    }

    #[test]
    fn test_bbox_from_ring() {
        let boundary = NewRegionBoundary {
            region: "europe/andorra".to_string(),
            pbf_md5: "abc123".to_string(),
            ring: vec![[1.4, 42.4], [1.8, 42.4], [1.8, 42.7], [1.4, 42.7], [1.4, 42.4]],
        };
        assert_eq!(boundary.bbox(), Some((1.4, 42.4, 1.8, 42.7)));
    }

    #[test]
    fn test_bbox_empty_ring() {
        let boundary = NewRegionBoundary {
            region: "x".to_string(),
            pbf_md5: "y".to_string(),
            ring: vec![],
        };
        assert_eq!(boundary.bbox(), None);
    }
}

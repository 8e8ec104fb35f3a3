// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Routing rules passed to the router client on stdin.
//!
//! A rule set stores one row per OSM tag value: a null value means the road
//! type should be avoided, a number raises or lowers its priority. The router
//! expects them grouped by the OSM key the value belongs to:
//!
//! ```json
//! {"highway": {"motorway": {"action": "avoid"}},
//!  "surface": {"gravel": {"action": "priority", "value": 20}}}
//! ```

use std::collections::BTreeMap;

use ridi_core::models::RuleSetRoadTag;
use serde::Serialize;
use tracing::warn;

const HIGHWAY_TAGS: &[&str] = &[
    "motorway",
    "trunk",
    "primary",
    "secondary",
    "tertiary",
    "unclassified",
    "residential",
    "living_street",
    "track",
    "path",
];

const SURFACE_TAGS: &[&str] = &[
    "paved",
    "asphalt",
    "chipseal",
    "concrete",
    "concrete:lanes",
    "concrete:plates",
    "paving_stones",
    "paving_stones:lanes",
    "grass_paver",
    "sett",
    "unhewn_cobblestone",
    "cobblestone",
    "bricks",
    "unpaved",
    "compacted",
    "fine_gravel",
    "gravel",
    "shells",
    "rock",
    "pebblestone",
    "ground",
    "dirt",
    "earth",
    "grass",
    "mud",
    "sand",
    "woodchips",
    "snow",
    "ice",
    "salt",
    "metal",
    "metal_grid",
    "wood",
    "stepping_stones",
    "rubber",
    "tiles",
];

const SMOOTHNESS_TAGS: &[&str] = &[
    "excellent",
    "good",
    "intermediate",
    "bad",
    "very_bad",
    "horrible",
    "very_horrible",
    "impassable",
];

/// OSM key a tag value belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TagSection {
    /// `highway=*`
    Highway,
    /// `surface=*`
    Surface,
    /// `smoothness=*`
    Smoothness,
}

/// Section of a known tag value.
pub fn tag_section(tag: &str) -> Option<TagSection> {
    if HIGHWAY_TAGS.contains(&tag) {
        Some(TagSection::Highway)
    } else if SURFACE_TAGS.contains(&tag) {
        Some(TagSection::Surface)
    } else if SMOOTHNESS_TAGS.contains(&tag) {
        Some(TagSection::Smoothness)
    } else {
        None
    }
}

/// Rule kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    /// Never route over this tag.
    Avoid,
    /// Weight the tag by `value`.
    Priority,
}

/// Rule for one tag value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TagRule {
    /// What to do with the tag.
    pub action: RuleAction,
    /// Priority weight.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
}

/// Rules grouped by section, then tag value.
pub type RoutingRules = BTreeMap<TagSection, BTreeMap<String, TagRule>>;

/// Group rule set rows by section. Unknown tag values are skipped.
pub fn build_rules(tags: &[RuleSetRoadTag]) -> RoutingRules {
    let mut rules = RoutingRules::new();
    for tag in tags {
        let Some(section) = tag_section(&tag.tag_key) else {
            warn!(rule_set_id = %tag.rule_set_id, tag = %tag.tag_key, "Unknown road tag in rule set, skipping");
            continue;
        };
        let rule = match tag.value {
            None => TagRule {
                action: RuleAction::Avoid,
                value: None,
            },
            Some(value) => TagRule {
                action: RuleAction::Priority,
                value: Some(value),
            },
        };
        rules
            .entry(section)
            .or_default()
            .insert(tag.tag_key.clone(), rule);
    }
    rules
}

/// JSON document written to the client's stdin.
pub fn rules_json(tags: &[RuleSetRoadTag]) -> serde_json::Result<String> {
    serde_json::to_string(&build_rules(tags))
}

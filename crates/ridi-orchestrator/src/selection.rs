// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Picks the routes shown to the user out of the router's candidates.
//!
//! Candidates are spread over six length buckets relative to the requested
//! distance (up to 1×, 1–1.5×, 1.5–2×, 2–2.5×, 2.5–3× and over 3×). The pick
//! goes round-robin over the buckets, taking the best scoring route not yet
//! taken from each, so a user asking for 100 km gets a mix of lengths rather
//! than six variants of the single best loop.

use ridi_core::models::TripType;

use crate::dispatcher::RouterRoute;

/// Number of routes stored per plan.
pub const BEST_ROUTES: usize = 6;

/// `(from, to)` multipliers of the target length; zero means unbounded.
const BUCKETS: [(f64, f64); BEST_ROUTES] = [
    (0.0, 1.0),
    (1.0, 1.5),
    (1.5, 2.0),
    (2.0, 2.5),
    (2.5, 3.0),
    (3.0, 0.0),
];

/// Target length the buckets are relative to. A start-finish distance is
/// the straight-line distance, so it is doubled.
fn target_length(trip_type: TripType, distance: Option<f64>) -> Option<f64> {
    let modifier = match trip_type {
        TripType::RoundTrip => 1.0,
        TripType::StartFinish => 2.0,
    };
    distance
        .filter(|d| d.is_finite() && *d > 0.0)
        .map(|d| d * modifier)
}

fn in_bucket(len_m: f64, target: f64, (from, to): (f64, f64)) -> bool {
    (from == 0.0 || len_m > target * from) && (to == 0.0 || len_m <= target * to)
}

/// Select up to [`BEST_ROUTES`] routes.
///
/// With few enough candidates all are kept in router order. Without a usable
/// distance the highest scores win.
pub fn select_routes(
    routes: Vec<RouterRoute>,
    trip_type: TripType,
    distance: Option<f64>,
) -> Vec<RouterRoute> {
    if routes.len() <= BEST_ROUTES {
        return routes;
    }

    let mut by_score: Vec<usize> = (0..routes.len()).collect();
    by_score.sort_by(|a, b| routes[*b].stats.score.total_cmp(&routes[*a].stats.score));

    let mut picked: Vec<usize> = Vec::with_capacity(BEST_ROUTES);

    if let Some(target) = target_length(trip_type, distance) {
        let buckets: Vec<Vec<usize>> = BUCKETS
            .iter()
            .map(|bucket| {
                by_score
                    .iter()
                    .copied()
                    .filter(|i| in_bucket(routes[*i].stats.len_m, target, *bucket))
                    .collect()
            })
            .collect();
        let rounds = buckets.iter().map(Vec::len).max().unwrap_or(0);

        'rounds: for round in 0..rounds {
            for bucket in &buckets {
                if picked.len() == BEST_ROUTES {
                    break 'rounds;
                }
                if let Some(i) = bucket.get(round) {
                    picked.push(*i);
                }
            }
        }
    }

    // Routes with a non-finite length fall in no bucket.
    for i in by_score {
        if picked.len() == BEST_ROUTES {
            break;
        }
        if !picked.contains(&i) {
            picked.push(i);
        }
    }

    let mut routes: Vec<Option<RouterRoute>> = routes.into_iter().map(Some).collect();
    picked
        .into_iter()
        .filter_map(|i| routes[i].take())
        .collect()
}

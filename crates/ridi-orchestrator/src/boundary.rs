// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Region boundary polygons: KML parsing and point-in-polygon tests.

use std::path::Path;

use geo::{Contains, LineString, Point, Polygon};
use kml::Kml;
use kml::types::{Geometry, Placemark};
use ridi_core::models::RegionRecord;

use crate::error::{Error, Result};

/// Outer ring of the first placemark, as `[lon, lat]` pairs.
///
/// The first placemark must carry a `Polygon`; inner rings are ignored.
pub fn parse_kml(content: &str) -> Result<Vec<[f64; 2]>> {
    let kml: Kml = content
        .parse()
        .map_err(|e| Error::Boundary(format!("invalid KML: {}", e)))?;

    let placemark =
        first_placemark(&kml).ok_or_else(|| Error::Boundary("no placemark".to_string()))?;

    match &placemark.geometry {
        Some(Geometry::Polygon(polygon)) => {
            let ring: Vec<[f64; 2]> = polygon.outer.coords.iter().map(|c| [c.x, c.y]).collect();
            if ring.len() < 3 {
                return Err(Error::Boundary(format!(
                    "outer ring has {} points",
                    ring.len()
                )));
            }
            Ok(ring)
        }
        Some(_) => Err(Error::Boundary("unexpected geometry type".to_string())),
        None => Err(Error::Boundary("placemark without geometry".to_string())),
    }
}

/// Read and parse a boundary file.
pub async fn read_kml(path: &Path) -> Result<Vec<[f64; 2]>> {
    let content = tokio::fs::read_to_string(path).await?;
    parse_kml(&content)
}

fn first_placemark(kml: &Kml) -> Option<&Placemark> {
    match kml {
        Kml::Placemark(placemark) => Some(placemark),
        Kml::KmlDocument(doc) => doc.elements.iter().find_map(first_placemark),
        Kml::Document { elements, .. } | Kml::Folder { elements, .. } => {
            elements.iter().find_map(first_placemark)
        }
        _ => None,
    }
}

/// Whether `(lat, lon)` lies strictly inside the ring.
pub fn ring_contains(ring: &[[f64; 2]], lat: f64, lon: f64) -> bool {
    let exterior: LineString<f64> = ring.iter().map(|[x, y]| (*x, *y)).collect();
    Polygon::new(exterior, vec![]).contains(&Point::new(lon, lat))
}

/// Exact containment test for a stored boundary.
pub fn region_contains(region: &RegionRecord, lat: f64, lon: f64) -> Result<bool> {
    Ok(ring_contains(&region.ring()?, lat, lon))
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Where artifacts live, locally and upstream.

use std::path::{Path, PathBuf};

use tokio::fs;

use crate::error::Result;

/// Local artifact layout under the data directory.
///
/// ```text
/// {data}/cache/{router_version}/{region}/{md5}/
/// {data}/pbf/{region}/{md5}/osm.pbf
/// {data}/pbf/{region}/{md5}/osm.kml
/// ```
///
/// Accessors create the parent directories on demand.
#[derive(Debug, Clone)]
pub struct Locations {
    data_dir: PathBuf,
}

impl Locations {
    /// Layout rooted at `data_dir`.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    /// Root directory.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Cache directory for a router version and extract.
    pub async fn cache_dir(&self, router_version: &str, region: &str, md5: &str) -> Result<PathBuf> {
        let dir = self
            .data_dir
            .join("cache")
            .join(router_version)
            .join(region)
            .join(md5);
        fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    /// Raw extract path.
    pub async fn pbf_path(&self, region: &str, md5: &str) -> Result<PathBuf> {
        Ok(self.extract_dir(region, md5).await?.join("osm.pbf"))
    }

    /// Boundary file path.
    pub async fn kml_path(&self, region: &str, md5: &str) -> Result<PathBuf> {
        Ok(self.extract_dir(region, md5).await?.join("osm.kml"))
    }

    async fn extract_dir(&self, region: &str, md5: &str) -> Result<PathBuf> {
        let dir = self.data_dir.join("pbf").join(region).join(md5);
        fs::create_dir_all(&dir).await?;
        Ok(dir)
    }
}

/// Upstream URLs for a region, Geofabrik style.
#[derive(Debug, Clone)]
pub struct OsmLocations {
    base_url: String,
}

impl OsmLocations {
    /// URLs relative to `base_url` (without trailing slash).
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Boundary polygon.
    pub fn kml_url(&self, region: &str) -> String {
        format!("{}/{}.kml", self.base_url, region)
    }

    /// Latest raw extract.
    pub fn pbf_url(&self, region: &str) -> String {
        format!("{}/{}-latest.osm.pbf", self.base_url, region)
    }

    /// Checksum of the latest raw extract.
    pub fn md5_url(&self, region: &str) -> String {
        format!("{}/{}-latest.osm.pbf.md5", self.base_url, region)
    }
}

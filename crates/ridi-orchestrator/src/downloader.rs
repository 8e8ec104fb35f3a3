// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Upstream checksum and file downloads.
//!
//! Progress is reported as a stream of [`DownloadProgress`] events on an
//! unbounded channel so the caller decides how often to persist it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Progress event of a single download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadProgress {
    /// Expected body size, sent once when the server announces it.
    Total(u64),
    /// Bytes received in one chunk.
    Chunk(u64),
}

/// Sender half handed to [`Downloader::download`].
pub type ProgressSender = mpsc::UnboundedSender<DownloadProgress>;

/// Fetches checksums and artifacts from the upstream mirror.
#[async_trait]
pub trait Downloader: Send + Sync {
    /// Checksum published at `url`: the first whitespace-separated token.
    async fn fetch_md5(&self, url: &str) -> Result<String>;

    /// Stream `url` into `dest`, returning the number of bytes written.
    async fn download(&self, url: &str, dest: &Path, progress: Option<ProgressSender>)
    -> Result<u64>;
}

fn first_token(body: &str, url: &str) -> Result<String> {
    body.split_whitespace()
        .next()
        .map(str::to_string)
        .ok_or_else(|| Error::Download(format!("empty checksum at {}", url)))
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".part");
    dest.with_file_name(name)
}

/// `reqwest` backed downloader.
#[derive(Debug, Clone, Default)]
pub struct HttpDownloader {
    client: reqwest::Client,
}

impl HttpDownloader {
    /// Downloader with a default client.
    pub fn new() -> Self {
        Self::default()
    }

    /// Downloader sharing an existing client.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response> {
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(Error::Download(format!(
                "{} -> {}",
                url,
                response.status()
            )));
        }
        Ok(response)
    }
}

#[async_trait]
impl Downloader for HttpDownloader {
    async fn fetch_md5(&self, url: &str) -> Result<String> {
        let body = self.get(url).await?.text().await?;
        first_token(&body, url)
    }

    async fn download(
        &self,
        url: &str,
        dest: &Path,
        progress: Option<ProgressSender>,
    ) -> Result<u64> {
        let response = self.get(url).await?;

        if let (Some(tx), Some(total)) = (&progress, response.content_length()) {
            let _ = tx.send(DownloadProgress::Total(total));
        }

        let part = part_path(dest);
        let written = match write_body(response, &part, dest, progress.as_ref()).await {
            Ok(written) => written,
            Err(e) => {
                if let Err(rm) = tokio::fs::remove_file(&part).await
                    && rm.kind() != std::io::ErrorKind::NotFound
                {
                    warn!(part = %part.display(), error = %rm, "Failed to remove partial download");
                }
                return Err(e);
            }
        };

        debug!(url = %url, dest = %dest.display(), bytes = written, "Download complete");
        Ok(written)
    }
}

/// Stream the body into `part`, then move it to `dest`.
async fn write_body(
    response: reqwest::Response,
    part: &Path,
    dest: &Path,
    progress: Option<&ProgressSender>,
) -> Result<u64> {
    let mut file = tokio::fs::File::create(part).await?;
    let mut written = 0u64;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
        if let Some(tx) = progress {
            let _ = tx.send(DownloadProgress::Chunk(chunk.len() as u64));
        }
    }
    file.flush().await?;
    drop(file);
    tokio::fs::rename(part, dest).await?;
    Ok(written)
}

/// In-memory downloader for tests.
#[derive(Debug, Default)]
pub struct MockDownloader {
    bodies: Mutex<HashMap<String, Vec<u8>>>,
    requests: Mutex<Vec<String>>,
    chunk_size: usize,
}

impl MockDownloader {
    /// Empty mock; unknown URLs fail like a 404.
    pub fn new() -> Self {
        Self {
            chunk_size: 64 * 1024,
            ..Default::default()
        }
    }

    /// Serve `body` at `url`.
    pub fn serve(&self, url: &str, body: impl Into<Vec<u8>>) {
        if let Ok(mut bodies) = self.bodies.lock() {
            bodies.insert(url.to_string(), body.into());
        }
    }

    /// Stop serving `url`.
    pub fn remove(&self, url: &str) {
        if let Ok(mut bodies) = self.bodies.lock() {
            bodies.remove(url);
        }
    }

    /// Every requested URL, in order.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Number of requests for `url`.
    pub fn request_count(&self, url: &str) -> usize {
        self.requests().iter().filter(|r| r.as_str() == url).count()
    }

    fn body(&self, url: &str) -> Result<Vec<u8>> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(url.to_string());
        }
        self.bodies
            .lock()
            .ok()
            .and_then(|bodies| bodies.get(url).cloned())
            .ok_or_else(|| Error::Download(format!("{} -> 404 Not Found", url)))
    }
}

#[async_trait]
impl Downloader for MockDownloader {
    async fn fetch_md5(&self, url: &str) -> Result<String> {
        let body = self.body(url)?;
        first_token(&String::from_utf8_lossy(&body), url)
    }

    async fn download(
        &self,
        url: &str,
        dest: &Path,
        progress: Option<ProgressSender>,
    ) -> Result<u64> {
        let body = self.body(url)?;
        if let Some(tx) = &progress {
            let _ = tx.send(DownloadProgress::Total(body.len() as u64));
            for chunk in body.chunks(self.chunk_size.max(1)) {
                let _ = tx.send(DownloadProgress::Chunk(chunk.len() as u64));
            }
        }
        tokio::fs::write(dest, &body).await?;
        Ok(body.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_fetch_md5_takes_first_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/europe/andorra-latest.osm.pbf.md5"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("d41d8cd98f00b204e9800998ecf8427e  andorra-latest.osm.pbf\n"),
            )
            .mount(&server)
            .await;

        let downloader = HttpDownloader::new();
        let md5 = downloader
            .fetch_md5(&format!("{}/europe/andorra-latest.osm.pbf.md5", server.uri()))
            .await
            .unwrap();

        assert_eq!(md5, "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[tokio::test]
    async fn test_fetch_md5_non_success_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = HttpDownloader::new()
            .fetch_md5(&format!("{}/x.md5", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Download(_)));
    }

    #[tokio::test]
    async fn test_download_streams_body_and_reports_progress() {
        let server = MockServer::start().await;
        let body = vec![7u8; 300_000];
        Mock::given(method("GET"))
            .and(path("/europe/andorra-latest.osm.pbf"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("osm.pbf");
        let (tx, mut rx) = mpsc::unbounded_channel();

        let written = HttpDownloader::new()
            .download(
                &format!("{}/europe/andorra-latest.osm.pbf", server.uri()),
                &dest,
                Some(tx),
            )
            .await
            .unwrap();

        assert_eq!(written, 300_000);
        assert_eq!(std::fs::read(&dest).unwrap(), body);
        assert!(!part_path(&dest).exists());

        let mut total = None;
        let mut received = 0;
        while let Ok(event) = rx.try_recv() {
            match event {
                DownloadProgress::Total(n) => total = Some(n),
                DownloadProgress::Chunk(n) => received += n,
            }
        }
        assert_eq!(total, Some(300_000));
        assert_eq!(received, 300_000);
    }

    #[tokio::test]
    async fn test_failed_download_removes_part_file() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/europe/andorra-latest.osm.pbf"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8; 10_000]))
            .mount(&server)
            .await;

        // The body streams fine but cannot be moved over a directory.
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("osm.pbf");
        tokio::fs::create_dir_all(dest.join("occupied")).await.unwrap();

        let result = HttpDownloader::new()
            .download(
                &format!("{}/europe/andorra-latest.osm.pbf", server.uri()),
                &dest,
                None,
            )
            .await;

        assert!(matches!(result, Err(Error::Io(_))));
        assert!(!part_path(&dest).exists());
        assert!(dest.is_dir());
    }

    #[tokio::test]
    async fn test_download_404_leaves_no_file() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("osm.kml");
        let result = HttpDownloader::new()
            .download(&format!("{}/missing.kml", server.uri()), &dest, None)
            .await;

        assert!(result.is_err());
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_mock_downloader_counts_requests() {
        let mock = MockDownloader::new();
        mock.serve("http://osm/a.md5", "abc  a.pbf");

        assert_eq!(mock.fetch_md5("http://osm/a.md5").await.unwrap(), "abc");
        assert!(mock.fetch_md5("http://osm/b.md5").await.is_err());
        assert_eq!(mock.request_count("http://osm/a.md5"), 1);
        assert_eq!(mock.requests().len(), 2);
    }
}

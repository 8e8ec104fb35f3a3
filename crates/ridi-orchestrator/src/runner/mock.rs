// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock runner for testing.
//!
//! Simulates the router binary without spawning processes: `prep-cache`
//! writes a file of a configurable size into the cache directory, servers
//! become ready after a configurable delay, and client calls return scripted
//! outputs per socket.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

use super::traits::*;

/// A recorded `start-client` invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientCall {
    /// Request as passed to the runner.
    pub request: ClientRequest,
    /// Rules JSON written to stdin.
    pub stdin: String,
}

#[derive(Debug, Default)]
struct MockState {
    prep_output: RunOutput,
    cache_bytes: usize,
    startup_delay: Duration,
    fail_start: bool,
    client_outputs: HashMap<String, RunOutput>,
    default_client_output: RunOutput,
    prep_calls: Vec<(PathBuf, PathBuf)>,
    server_starts: Vec<String>,
    client_calls: Vec<ClientCall>,
    servers: HashMap<String, Arc<AtomicBool>>,
}

/// Mock runner for testing.
pub struct MockRunner {
    state: Mutex<MockState>,
    kills: Arc<Mutex<Vec<String>>>,
}

impl Default for MockRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRunner {
    /// Successful runner: prep exits 0 and writes 1 MiB, servers are ready
    /// immediately, clients print an empty route list.
    pub fn new() -> Self {
        let state = MockState {
            cache_bytes: 1024 * 1024,
            default_client_output: RunOutput {
                exit_code: 0,
                stdout: r#"{"id":"mock","result":{"ok":{"routes":[]}}}"#.to_string(),
                stderr: String::new(),
            },
            ..Default::default()
        };
        Self {
            state: Mutex::new(state),
            kills: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Scripted `prep-cache` outcome.
    pub fn with_prep_output(mut self, exit_code: i32, stdout: &str, stderr: &str) -> Self {
        self.state.get_mut().prep_output = RunOutput {
            exit_code,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        };
        self
    }

    /// Bytes written into the cache directory by `prep-cache`.
    pub fn with_cache_bytes(mut self, bytes: usize) -> Self {
        self.state.get_mut().cache_bytes = bytes;
        self
    }

    /// Delay before a server reports readiness.
    pub fn with_startup_delay(mut self, delay: Duration) -> Self {
        self.state.get_mut().startup_delay = delay;
        self
    }

    /// Make every `start-server` fail to spawn.
    pub async fn set_fail_start(&self, fail: bool) {
        self.state.lock().await.fail_start = fail;
    }

    /// Output returned by clients talking to `socket_name`.
    pub async fn set_client_output(&self, socket_name: &str, output: RunOutput) {
        self.state
            .lock()
            .await
            .client_outputs
            .insert(socket_name.to_string(), output);
    }

    /// Simulate a crash of the latest server on `socket_name`.
    pub async fn crash_server(&self, socket_name: &str) {
        if let Some(exited) = self.state.lock().await.servers.get(socket_name) {
            exited.store(true, Ordering::SeqCst);
        }
    }

    /// `(pbf, cache_dir)` of every `prep-cache` call.
    pub async fn prep_calls(&self) -> Vec<(PathBuf, PathBuf)> {
        self.state.lock().await.prep_calls.clone()
    }

    /// Socket names of every `start-server` call, in order.
    pub async fn server_starts(&self) -> Vec<String> {
        self.state.lock().await.server_starts.clone()
    }

    /// Every `start-client` call, in order.
    pub async fn client_calls(&self) -> Vec<ClientCall> {
        self.state.lock().await.client_calls.clone()
    }

    /// Socket names of every killed server, in order.
    pub async fn kills(&self) -> Vec<String> {
        self.kills.lock().await.clone()
    }
}

#[async_trait]
impl Runner for MockRunner {
    async fn prep_cache(&self, pbf: &Path, cache_dir: &Path) -> Result<RunOutput> {
        let (output, bytes) = {
            let mut state = self.state.lock().await;
            state
                .prep_calls
                .push((pbf.to_path_buf(), cache_dir.to_path_buf()));
            (state.prep_output.clone(), state.cache_bytes)
        };

        tokio::fs::create_dir_all(cache_dir).await?;
        tokio::fs::write(cache_dir.join("cache.bin"), vec![0u8; bytes]).await?;

        Ok(output)
    }

    async fn start_server(&self, options: &ServerOptions) -> Result<Box<dyn RouterServer>> {
        let (delay, fail) = {
            let mut state = self.state.lock().await;
            state.server_starts.push(options.socket_name.clone());
            (state.startup_delay, state.fail_start)
        };

        if fail {
            return Err(RunnerError::StartFailed("mock start failure".to_string()));
        }

        if delay > options.startup_timeout {
            tokio::time::sleep(options.startup_timeout).await;
            return Err(RunnerError::ReadinessTimeout(options.startup_timeout));
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let exited = Arc::new(AtomicBool::new(false));
        self.state
            .lock()
            .await
            .servers
            .insert(options.socket_name.clone(), exited.clone());

        Ok(Box::new(MockServer {
            socket_name: options.socket_name.clone(),
            exited,
            kills: self.kills.clone(),
        }))
    }

    async fn run_client(&self, request: &ClientRequest, stdin_json: &str) -> Result<RunOutput> {
        let mut state = self.state.lock().await;
        state.client_calls.push(ClientCall {
            request: request.clone(),
            stdin: stdin_json.to_string(),
        });
        Ok(state
            .client_outputs
            .get(&request.socket_name)
            .cloned()
            .unwrap_or_else(|| state.default_client_output.clone()))
    }
}

struct MockServer {
    socket_name: String,
    exited: Arc<AtomicBool>,
    kills: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl RouterServer for MockServer {
    fn pid(&self) -> Option<u32> {
        None
    }

    async fn kill(&mut self) {
        self.exited.store(true, Ordering::SeqCst);
        self.kills.lock().await.push(self.socket_name.clone());
    }

    async fn has_exited(&mut self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn options(socket_name: &str, timeout: Duration) -> ServerOptions {
        ServerOptions {
            pbf: PathBuf::from("osm.pbf"),
            cache_dir: PathBuf::from("cache"),
            socket_name: socket_name.to_string(),
            startup_timeout: timeout,
        }
    }

    #[tokio::test]
    async fn test_prep_cache_writes_cache_file() {
        let dir = TempDir::new().unwrap();
        let runner = MockRunner::new()
            .with_cache_bytes(2048)
            .with_prep_output(1, "out", "err");

        let cache_dir = dir.path().join("cache");
        let output = runner
            .prep_cache(Path::new("osm.pbf"), &cache_dir)
            .await
            .unwrap();

        assert_eq!(output.exit_code, 1);
        assert_eq!(
            std::fs::metadata(cache_dir.join("cache.bin")).unwrap().len(),
            2048
        );
        assert_eq!(runner.prep_calls().await.len(), 1);
    }

    #[tokio::test]
    async fn test_server_crash_and_kill() {
        let runner = MockRunner::new();
        let mut server = runner
            .start_server(&options("europe/andorra", Duration::from_secs(1)))
            .await
            .unwrap();
        assert!(!server.has_exited().await);

        runner.crash_server("europe/andorra").await;
        assert!(server.has_exited().await);

        server.kill().await;
        assert_eq!(runner.kills().await, vec!["europe/andorra"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_startup_delay_beyond_timeout() {
        let runner = MockRunner::new().with_startup_delay(Duration::from_secs(60));
        let result = runner
            .start_server(&options("europe/andorra", Duration::from_secs(5)))
            .await;
        assert!(matches!(result, Err(RunnerError::ReadinessTimeout(_))));
    }

    #[tokio::test]
    async fn test_client_output_per_socket() {
        let runner = MockRunner::new();
        runner
            .set_client_output(
                "europe/latvia",
                RunOutput {
                    exit_code: 1,
                    stdout: String::new(),
                    stderr: "socket gone".to_string(),
                },
            )
            .await;

        let request = |socket: &str| ClientRequest {
            socket_name: socket.to_string(),
            route_req_id: "p".to_string(),
            trip: ClientTrip::StartFinish {
                start: (0.0, 0.0),
                finish: (1.0, 1.0),
            },
        };

        let latvia = runner.run_client(&request("europe/latvia"), "{}").await.unwrap();
        let andorra = runner.run_client(&request("europe/andorra"), "{}").await.unwrap();
        assert_eq!(latvia.exit_code, 1);
        assert!(andorra.success());
        assert_eq!(runner.client_calls().await.len(), 2);
    }
}

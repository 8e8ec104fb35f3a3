// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runner backed by `tokio::process` children of the router binary.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use super::traits::*;

/// Spawns the router binary for every operation.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    bin: PathBuf,
    kill_grace: Duration,
}

impl ProcessRunner {
    /// Runner for the binary at `bin`.
    pub fn new(bin: impl Into<PathBuf>) -> Self {
        Self {
            bin: bin.into(),
            kill_grace: Duration::from_secs(5),
        }
    }

    /// How long a server gets between SIGTERM and SIGKILL.
    pub fn with_kill_grace(mut self, kill_grace: Duration) -> Self {
        self.kill_grace = kill_grace;
        self
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.bin);
        cmd.stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    fn start_failed(&self, err: std::io::Error) -> RunnerError {
        RunnerError::StartFailed(format!("{}: {}", self.bin.display(), err))
    }
}

#[async_trait]
impl Runner for ProcessRunner {
    async fn prep_cache(&self, pbf: &Path, cache_dir: &Path) -> Result<RunOutput> {
        debug!(pbf = %pbf.display(), cache_dir = %cache_dir.display(), "Running prep-cache");

        let output = self
            .command()
            .arg("prep-cache")
            .arg("--input")
            .arg(pbf)
            .arg("--cache-dir")
            .arg(cache_dir)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| self.start_failed(e))?;

        Ok(run_output(output))
    }

    async fn start_server(&self, options: &ServerOptions) -> Result<Box<dyn RouterServer>> {
        let mut child = self
            .command()
            .arg("start-server")
            .arg("--input")
            .arg(&options.pbf)
            .arg("--cache-dir")
            .arg(&options.cache_dir)
            .arg("--socket-name")
            .arg(&options.socket_name)
            .stdin(Stdio::null())
            .spawn()
            .map_err(|e| self.start_failed(e))?;

        debug!(socket_name = %options.socket_name, pid = ?child.id(), "Router server spawned");

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(options.socket_name.clone(), stderr));
        }

        let Some(stdout) = child.stdout.take() else {
            let _ = child.kill().await;
            return Err(RunnerError::StartFailed("stdout was not captured".to_string()));
        };
        let mut lines = BufReader::new(stdout).lines();

        match tokio::time::timeout(options.startup_timeout, wait_for_ready(&mut lines)).await {
            Ok(Ok(true)) => {}
            Ok(Ok(false)) => {
                let _ = child.kill().await;
                return Err(RunnerError::ReadinessEof);
            }
            Ok(Err(e)) => {
                let _ = child.kill().await;
                return Err(RunnerError::Io(e));
            }
            Err(_) => {
                warn!(
                    socket_name = %options.socket_name,
                    timeout_secs = options.startup_timeout.as_secs(),
                    "Router server readiness timed out, killing"
                );
                let _ = child.kill().await;
                return Err(RunnerError::ReadinessTimeout(options.startup_timeout));
            }
        }

        // Keep draining stdout so the server never blocks on a full pipe.
        tokio::spawn(drain_stdout(options.socket_name.clone(), lines));

        Ok(Box::new(ProcessServer {
            child,
            socket_name: options.socket_name.clone(),
            kill_grace: self.kill_grace,
        }))
    }

    async fn run_client(&self, request: &ClientRequest, stdin_json: &str) -> Result<RunOutput> {
        let mut child = self
            .command()
            .args(request.args())
            .stdin(Stdio::piped())
            .spawn()
            .map_err(|e| self.start_failed(e))?;

        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(stdin_json.as_bytes()).await {
                warn!(route_req_id = %request.route_req_id, error = %e, "Failed to write rules to router client");
            }
            drop(stdin);
        }

        let output = child.wait_with_output().await?;
        Ok(run_output(output))
    }
}

/// A `start-server` child.
struct ProcessServer {
    child: Child,
    socket_name: String,
    kill_grace: Duration,
}

#[async_trait]
impl RouterServer for ProcessServer {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn kill(&mut self) {
        if let Some(pid) = self.child.id() {
            match signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                Ok(()) => {
                    if let Ok(Ok(status)) =
                        tokio::time::timeout(self.kill_grace, self.child.wait()).await
                    {
                        debug!(socket_name = %self.socket_name, %status, "Router server terminated");
                        return;
                    }
                    warn!(socket_name = %self.socket_name, pid, "Router server ignored SIGTERM");
                }
                Err(nix::errno::Errno::ESRCH) => {}
                Err(e) => {
                    warn!(socket_name = %self.socket_name, pid, error = %e, "Failed to send SIGTERM");
                }
            }
        }

        if let Err(e) = self.child.kill().await {
            warn!(socket_name = %self.socket_name, error = %e, "Failed to kill router server");
        }
    }

    async fn has_exited(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(Some(status)) => {
                info!(socket_name = %self.socket_name, %status, "Router server exited");
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!(socket_name = %self.socket_name, error = %e, "Failed to poll router server");
                true
            }
        }
    }
}

fn run_output(output: std::process::Output) -> RunOutput {
    RunOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    }
}

/// Whether a stdout line announces readiness.
pub(crate) fn is_ready_line(line: &str) -> bool {
    line.split(';').any(|token| token.trim() == SERVER_READY_TOKEN)
}

async fn wait_for_ready<R: AsyncRead + Unpin>(
    lines: &mut Lines<BufReader<R>>,
) -> std::io::Result<bool> {
    while let Some(line) = lines.next_line().await? {
        if is_ready_line(&line) {
            return Ok(true);
        }
        debug!(output = %line, "Router server stdout");
    }
    Ok(false)
}

async fn drain_stdout<R: AsyncRead + Unpin>(socket_name: String, mut lines: Lines<BufReader<R>>) {
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(socket_name = %socket_name, output = %line, "Router server stdout");
    }
}

/// Router stderr is newline-delimited JSON.
async fn forward_stderr<R: AsyncRead + Unpin>(socket_name: String, stderr: R) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => log_ndjson_line(&socket_name, &line),
            Ok(None) => break,
            Err(e) => {
                warn!(socket_name = %socket_name, error = %e, "Router server stderr closed");
                break;
            }
        }
    }
}

pub(crate) fn log_ndjson_line(socket_name: &str, line: &str) {
    if line.trim().is_empty() {
        return;
    }
    match serde_json::from_str::<serde_json::Value>(line) {
        Ok(output) => info!(socket_name = %socket_name, output = %output, "Router server output"),
        Err(_) => warn!(socket_name = %socket_name, raw = %line, "Router server unparsable output"),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    /// Writes an executable shell script standing in for the router binary.
    fn fake_router(dir: &TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("ridi-router");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn server_options(dir: &TempDir, timeout: Duration) -> ServerOptions {
        ServerOptions {
            pbf: dir.path().join("osm.pbf"),
            cache_dir: dir.path().join("cache"),
            socket_name: "europe/andorra".to_string(),
            startup_timeout: timeout,
        }
    }

    #[test]
    fn test_is_ready_line() {
        assert!(is_ready_line("RIDI_ROUTER SERVER READY"));
        assert!(is_ready_line("loading;RIDI_ROUTER SERVER READY;"));
        assert!(!is_ready_line("RIDI_ROUTER SERVER STARTING"));
        assert!(!is_ready_line("xRIDI_ROUTER SERVER READY"));
    }

    #[tokio::test]
    async fn test_prep_cache_returns_exit_code_as_data() {
        let dir = TempDir::new().unwrap();
        let bin = fake_router(&dir, "echo \"$1 $2 $3\"; echo bad input >&2; exit 3");
        let runner = ProcessRunner::new(bin);

        let output = runner
            .prep_cache(Path::new("/tmp/osm.pbf"), Path::new("/tmp/cache"))
            .await
            .unwrap();

        assert_eq!(output.exit_code, 3);
        assert_eq!(output.stdout.trim(), "prep-cache --input /tmp/osm.pbf");
        assert_eq!(output.stderr.trim(), "bad input");
    }

    #[tokio::test]
    async fn test_start_server_waits_for_ready_token() {
        let dir = TempDir::new().unwrap();
        let bin = fake_router(
            &dir,
            "echo '{\"level\":\"info\"}' >&2; echo loading; echo 'x;RIDI_ROUTER SERVER READY'; sleep 30",
        );
        let runner = ProcessRunner::new(bin).with_kill_grace(Duration::from_secs(1));

        let mut server = runner
            .start_server(&server_options(&dir, Duration::from_secs(10)))
            .await
            .unwrap();

        assert!(server.pid().is_some());
        assert!(!server.has_exited().await);
        server.kill().await;
        assert!(server.has_exited().await);
    }

    #[tokio::test]
    async fn test_start_server_eof_before_ready() {
        let dir = TempDir::new().unwrap();
        let bin = fake_router(&dir, "echo cache corrupt; exit 1");
        let runner = ProcessRunner::new(bin);

        let err = runner
            .start_server(&server_options(&dir, Duration::from_secs(10)))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RunnerError::ReadinessEof));
    }

    #[tokio::test]
    async fn test_start_server_readiness_timeout() {
        let dir = TempDir::new().unwrap();
        let bin = fake_router(&dir, "sleep 30");
        let runner = ProcessRunner::new(bin);

        let err = runner
            .start_server(&server_options(&dir, Duration::from_millis(200)))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RunnerError::ReadinessTimeout(_)));
    }

    #[tokio::test]
    async fn test_run_client_feeds_stdin() {
        let dir = TempDir::new().unwrap();
        let bin = fake_router(&dir, "cat");
        let runner = ProcessRunner::new(bin);
        let request = ClientRequest {
            socket_name: "europe/andorra".to_string(),
            route_req_id: "plan-1".to_string(),
            trip: ClientTrip::RoundTrip {
                start: (42.5, 1.5),
                bearing: 0.0,
                distance: 1000.0,
            },
        };

        let output = runner.run_client(&request, r#"{"highway":{}}"#).await.unwrap();

        assert!(output.success());
        assert_eq!(output.stdout, r#"{"highway":{}}"#);
    }

    #[tokio::test]
    async fn test_missing_binary_is_start_failure() {
        let runner = ProcessRunner::new("/nonexistent/ridi-router");
        let err = runner
            .prep_cache(Path::new("a"), Path::new("b"))
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::StartFailed(_)));
    }
}

//! [`Launcher`] backed by real OS processes.
//!
//! Spawns the built executable with `--port`, `--import-path` and
//! `--run-mode`, tees its output to our own stdout/stderr and waits for the
//! [`ReadinessDetector`] to fire.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::readiness::{ListenMarker, ReadinessDetector};
use super::{AppProcess, DEFAULT_STARTUP_TIMEOUT, Launcher, ProcessState, StartupError};
use crate::build::AppArtifact;

/// What the app is told about itself on the command line.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    /// Logical identity of the application (`--import-path`).
    pub import_path: String,
    /// Active run mode (`--run-mode`), e.g. `dev`.
    pub run_mode: String,
    /// Upper bound on the wait for the readiness marker.
    pub startup_timeout: Duration,
    /// Working directory for the child; inherits ours when `None`.
    pub working_dir: Option<PathBuf>,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            import_path: String::new(),
            run_mode: "dev".to_string(),
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            working_dir: None,
        }
    }
}

/// Launches apps as child processes of the harness.
#[derive(Clone)]
pub struct CommandLauncher {
    config: LaunchConfig,
    detector: Arc<dyn ReadinessDetector>,
}

impl std::fmt::Debug for CommandLauncher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandLauncher")
            .field("config", &self.config)
            .finish()
    }
}

impl CommandLauncher {
    pub fn new(config: LaunchConfig) -> Self {
        Self {
            config,
            detector: Arc::new(ListenMarker::default()),
        }
    }

    /// Replace the default `"listen"` marker.
    pub fn with_detector(mut self, detector: impl ReadinessDetector + 'static) -> Self {
        self.detector = Arc::new(detector);
        self
    }

    /// Command line used to run `artifact` on `port`.
    pub fn args(&self, port: u16) -> Vec<String> {
        vec![
            format!("--port={port}"),
            format!("--import-path={}", self.config.import_path),
            format!("--run-mode={}", self.config.run_mode),
        ]
    }

    fn command(&self, artifact: &AppArtifact, port: u16) -> Command {
        let mut cmd = Command::new(&artifact.executable_path);
        cmd.args(self.args(port));
        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }
        cmd.kill_on_drop(true);
        cmd
    }

    /// Run the app in the foreground with inherited stdio until it exits.
    ///
    /// Used when watching is disabled: build once, then hand the terminal to
    /// the app.
    pub async fn run(&self, artifact: &AppArtifact, port: u16) -> std::io::Result<ExitStatus> {
        let mut cmd = self.command(artifact, port);
        info!(
            path = %artifact.executable_path.display(),
            args = ?self.args(port),
            "exec app"
        );
        cmd.stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        cmd.status().await
    }
}

#[async_trait]
impl Launcher for CommandLauncher {
    async fn start(
        &self,
        artifact: &AppArtifact,
        port: u16,
    ) -> Result<Box<dyn AppProcess>, StartupError> {
        let mut cmd = self.command(artifact, port);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        info!(
            path = %artifact.executable_path.display(),
            args = ?self.args(port),
            "exec app"
        );

        let mut child = cmd.spawn().map_err(|source| StartupError::Spawn {
            path: artifact.executable_path.clone(),
            source,
        })?;

        let pid = child.id();
        let state = SharedState::new(ProcessState::Starting);
        let ready = CancellationToken::new();
        let kill = CancellationToken::new();
        // Kills the child if this future is dropped before it resolves.
        let abandoned = kill.clone().drop_guard();

        if let Some(stdout) = child.stdout.take() {
            tee(stdout, tokio::io::stdout(), Arc::clone(&self.detector), ready.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            tee(stderr, tokio::io::stderr(), Arc::clone(&self.detector), ready.clone());
        }

        // The child is reaped here, never in the foreground.
        let (exit_tx, exit_rx) = oneshot::channel::<String>();
        {
            let state = state.clone();
            let kill = kill.clone();
            tokio::spawn(async move {
                let status = tokio::select! {
                    status = child.wait() => status,
                    _ = kill.cancelled() => {
                        if let Err(e) = child.start_kill() {
                            warn!(?pid, error = %e, "failed to kill app process");
                        }
                        child.wait().await
                    }
                };
                let status = match status {
                    Ok(status) => status.to_string(),
                    Err(e) => format!("wait failed: {e}"),
                };
                debug!(?pid, %status, "app process exited");
                state.set(ProcessState::Terminated);
                let _ = exit_tx.send(status);
            });
        }

        let timeout = self.config.startup_timeout;
        tokio::select! {
            biased;

            _ = ready.cancelled() => {
                state.set(ProcessState::Ready);
                debug!(?pid, "app reported it is listening");
                state.set(ProcessState::Running);
                abandoned.disarm();
                let process: Box<dyn AppProcess> = Box::new(ChildProcess { pid, state, kill });
                Ok(process)
            }
            status = exit_rx => {
                let status = status.unwrap_or_else(|_| "unknown".to_string());
                error!(?pid, %status, "app died");
                Err(StartupError::ProcessDied { status })
            }
            _ = tokio::time::sleep(timeout) => {
                kill.cancel();
                state.set(ProcessState::Terminated);
                error!(?pid, timeout_secs = timeout.as_secs(), "app timed out");
                Err(StartupError::StartupTimeout { after: timeout })
            }
        }
    }
}

/// Longest unterminated line kept for matching across reads.
const MAX_PENDING_LINE: usize = 4096;

/// Copy child output to `sink` as it arrives, firing `ready` once the
/// detector accepts the current line.
///
/// The detector sees the line so far on every read, so a marker is caught
/// without waiting for its newline, even when it spans two reads.
fn tee<R, W>(
    mut source: R,
    mut sink: W,
    detector: Arc<dyn ReadinessDetector>,
    ready: CancellationToken,
) where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = [0u8; 8192];
        let mut line = Vec::new();
        loop {
            let n = match source.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    warn!(error = %e, "error reading app output");
                    break;
                }
            };
            let chunk = &buf[..n];

            if !ready.is_cancelled() {
                line.extend_from_slice(chunk);
                if detector.is_ready(&line) {
                    ready.cancel();
                    line = Vec::new();
                } else {
                    pending_line(&mut line);
                }
            }

            if sink.write_all(chunk).await.is_ok() {
                let _ = sink.flush().await;
            }
        }
    });
}

/// Drop everything up to the last newline, keeping at most
/// [`MAX_PENDING_LINE`] bytes of the unterminated tail.
fn pending_line(line: &mut Vec<u8>) {
    let start = match line.iter().rposition(|&b| b == b'\n') {
        Some(i) => i + 1,
        None => 0,
    };
    let start = start.max(line.len().saturating_sub(MAX_PENDING_LINE));
    line.drain(..start);
}

/// Process state shared between the handle and the reaper task.
#[derive(Clone)]
struct SharedState(Arc<Mutex<ProcessState>>);

impl SharedState {
    fn new(state: ProcessState) -> Self {
        Self(Arc::new(Mutex::new(state)))
    }

    fn get(&self) -> ProcessState {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set(&self, state: ProcessState) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }
}

/// Handle to an app started by [`CommandLauncher`].
pub struct ChildProcess {
    pid: Option<u32>,
    state: SharedState,
    kill: CancellationToken,
}

impl std::fmt::Debug for ChildProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildProcess")
            .field("pid", &self.pid)
            .field("state", &self.state.get())
            .finish()
    }
}

impl AppProcess for ChildProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn state(&self) -> ProcessState {
        self.state.get()
    }

    fn terminate(&self) {
        if !self.state.get().is_live() {
            return;
        }
        info!(pid = ?self.pid, "killing app process");
        self.state.set(ProcessState::Terminated);
        self.kill.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn script(dir: &Path, name: &str, body: &str) -> AppArtifact {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        AppArtifact::new(path)
    }

    fn launcher(timeout: Duration) -> CommandLauncher {
        CommandLauncher::new(LaunchConfig {
            import_path: "example.com/app".to_string(),
            run_mode: "dev".to_string(),
            startup_timeout: timeout,
            working_dir: None,
        })
    }

    #[test]
    fn args_encode_port_identity_and_mode() {
        let args = launcher(DEFAULT_STARTUP_TIMEOUT).args(9123);
        assert_eq!(
            args,
            vec![
                "--port=9123".to_string(),
                "--import-path=example.com/app".to_string(),
                "--run-mode=dev".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn start_succeeds_when_marker_printed() {
        let tmp = tempfile::tempdir().unwrap();
        let app = script(tmp.path(), "ready.sh", "echo 'Listening on :9000'\nexec sleep 30");

        let process = launcher(Duration::from_secs(5))
            .start(&app, 9000)
            .await
            .expect("app should become ready");
        assert_eq!(process.state(), ProcessState::Running);
        assert!(process.pid().is_some());

        process.terminate();
        assert_eq!(process.state(), ProcessState::Terminated);
        // Second call is a no-op.
        process.terminate();
    }

    #[tokio::test]
    async fn marker_on_stderr_counts() {
        let tmp = tempfile::tempdir().unwrap();
        let app = script(tmp.path(), "stderr.sh", "echo 'LISTEN ok' >&2\nexec sleep 30");

        let process = launcher(Duration::from_secs(5)).start(&app, 9000).await.unwrap();
        process.terminate();
    }

    #[tokio::test]
    async fn start_reports_process_died() {
        let tmp = tempfile::tempdir().unwrap();
        let app = script(tmp.path(), "dies.sh", "echo 'starting'\nexit 3");

        let err = launcher(Duration::from_secs(5))
            .start(&app, 9000)
            .await
            .err()
            .expect("start should fail");
        assert!(matches!(err, StartupError::ProcessDied { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn start_times_out_on_silent_app() {
        let tmp = tempfile::tempdir().unwrap();
        let app = script(tmp.path(), "silent.sh", "exec sleep 30");

        let err = launcher(Duration::from_millis(300))
            .start(&app, 9000)
            .await
            .err()
            .expect("start should time out");
        assert!(matches!(err, StartupError::StartupTimeout { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let app = AppArtifact::new("/nonexistent/path/to/app");
        let err = launcher(Duration::from_secs(1))
            .start(&app, 9000)
            .await
            .err()
            .expect("spawn should fail");
        assert!(matches!(err, StartupError::Spawn { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn custom_detector_is_used() {
        let tmp = tempfile::tempdir().unwrap();
        let app = script(tmp.path(), "custom.sh", "echo 'booted'\nexec sleep 30");

        let process = launcher(Duration::from_secs(5))
            .with_detector(ListenMarker::new("booted"))
            .start(&app, 9000)
            .await
            .unwrap();
        process.terminate();
    }

    #[tokio::test]
    async fn marker_without_newline_counts() {
        let tmp = tempfile::tempdir().unwrap();
        let app = script(tmp.path(), "partial.sh", "printf 'Listening on :9000'\nexec sleep 30");

        let process = launcher(Duration::from_secs(5))
            .start(&app, 9000)
            .await
            .expect("marker without a newline should be seen");
        process.terminate();
    }

    #[tokio::test]
    async fn marker_split_across_writes_counts() {
        let tmp = tempfile::tempdir().unwrap();
        let app = script(
            tmp.path(),
            "split.sh",
            "printf 'server lis'\nsleep 0.2\nprintf 'tening\\n'\nexec sleep 30",
        );

        let process = launcher(Duration::from_secs(5)).start(&app, 9000).await.unwrap();
        process.terminate();
    }

    #[test]
    fn pending_line_keeps_unterminated_tail() {
        let mut line = b"done\nserver lis".to_vec();
        pending_line(&mut line);
        assert_eq!(line, b"server lis");

        let mut line = vec![b'x'; MAX_PENDING_LINE + 10];
        pending_line(&mut line);
        assert_eq!(line.len(), MAX_PENDING_LINE);

        let mut line = b"complete\n".to_vec();
        pending_line(&mut line);
        assert!(line.is_empty());
    }

    fn alive(pid: &str) -> bool {
        std::process::Command::new("sh")
            .args(["-c", &format!("kill -0 {pid} 2>/dev/null")])
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    #[tokio::test]
    async fn abandoned_start_kills_child() {
        let tmp = tempfile::tempdir().unwrap();
        let pid_file = tmp.path().join("pid");
        let app = script(
            tmp.path(),
            "abandoned.sh",
            &format!("echo $$ > {}\nexec sleep 30", pid_file.display()),
        );

        let launcher = launcher(Duration::from_secs(30));
        let started =
            tokio::time::timeout(Duration::from_millis(300), launcher.start(&app, 9000)).await;
        assert!(started.is_err(), "silent app should still be starting");

        let pid = std::fs::read_to_string(&pid_file).unwrap().trim().to_string();
        for _ in 0..50 {
            if !alive(&pid) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("child {pid} outlived its abandoned start");
    }

    #[tokio::test]
    async fn run_returns_exit_status() {
        let tmp = tempfile::tempdir().unwrap();
        let app = script(tmp.path(), "exit.sh", "exit 7");

        let status = launcher(DEFAULT_STARTUP_TIMEOUT).run(&app, 9000).await.unwrap();
        assert_eq!(status.code(), Some(7));
    }
}

//! Shared test utilities for relay integration tests.
//!
//! Fakes for the three collaborators a [`Harness`] drives:
//! - [`FakeWatcher`]: change flag set by the test.
//! - [`FakeBuilder`]: scripted build results, counts invocations.
//! - [`FakeLauncher`]: hands out [`FakeProcess`]es and tracks how many are
//!   live at once. Optionally serves a tiny app on the backend port so
//!   requests can be proxied end to end.
//!
//! Plus helpers for writing executable scripts into a temp dir.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::http::Uri;
use tokio::sync::OnceCell;

use relay_core::{
    AppArtifact, AppProcess, Builder, CompileError, Harness, HarnessConfig, Launcher,
    ProcessState, StartupError, Watcher,
};

// ---------------------------------------------------------------------------
// Watcher
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct FakeWatcher {
    dirty: AtomicBool,
    polls: AtomicUsize,
}

impl FakeWatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The next poll reports a change.
    pub fn touch(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Watcher for FakeWatcher {
    async fn changed(&self) -> bool {
        self.polls.fetch_add(1, Ordering::SeqCst);
        self.dirty.swap(false, Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// What the next `build` call does.
#[derive(Debug)]
pub enum BuildStep {
    Succeed,
    Fail(CompileError),
    Panic,
}

/// Succeeds by default; queue failures with [`FakeBuilder::push`].
#[derive(Debug, Default)]
pub struct FakeBuilder {
    steps: Mutex<VecDeque<BuildStep>>,
    calls: AtomicUsize,
    delay: Option<Duration>,
    artifact: Option<PathBuf>,
    flags_seen: Mutex<Vec<Vec<String>>>,
}

impl FakeBuilder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every build sleeps for `delay` before returning.
    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay: Some(delay),
            ..Self::default()
        })
    }

    /// Successful builds hand back `path` instead of a dummy executable.
    pub fn producing(path: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            artifact: Some(path.into()),
            ..Self::default()
        })
    }

    pub fn push(&self, step: BuildStep) {
        self.steps.lock().unwrap().push_back(step);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn flags_seen(&self) -> Vec<Vec<String>> {
        self.flags_seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Builder for FakeBuilder {
    async fn build(&self, flags: &[String]) -> Result<AppArtifact, CompileError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.flags_seen.lock().unwrap().push(flags.to_vec());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let step = self
            .steps
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(BuildStep::Succeed);
        match step {
            BuildStep::Succeed => Ok(AppArtifact::new(
                self.artifact
                    .clone()
                    .unwrap_or_else(|| PathBuf::from("/bin/fake-app")),
            )),
            BuildStep::Fail(err) => Err(err),
            BuildStep::Panic => panic!("fake builder panicked"),
        }
    }
}

/// The compile error used throughout the harness tests.
pub fn controller_error() -> CompileError {
    CompileError::new("Go Compilation Error", "undefined: Foo")
        .with_source_type("Go code")
        .with_location("app/controller.go", 42)
}

// ---------------------------------------------------------------------------
// Launcher
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Counters {
    starts: AtomicUsize,
    live: AtomicUsize,
    max_live: AtomicUsize,
}

#[derive(Debug)]
pub struct FakeProcess {
    pid: u32,
    state: Mutex<ProcessState>,
    counters: Arc<Counters>,
}

impl AppProcess for FakeProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn state(&self) -> ProcessState {
        *self.state.lock().unwrap()
    }

    fn terminate(&self) {
        let mut state = self.state.lock().unwrap();
        if state.is_live() {
            *state = ProcessState::Terminated;
            self.counters.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Succeeds by default; queue failures with [`FakeLauncher::fail_next`].
#[derive(Debug, Default)]
pub struct FakeLauncher {
    counters: Arc<Counters>,
    failures: Mutex<VecDeque<StartupError>>,
    ports: Mutex<Vec<u16>>,
    serve_app: bool,
    app: OnceCell<()>,
}

impl FakeLauncher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Also serve [`echo_app`] on the backend port, started on first launch
    /// and kept for the life of the launcher.
    pub fn serving() -> Arc<Self> {
        Arc::new(Self {
            serve_app: true,
            ..Self::default()
        })
    }

    pub fn fail_next(&self, err: StartupError) {
        self.failures.lock().unwrap().push_back(err);
    }

    pub fn starts(&self) -> usize {
        self.counters.starts.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> usize {
        self.counters.live.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously live processes ever observed.
    pub fn max_live(&self) -> usize {
        self.counters.max_live.load(Ordering::SeqCst)
    }

    pub fn ports(&self) -> Vec<u16> {
        self.ports.lock().unwrap().clone()
    }
}

#[async_trait]
impl Launcher for FakeLauncher {
    async fn start(
        &self,
        artifact: &AppArtifact,
        port: u16,
    ) -> Result<Box<dyn AppProcess>, StartupError> {
        assert_eq!(artifact.listen_port, Some(port));
        let n = self.counters.starts.fetch_add(1, Ordering::SeqCst) + 1;
        self.ports.lock().unwrap().push(port);

        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            return Err(err);
        }

        if self.serve_app {
            self.app
                .get_or_init(|| async move {
                    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
                        .await
                        .expect("bind fake app port");
                    tokio::spawn(async move {
                        axum::serve(listener, echo_app()).await.ok();
                    });
                })
                .await;
        }

        let live = self.counters.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.max_live.fetch_max(live, Ordering::SeqCst);

        Ok(Box::new(FakeProcess {
            pid: 10_000 + n as u32,
            state: Mutex::new(ProcessState::Running),
            counters: Arc::clone(&self.counters),
        }))
    }
}

/// App that answers every request with `app: <path>`.
pub fn echo_app() -> Router {
    Router::new().fallback(|uri: Uri| async move { format!("app: {}", uri.path()) })
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// A harness wired to fakes, with handles to inspect them.
pub struct TestHarness {
    pub harness: Arc<Harness>,
    pub watcher: Arc<FakeWatcher>,
    pub builder: Arc<FakeBuilder>,
    pub launcher: Arc<FakeLauncher>,
}

impl TestHarness {
    pub fn new(builder: Arc<FakeBuilder>, launcher: Arc<FakeLauncher>) -> Self {
        Self::with_config(HarnessConfig::default(), builder, launcher)
    }

    pub fn with_config(
        config: HarnessConfig,
        builder: Arc<FakeBuilder>,
        launcher: Arc<FakeLauncher>,
    ) -> Self {
        let watcher = FakeWatcher::new();
        let config = HarnessConfig {
            listen_addr: "127.0.0.1".to_string(),
            ..config
        };
        let harness = Harness::new(
            config,
            watcher.clone(),
            builder.clone(),
            launcher.clone(),
        )
        .expect("harness should construct");
        Self {
            harness: Arc::new(harness),
            watcher,
            builder,
            launcher,
        }
    }
}

// ---------------------------------------------------------------------------
// Scripts
// ---------------------------------------------------------------------------

/// Write an executable `sh` script into `dir`.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("chmod script");
    }
    path
}

/// Scratch directory removed on drop.
pub fn scratch_dir() -> tempfile::TempDir {
    tempfile::tempdir().expect("create temp dir")
}

//! The harness: rebuild on change, then proxy.
//!
//! # Per-request flow
//!
//! ```text
//! Idle --request--> CheckChanges
//! CheckChanges --no change--> Forward
//! CheckChanges --change-----> Rebuild
//! Rebuild --build fails--> RenderError --> Idle
//! Rebuild --build ok-----> Restart
//! Restart --start fails--> RenderError --> Idle
//! Restart --ready--------> Forward --> Idle
//! ```
//!
//! The check/rebuild/restart section is single-flight: [`HarnessState`] sits
//! behind an async mutex, so concurrent requests wait for the refresh in
//! progress and then see its outcome.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::build::{Builder, CompileError};
use crate::config::{self, HarnessConfig};
use crate::process::{AppProcess, Launcher};
use crate::proxy::{Backend, Proxy};
use crate::render::{self, Format};
use crate::watch::Watcher;

/// Why a refresh did not leave a ready app behind.
#[derive(Debug, thiserror::Error)]
pub enum RefreshError {
    /// The build or startup failed; the error is shown to the developer.
    #[error("{0}")]
    Failed(Box<CompileError>),

    /// The builder, or the refresh around it, panicked. The harness cannot
    /// continue.
    #[error("builder panicked; harness is shutting down")]
    BuilderPanicked,
}

/// Mutable state, only touched while the refresh lock is held.
struct HarnessState {
    last_error: Option<CompileError>,
    active: Option<Box<dyn AppProcess>>,
    force_refresh: bool,
}

pub struct Harness {
    config: HarnessConfig,
    proxy: Proxy,
    refresher: Arc<Refresher>,
}

/// The check/rebuild/restart section and everything it touches.
///
/// Each refresh runs on its own task, so it completes and records its
/// outcome even when the request that started it goes away.
struct Refresher {
    watcher: Arc<dyn Watcher>,
    builder: Arc<dyn Builder>,
    launcher: Arc<dyn Launcher>,
    build_flags: Vec<String>,
    port: u16,
    state: Mutex<HarnessState>,
    /// Mirrors `last_error.is_some()` so the favicon check skips the lock.
    error_active: AtomicBool,
    fatal: CancellationToken,
}

impl std::fmt::Debug for Harness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Harness")
            .field("listen", &self.config.listen_address())
            .field("backend", self.proxy.backend())
            .finish_non_exhaustive()
    }
}

impl Harness {
    /// Create a harness. Picks the backend port now if none is configured;
    /// it stays fixed for the lifetime of the harness.
    pub fn new(
        config: HarnessConfig,
        watcher: Arc<dyn Watcher>,
        builder: Arc<dyn Builder>,
        launcher: Arc<dyn Launcher>,
    ) -> Result<Self> {
        let port = match config.backend_port {
            Some(port) => port,
            None => config::free_port()?,
        };
        let backend = Backend {
            host: config.backend_host(),
            port,
            tls: config.tls_enabled(),
        };
        let proxy = Proxy::new(backend)?;
        let refresher = Arc::new(Refresher {
            watcher,
            builder,
            launcher,
            build_flags: config.build_flags.clone(),
            port,
            state: Mutex::new(HarnessState {
                last_error: None,
                active: None,
                force_refresh: true,
            }),
            error_active: AtomicBool::new(false),
            fatal: CancellationToken::new(),
        });

        Ok(Self {
            config,
            proxy,
            refresher,
        })
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn backend(&self) -> &Backend {
        self.proxy.backend()
    }

    /// Fires when the harness hit an unrecoverable error.
    pub fn fatal_signal(&self) -> CancellationToken {
        self.refresher.fatal.clone()
    }

    /// Serve one developer request.
    pub async fn handle(&self, req: Request<Body>) -> Response {
        if self.refresher.error_active.load(Ordering::Acquire)
            && req.method() == Method::GET
            && req.uri().path() == "/favicon.ico"
        {
            return StatusCode::OK.into_response();
        }

        match self.refresh().await {
            Ok(()) => self.proxy.forward(req).await,
            Err(RefreshError::Failed(err)) => {
                render::error_response(&err, Format::negotiate(req.headers()))
            }
            Err(RefreshError::BuilderPanicked) => render::plain_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal harness error.",
            ),
        }
    }

    /// Rebuild and restart the app if anything changed since the last build.
    ///
    /// Polls the watcher exactly once. Without a change this returns the
    /// outcome of the previous attempt.
    pub async fn refresh(&self) -> Result<(), RefreshError> {
        let refresher = Arc::clone(&self.refresher);
        match tokio::spawn(async move { refresher.run().await }).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = %e, "refresh task failed");
                self.refresher.fatal.cancel();
                Err(RefreshError::BuilderPanicked)
            }
        }
    }

    /// Terminate the running app, if any.
    pub async fn shutdown(&self) {
        let mut state = self.refresher.state.lock().await;
        if let Some(process) = state.active.take() {
            process.terminate();
        }
    }
}

impl Refresher {
    async fn run(&self) -> Result<(), RefreshError> {
        let mut state = self.state.lock().await;
        if self.fatal.is_cancelled() {
            return Err(RefreshError::BuilderPanicked);
        }

        let changed = self.watcher.changed().await;
        if !changed && !state.force_refresh {
            return match &state.last_error {
                Some(err) => Err(RefreshError::Failed(Box::new(err.clone()))),
                None => Ok(()),
            };
        }
        state.force_refresh = false;

        if let Some(process) = state.active.take() {
            process.terminate();
        }

        info!("rebuilding app");
        let builder = Arc::clone(&self.builder);
        let flags = self.build_flags.clone();
        let built = tokio::spawn(async move { builder.build(&flags).await }).await;
        let artifact = match built {
            Ok(Ok(artifact)) => artifact,
            Ok(Err(err)) => {
                warn!(error = %err, "build failed");
                return Err(self.record_failure(&mut state, err));
            }
            Err(e) => {
                error!(error = %e, "builder panicked");
                self.fatal.cancel();
                return Err(RefreshError::BuilderPanicked);
            }
        };

        let artifact = artifact.on_port(self.port);
        match self.launcher.start(&artifact, self.port).await {
            Ok(process) => {
                info!(pid = ?process.pid(), port = self.port, "app is ready");
                state.active = Some(process);
                state.last_error = None;
                self.error_active.store(false, Ordering::Release);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "app failed to start");
                Err(self.record_failure(&mut state, CompileError::startup_failure(&e)))
            }
        }
    }

    fn record_failure(&self, state: &mut HarnessState, err: CompileError) -> RefreshError {
        state.last_error = Some(err.clone());
        self.error_active.store(true, Ordering::Release);
        RefreshError::Failed(Box::new(err))
    }
}

//! Process supervision for the application under development.
//!
//! # Architecture
//!
//! ```text
//! Harness
//!     |
//!     v
//! Launcher --start(artifact, port)--> Box<dyn AppProcess>
//!     |          |
//!     |          +-- races: exited | timeout | ReadinessDetector fired
//!     |
//!     |   AppProcess::terminate()   (fire-and-forget)
//!     |   AppProcess::state()
//! ```
//!
//! [`CommandLauncher`] is the real implementation backed by
//! `tokio::process`; tests substitute their own [`Launcher`].

pub mod command;
pub mod readiness;

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

use crate::build::AppArtifact;

pub use command::{ChildProcess, CommandLauncher, LaunchConfig};
pub use readiness::{ListenMarker, ReadinessDetector};

/// How long a freshly started app may take to print its readiness marker.
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Lifecycle of one supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    NotStarted,
    Starting,
    Ready,
    Running,
    Terminated,
}

impl ProcessState {
    /// `true` until the process has been terminated or has exited.
    pub fn is_live(self) -> bool {
        !matches!(self, Self::NotStarted | Self::Terminated)
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotStarted => "not_started",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// Why a built app did not become ready.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("failed to exec {path}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("app died before it was ready ({status})")]
    ProcessDied { status: String },

    #[error("app timed out after {}s without reporting it was listening", after.as_secs())]
    StartupTimeout { after: Duration },
}

/// A running (or recently running) application process.
pub trait AppProcess: Send + Sync {
    /// OS process id, if the process was started.
    fn pid(&self) -> Option<u32>;

    fn state(&self) -> ProcessState;

    /// Request termination without waiting for the process to exit.
    ///
    /// Idempotent; a no-op once the process has exited.
    fn terminate(&self);
}

/// Starts application processes and waits for them to become ready.
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Launch `artifact` listening on `port`, returning once it is ready.
    async fn start(
        &self,
        artifact: &AppArtifact,
        port: u16,
    ) -> Result<Box<dyn AppProcess>, StartupError>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn Launcher, _: &dyn AppProcess) {}
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_started_states_are_live() {
        assert!(!ProcessState::NotStarted.is_live());
        assert!(ProcessState::Starting.is_live());
        assert!(ProcessState::Ready.is_live());
        assert!(ProcessState::Running.is_live());
        assert!(!ProcessState::Terminated.is_live());
    }

    #[test]
    fn startup_errors_render_readably() {
        let died = StartupError::ProcessDied {
            status: "exit status: 1".to_string(),
        };
        assert_eq!(died.to_string(), "app died before it was ready (exit status: 1)");

        let timeout = StartupError::StartupTimeout {
            after: Duration::from_secs(30),
        };
        assert!(timeout.to_string().contains("timed out after 30s"));
    }
}

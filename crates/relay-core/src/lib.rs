//! Rebuild-on-change development harness.
//!
//! The harness sits between the developer's browser and the application
//! under development. Every inbound request first asks the [`watch::Watcher`]
//! whether the source tree changed; if so the running app is killed, the
//! [`build::Builder`] is invoked, and a fresh process is started through the
//! [`process::Launcher`]. Only then is the request forwarded by the
//! [`proxy::Proxy`]. Build and startup failures are rendered in-band by
//! [`render`].
//!
//! ```text
//! client --> Harness::handle
//!              |  watcher.changed()?
//!              |     yes: kill -> build -> start (single-flight)
//!              |     err: render::error_response
//!              v
//!            Proxy --plain--> reqwest --> backend
//!                  --upgrade--> raw tunnel --> backend
//! ```

pub mod build;
pub mod config;
pub mod harness;
pub mod process;
pub mod proxy;
pub mod render;
pub mod server;
pub mod tls;
pub mod watch;

pub use build::{AppArtifact, Builder, CompileError};
pub use config::HarnessConfig;
pub use harness::Harness;
pub use process::{AppProcess, Launcher, ProcessState, StartupError};
pub use watch::Watcher;

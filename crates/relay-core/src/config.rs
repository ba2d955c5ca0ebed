//! Runtime configuration of a [`crate::Harness`].
//!
//! Loading it from disk is the CLI's job; this is the already-resolved form.

use std::net::TcpListener;
use std::path::PathBuf;

use anyhow::{Context, Result};

/// PEM files for serving the developer-facing side over TLS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsConfig {
    pub cert: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Address the harness listens on. Empty means all interfaces.
    pub listen_addr: String,
    pub listen_port: u16,
    /// Serve the harness over TLS; the backend scheme follows this setting.
    pub tls: Option<TlsConfig>,
    /// Host the app is reached on. Defaults to `listen_addr`, or
    /// `localhost` when that is the wildcard address.
    pub backend_host: Option<String>,
    /// Fixed backend port. A free port is picked when `None`.
    pub backend_port: Option<u16>,
    /// Extra flags handed to every [`crate::Builder::build`] call.
    pub build_flags: Vec<String>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            listen_addr: String::new(),
            listen_port: 9000,
            tls: None,
            backend_host: None,
            backend_port: None,
            build_flags: Vec::new(),
        }
    }
}

impl HarnessConfig {
    pub fn tls_enabled(&self) -> bool {
        self.tls.is_some()
    }

    /// `host:port` the harness binds to.
    pub fn listen_address(&self) -> String {
        let host = if self.listen_addr.is_empty() {
            "0.0.0.0"
        } else {
            self.listen_addr.as_str()
        };
        format!("{host}:{}", self.listen_port)
    }

    pub fn backend_host(&self) -> String {
        match &self.backend_host {
            Some(host) => host.clone(),
            None if self.listen_addr.is_empty() || self.listen_addr == "0.0.0.0" => {
                "localhost".to_string()
            }
            None => self.listen_addr.clone(),
        }
    }
}

/// Find an unused TCP port by binding `:0` and releasing it again.
pub fn free_port() -> Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0").context("failed to bind a free port")?;
    let port = listener
        .local_addr()
        .context("failed to read back the free port")?
        .port();
    drop(listener);
    Ok(port)
}

//! Project configuration for relay.
//!
//! Read from `relay.toml` in the project root (or `--config`), with a
//! resolution chain: CLI flag > env var > config file > default.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use relay_core::config::TlsConfig;
use relay_core::process::{DEFAULT_STARTUP_TIMEOUT, LaunchConfig};
use relay_core::watch::{NotifyWatcher, WatchFilter};
use relay_core::HarnessConfig;

/// Name of the project config file.
pub const CONFIG_FILE: &str = "relay.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("{var}={value:?} is not a valid port")]
    InvalidPort { var: &'static str, value: String },

    #[error("failed to resolve project directory {path}: {source}")]
    Project {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub app: AppSection,
    pub http: HttpSection,
    pub harness: HarnessSection,
    pub watch: WatchSection,
    pub build: BuildSection,
    pub error: ErrorSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
    /// Identity passed to the app as `--import-path`.
    pub import_path: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct HttpSection {
    pub addr: Option<String>,
    pub port: Option<u16>,
    pub tls: Option<TlsSection>,
}

#[derive(Debug, Deserialize)]
pub struct TlsSection {
    pub cert: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct HarnessSection {
    /// Fixed backend port; a free one is picked when unset.
    pub port: Option<u16>,
    pub startup_timeout_secs: Option<u64>,
    pub build_flags: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WatchSection {
    pub enabled: bool,
    /// Roots to watch, relative to the project.
    pub paths: Vec<PathBuf>,
    #[serde(flatten)]
    pub filter: WatchFilter,
    pub debounce_ms: Option<u64>,
}

impl Default for WatchSection {
    fn default() -> Self {
        Self {
            enabled: true,
            paths: vec![PathBuf::from(".")],
            filter: WatchFilter::default(),
            debounce_ms: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct BuildSection {
    pub command: String,
    pub args: Vec<String>,
    /// Built executable, relative to the project. Defaults to
    /// `target/debug/<app name>`.
    pub output: Option<PathBuf>,
}

impl Default for BuildSection {
    fn default() -> Self {
        Self {
            command: "cargo".to_string(),
            args: vec!["build".to_string()],
            output: None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ErrorSection {
    /// Link template with `{{Path}}` and `{{Line}}` placeholders.
    pub link: Option<String>,
}

/// Load `path`. A missing file is only an error when `required`.
pub fn load_config(path: &Path, required: bool) -> Result<Option<ConfigFile>, ConfigError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound && !required => return Ok(None),
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    toml::from_str(&contents)
        .map(Some)
        .map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Values given on the command line.
#[derive(Debug, Default, Clone)]
pub struct CliOverrides {
    pub project: Option<PathBuf>,
    pub mode: Option<String>,
    pub port: Option<u16>,
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct WatchSettings {
    pub enabled: bool,
    pub roots: Vec<PathBuf>,
    pub filter: WatchFilter,
    pub debounce: Duration,
}

#[derive(Debug, Clone)]
pub struct BuildSettings {
    pub command: String,
    pub args: Vec<String>,
    pub output: PathBuf,
    pub link: Option<String>,
}

/// Fully resolved configuration, ready for use.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub project: PathBuf,
    pub app_name: String,
    pub harness: HarnessConfig,
    pub launch: LaunchConfig,
    pub watch: WatchSettings,
    pub build: BuildSettings,
}

impl RelayConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config file > default.
    ///
    /// - listen port: `--port` > `RELAY_PORT` > `http.port` > 9000
    /// - listen addr: `RELAY_ADDR` > `http.addr` > all interfaces
    /// - run mode: `--mode` > `RELAY_RUN_MODE` > `dev`
    /// - backend port: `RELAY_BACKEND_PORT` > `harness.port` > free port
    pub fn resolve(cli: &CliOverrides) -> Result<Self, ConfigError> {
        let project = cli.project.clone().unwrap_or_else(|| PathBuf::from("."));
        let file = match &cli.config {
            Some(path) => load_config(path, true)?,
            None => load_config(&project.join(CONFIG_FILE), false)?,
        };
        Self::resolve_with(cli, file.unwrap_or_default(), |var| std::env::var(var).ok())
    }

    pub fn resolve_with(
        cli: &CliOverrides,
        file: ConfigFile,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let project = project_dir(cli)?;

        let listen_port = match cli.port {
            Some(port) => port,
            None => match env_port(&env, "RELAY_PORT")? {
                Some(port) => port,
                None => file.http.port.unwrap_or(9000),
            },
        };
        let backend_port = match env_port(&env, "RELAY_BACKEND_PORT")? {
            Some(port) => Some(port),
            None => file.harness.port,
        };
        let listen_addr = env("RELAY_ADDR")
            .or(file.http.addr)
            .unwrap_or_default();
        let run_mode = cli
            .mode
            .clone()
            .or_else(|| env("RELAY_RUN_MODE"))
            .unwrap_or_else(|| "dev".to_string());

        let app_name = file
            .app
            .name
            .clone()
            .unwrap_or_else(|| dir_name(&project));
        let import_path = file.app.import_path.unwrap_or_else(|| app_name.clone());

        let harness = HarnessConfig {
            listen_addr,
            listen_port,
            tls: file.http.tls.map(|tls| TlsConfig {
                cert: project.join(tls.cert),
                key: project.join(tls.key),
            }),
            backend_host: None,
            backend_port,
            build_flags: file.harness.build_flags,
        };
        let launch = LaunchConfig {
            import_path,
            run_mode,
            startup_timeout: file
                .harness
                .startup_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_STARTUP_TIMEOUT),
            working_dir: Some(project.clone()),
        };
        let watch = WatchSettings {
            enabled: file.watch.enabled,
            roots: file.watch.paths.iter().map(|p| project.join(p)).collect(),
            filter: file.watch.filter,
            debounce: file
                .watch
                .debounce_ms
                .map(Duration::from_millis)
                .unwrap_or(NotifyWatcher::DEFAULT_DEBOUNCE),
        };
        let build = BuildSettings {
            command: file.build.command,
            args: file.build.args,
            output: file
                .build
                .output
                .unwrap_or_else(|| Path::new("target/debug").join(&app_name)),
            link: file.error.link,
        };

        Ok(Self {
            project,
            app_name,
            harness,
            launch,
            watch,
            build,
        })
    }
}

fn env_port(
    env: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<u16>, ConfigError> {
    match env(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidPort { var, value }),
    }
}

/// The project directory as an absolute path.
///
/// Build outputs and the child's working directory are both derived from
/// it, so a relative path would be resolved twice.
fn project_dir(cli: &CliOverrides) -> Result<PathBuf, ConfigError> {
    let project = cli.project.clone().unwrap_or_else(|| PathBuf::from("."));
    std::path::absolute(&project).map_err(|source| ConfigError::Project {
        path: project,
        source,
    })
}

fn dir_name(project: &Path) -> String {
    std::fs::canonicalize(project)
        .ok()
        .as_deref()
        .unwrap_or(project)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "app".to_string())
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------

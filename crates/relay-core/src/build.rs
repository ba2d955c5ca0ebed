//! Builder contract: the opaque step that turns source into a runnable app.

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::Serialize;

use crate::process::StartupError;

/// Number of source lines shown on either side of the failing line.
const CONTEXT_LINES: usize = 5;

/// A successfully built application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppArtifact {
    /// Path to the executable produced by the build.
    pub executable_path: PathBuf,
    /// Port the app will be told to listen on. Filled in by the harness.
    pub listen_port: Option<u16>,
}

impl AppArtifact {
    pub fn new(executable_path: impl Into<PathBuf>) -> Self {
        Self {
            executable_path: executable_path.into(),
            listen_port: None,
        }
    }

    /// A copy of this artifact bound to `port`.
    pub fn on_port(&self, port: u16) -> Self {
        Self {
            executable_path: self.executable_path.clone(),
            listen_port: Some(port),
        }
    }
}

/// Structured description of a failed build or a failed startup.
///
/// Produced once per failed attempt and consumed only by [`crate::render`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompileError {
    /// HTTP status the rendered page is served with.
    pub status: u16,
    /// Symbolic kind, e.g. `compilation_error`.
    pub name: String,
    /// What kind of source failed, e.g. "Rust code".
    pub source_type: String,
    pub title: String,
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Path of the offending file as reported by the compiler.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// 1-based line number within `path`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
    /// Full contents of `path`, one entry per line, when it could be read.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub source_lines: Vec<String>,
    /// Editor/browser link to the failing location.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    /// Set when the source file itself could not be read.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta_error: Option<String>,
}

/// One line of the excerpt shown around the error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceLine {
    pub number: usize,
    pub text: String,
    pub is_error: bool,
}

impl CompileError {
    pub const STARTUP_TITLE: &str = "App failed to start up";

    /// A compile error with a title and one-line summary; everything else
    /// is filled in with the `with_*` methods.
    pub fn new(title: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            status: 500,
            name: "compilation_error".to_string(),
            source_type: "code".to_string(),
            title: title.into(),
            summary: summary.into(),
            description: None,
            path: None,
            line: None,
            source_lines: Vec::new(),
            link: None,
            meta_error: None,
        }
    }

    /// The page shown when the app built but never became ready.
    pub fn startup_failure(err: &StartupError) -> Self {
        Self {
            name: "startup_error".to_string(),
            description: Some(startup_hint(err).to_string()),
            ..Self::new(Self::STARTUP_TITLE, err.to_string())
        }
    }

    pub fn with_source_type(mut self, source_type: impl Into<String>) -> Self {
        self.source_type = source_type.into();
        self
    }

    pub fn with_location(mut self, path: impl Into<String>, line: usize) -> Self {
        self.path = Some(path.into());
        self.line = Some(line);
        self
    }

    pub fn with_source_lines(mut self, lines: Vec<String>) -> Self {
        self.source_lines = lines;
        self
    }

    pub fn with_meta_error(mut self, meta: impl Into<String>) -> Self {
        self.meta_error = Some(meta.into());
        self
    }

    /// Build the link from a template containing `{{Path}}` and `{{Line}}`.
    ///
    /// Does nothing for errors without a location.
    pub fn with_link(mut self, template: &str) -> Self {
        if let (Some(path), Some(line)) = (&self.path, self.line) {
            let link = template
                .replace("{{Path}}", path)
                .replace("{{Line}}", &line.to_string());
            self.link = Some(link);
        }
        self
    }

    /// Lines surrounding the error line, clamped to the file.
    pub fn context_source(&self) -> Vec<SourceLine> {
        let Some(line) = self.line else {
            return Vec::new();
        };
        if self.source_lines.is_empty() || line == 0 {
            return Vec::new();
        }

        let start = line.saturating_sub(CONTEXT_LINES).max(1);
        let end = (line + CONTEXT_LINES).min(self.source_lines.len());

        (start..=end)
            .filter_map(|number| {
                self.source_lines.get(number - 1).map(|text| SourceLine {
                    number,
                    text: text.clone(),
                    is_error: number == line,
                })
            })
            .collect()
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.path, self.line) {
            (Some(path), Some(line)) => write!(f, "{}: {}:{}: {}", self.title, path, line, self.summary),
            _ => write!(f, "{}: {}", self.title, self.summary),
        }
    }
}

impl std::error::Error for CompileError {}

/// The opaque build step.
///
/// Implementations compile the user's application and either hand back the
/// executable or a structured [`CompileError`]. A panic inside `build` is
/// treated as fatal by the harness.
#[async_trait]
pub trait Builder: Send + Sync {
    async fn build(&self, flags: &[String]) -> Result<AppArtifact, CompileError>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn Builder) {}
};

/// What the developer should look at after a failed startup.
fn startup_hint(err: &StartupError) -> &'static str {
    match err {
        StartupError::Spawn { .. } => "The built executable could not be started.",
        StartupError::ProcessDied { .. } => {
            "The app exited during startup. Check its console output."
        }
        StartupError::StartupTimeout { .. } => {
            "The app never reported that it was listening. Check its console output."
        }
    }
}

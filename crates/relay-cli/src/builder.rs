//! [`Builder`] that shells out to the project's build command.
//!
//! On failure the first compiler diagnostic in the output is turned into a
//! [`CompileError`] pointing at the offending file and line.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;
use tracing::{error, info};

use relay_core::{AppArtifact, Builder, CompileError};

/// Summary shown when the output contains no recognisable diagnostic.
pub const UNPARSED_SUMMARY: &str = "See console for build error.";

/// `error[E0425]: message` followed by ` --> path:line:col`.
static RUSTC_DIAGNOSTIC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^error(?:\[\w+\])?: (.*)\n\s*--> ([^:\n]+):(\d+):\d+").expect("valid regex")
});

/// `path:line:[col:] message`.
static FILE_LINE_COL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^([^:#\n]+):(\d+):(\d+:)? (.*)$").expect("valid regex")
});

/// Looser `path:line: message`.
static FILE_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^(.*?):(\d+):\s(.*?)$").expect("valid regex"));

/// Runs `command args.. flags..` in the project directory.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    project: PathBuf,
    command: String,
    args: Vec<String>,
    /// Executable produced by a successful build, relative to `project`.
    output: PathBuf,
    /// Editor link template with `{{Path}}` and `{{Line}}` placeholders.
    link: Option<String>,
}

impl CommandBuilder {
    pub fn new(
        project: impl Into<PathBuf>,
        command: impl Into<String>,
        args: Vec<String>,
        output: impl Into<PathBuf>,
    ) -> Self {
        Self {
            project: project.into(),
            command: command.into(),
            args,
            output: output.into(),
            link: None,
        }
    }

    pub fn with_link(mut self, template: Option<String>) -> Self {
        self.link = template;
        self
    }

    pub fn artifact_path(&self) -> PathBuf {
        self.project.join(&self.output)
    }

    /// Turn failed build output into a [`CompileError`].
    pub fn compile_error(&self, output: &str) -> CompileError {
        let Some(diagnostic) = Diagnostic::parse(output) else {
            error!(output, "failed to parse build errors");
            return CompileError::new("Compilation Error", UNPARSED_SUMMARY);
        };
        error!(output, "build errors");

        let mut err = CompileError::new(diagnostic.title(), diagnostic.summary.clone())
            .with_source_type(diagnostic.source_type())
            .with_location(&diagnostic.path, diagnostic.line);
        if let Some(template) = &self.link {
            err = err.with_link(template);
        }

        let source = self.project.join(&diagnostic.path);
        match read_lines(&source) {
            Ok(lines) => err.with_source_lines(lines),
            Err(e) => {
                let meta = format!("{}: {e}", source.display());
                error!(error = %meta, "failed to read source of compile error");
                err.with_meta_error(meta)
            }
        }
    }
}

#[async_trait]
impl Builder for CommandBuilder {
    async fn build(&self, flags: &[String]) -> Result<AppArtifact, CompileError> {
        info!(command = %self.command, args = ?self.args, ?flags, "building app");
        let output = Command::new(&self.command)
            .args(&self.args)
            .args(flags)
            .current_dir(&self.project)
            .output()
            .await
            .map_err(|e| {
                CompileError::new(
                    "Build Error",
                    format!("failed to run {}: {e}", self.command),
                )
            })?;

        if output.status.success() {
            return Ok(AppArtifact::new(self.artifact_path()));
        }

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        eprint!("{combined}");
        Err(self.compile_error(&combined))
    }
}

/// First diagnostic found in compiler output.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Diagnostic {
    path: String,
    line: usize,
    summary: String,
    rustc: bool,
}

impl Diagnostic {
    fn parse(output: &str) -> Option<Self> {
        if let Some(caps) = RUSTC_DIAGNOSTIC.captures(output) {
            return Some(Self {
                path: caps[2].trim().to_string(),
                line: caps[3].parse().ok()?,
                summary: caps[1].to_string(),
                rustc: true,
            });
        }
        let (path, line, summary) = match FILE_LINE_COL.captures(output) {
            Some(caps) => (caps[1].to_string(), caps[2].to_string(), caps[4].to_string()),
            None => {
                let caps = FILE_LINE.captures(output)?;
                (caps[1].to_string(), caps[2].to_string(), caps[3].to_string())
            }
        };
        Some(Self {
            path: path.trim().to_string(),
            line: line.parse().ok()?,
            summary,
            rustc: false,
        })
    }

    fn title(&self) -> &'static str {
        if self.rustc {
            "Rust Compilation Error"
        } else {
            "Compilation Error"
        }
    }

    fn source_type(&self) -> &'static str {
        if self.rustc { "Rust code" } else { "code" }
    }
}

fn read_lines(path: &Path) -> std::io::Result<Vec<String>> {
    let contents = std::fs::read_to_string(path)?;
    Ok(contents.lines().map(str::to_string).collect())
}

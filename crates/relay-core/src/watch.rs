//! Watcher contract and its `notify` integration.
//!
//! The harness polls [`Watcher::changed`] exactly once per inbound request.
//! A `true` answer carries no payload: it only means "rebuild".

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use serde::Deserialize;
use tracing::{debug, warn};

/// Answers "has anything relevant changed since the last call?".
#[async_trait]
pub trait Watcher: Send + Sync {
    /// Returns `true` at most once per burst of changes and resets.
    async fn changed(&self) -> bool;
}

const _: () = {
    fn _assert_object_safe(_: &dyn Watcher) {}
};

/// Which paths under the watched roots trigger a rebuild.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatchFilter {
    /// Directory names skipped anywhere under a root.
    pub exclude_dirs: Vec<String>,
    /// File extensions (without the dot) that count as source.
    pub extensions: Vec<String>,
}

impl Default for WatchFilter {
    fn default() -> Self {
        Self {
            exclude_dirs: vec!["views".into(), "target".into(), ".git".into()],
            extensions: vec!["rs".into(), "go".into()],
        }
    }
}

impl WatchFilter {
    /// `false` for directories the harness should not descend into.
    pub fn watch_dir(&self, name: &str) -> bool {
        !self.exclude_dirs.iter().any(|d| d == name)
    }

    /// `true` for files whose change requires a rebuild.
    pub fn watch_file(&self, name: &str) -> bool {
        Path::new(name)
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| self.extensions.iter().any(|x| x == ext))
    }

    /// Apply both predicates to a path reported under `root`.
    pub fn is_relevant(&self, root: &Path, path: &Path) -> bool {
        let relative = path.strip_prefix(root).unwrap_or(path);
        let mut components: Vec<_> = relative
            .components()
            .filter_map(|c| c.as_os_str().to_str())
            .collect();
        let Some(file) = components.pop() else {
            return false;
        };
        components.iter().all(|dir| self.watch_dir(dir)) && self.watch_file(file)
    }
}

struct DirtyFlag {
    dirty: AtomicBool,
    /// Milliseconds since `epoch` of the most recent relevant event.
    last_event_ms: AtomicU64,
    epoch: Instant,
}

impl DirtyFlag {
    fn mark(&self) {
        let ms = self.epoch.elapsed().as_millis() as u64;
        self.last_event_ms.store(ms, Ordering::SeqCst);
        self.dirty.store(true, Ordering::SeqCst);
    }

    fn quiet_for(&self) -> Duration {
        let now = self.epoch.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(self.last_event_ms.load(Ordering::SeqCst)))
    }
}

/// [`Watcher`] backed by the platform's file notification API.
///
/// Relevant events set a dirty flag. `changed()` waits until the event burst
/// has been quiet for the debounce window, then consumes the flag, so a
/// save-all in the editor yields one rebuild.
pub struct NotifyWatcher {
    // Held to keep the OS watch alive.
    _watcher: RecommendedWatcher,
    flag: Arc<DirtyFlag>,
    debounce: Duration,
}

impl std::fmt::Debug for NotifyWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotifyWatcher")
            .field("debounce", &self.debounce)
            .finish()
    }
}

impl NotifyWatcher {
    pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(100);

    /// Start watching `roots` recursively.
    ///
    /// Fails if any root cannot be watched; this is fatal for the harness.
    pub fn new(roots: &[PathBuf], filter: WatchFilter, debounce: Duration) -> Result<Self> {
        let flag = Arc::new(DirtyFlag {
            dirty: AtomicBool::new(false),
            last_event_ms: AtomicU64::new(0),
            epoch: Instant::now(),
        });

        // Events carry absolute paths.
        let roots = roots
            .iter()
            .map(|root| {
                std::fs::canonicalize(root)
                    .with_context(|| format!("failed to resolve watch root {}", root.display()))
            })
            .collect::<Result<Vec<_>>>()?;

        let handler_flag = Arc::clone(&flag);
        let handler_roots = roots.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let event = match res {
                Ok(event) => event,
                Err(e) => {
                    warn!(error = %e, "watch error");
                    return;
                }
            };
            if matches!(event.kind, EventKind::Access(_) | EventKind::Other) {
                return;
            }
            let relevant = event.paths.iter().any(|path| {
                handler_roots
                    .iter()
                    .filter(|root| path.starts_with(root))
                    .any(|root| filter.is_relevant(root, path))
            });
            if relevant {
                debug!(paths = ?event.paths, "source change");
                handler_flag.mark();
            }
        })
        .context("failed to create file watcher")?;

        for root in &roots {
            watcher
                .watch(root, RecursiveMode::Recursive)
                .with_context(|| format!("failed to watch {}", root.display()))?;
        }

        Ok(Self {
            _watcher: watcher,
            flag,
            debounce,
        })
    }
}

#[async_trait]
impl Watcher for NotifyWatcher {
    async fn changed(&self) -> bool {
        if !self.flag.dirty.load(Ordering::SeqCst) {
            return false;
        }
        loop {
            let quiet = self.flag.quiet_for();
            if quiet >= self.debounce {
                break;
            }
            tokio::time::sleep(self.debounce - quiet).await;
        }
        self.flag.dirty.swap(false, Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_skips_views_and_target() {
        let filter = WatchFilter::default();
        assert!(!filter.watch_dir("views"));
        assert!(!filter.watch_dir("target"));
        assert!(filter.watch_dir("src"));
    }

    #[test]
    fn files_match_by_extension() {
        let filter = WatchFilter::default();
        assert!(filter.watch_file("main.rs"));
        assert!(filter.watch_file("controller.go"));
        assert!(!filter.watch_file("index.html"));
        assert!(!filter.watch_file("Makefile"));
    }

    #[test]
    fn relevance_checks_every_directory() {
        let filter = WatchFilter::default();
        let root = Path::new("/project");
        assert!(filter.is_relevant(root, Path::new("/project/app/controller.go")));
        assert!(!filter.is_relevant(root, Path::new("/project/app/views/index.go")));
        assert!(!filter.is_relevant(root, Path::new("/project/target/debug/build.rs")));
        assert!(!filter.is_relevant(root, Path::new("/project/app/README.md")));
    }

    #[tokio::test]
    async fn reports_change_once_per_burst() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().canonicalize().unwrap();
        let watcher =
            NotifyWatcher::new(&[root.clone()], WatchFilter::default(), Duration::from_millis(50))
                .unwrap();

        assert!(!watcher.changed().await);

        std::fs::write(root.join("main.rs"), "fn main() {}").unwrap();
        std::fs::write(root.join("lib.rs"), "").unwrap();

        let mut saw_change = false;
        for _ in 0..50 {
            if watcher.changed().await {
                saw_change = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(saw_change, "expected a change notification");
        // Give stragglers from the same burst time to land, then drain once.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let _ = watcher.changed().await;
        assert!(!watcher.changed().await);
    }

    #[tokio::test]
    async fn ignores_irrelevant_files() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().canonicalize().unwrap();
        let watcher =
            NotifyWatcher::new(&[root.clone()], WatchFilter::default(), Duration::from_millis(20))
                .unwrap();

        std::fs::write(root.join("notes.txt"), "hello").unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!watcher.changed().await);
    }

    #[test]
    fn missing_root_is_an_error() {
        let result = NotifyWatcher::new(
            &[PathBuf::from("/nonexistent/relay/root")],
            WatchFilter::default(),
            NotifyWatcher::DEFAULT_DEBOUNCE,
        );
        assert!(result.is_err());
    }
}

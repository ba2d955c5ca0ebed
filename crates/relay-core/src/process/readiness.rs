//! Readiness detection by scraping the app's output.
//!
//! There is no handshake between the harness and the app: the app is
//! considered ready as soon as a line of its output matches the detector.

/// Decides whether a chunk of child output means "accepting connections".
pub trait ReadinessDetector: Send + Sync {
    fn is_ready(&self, line: &[u8]) -> bool;
}

/// Case-insensitive substring match, `"listen"` by default.
#[derive(Debug, Clone)]
pub struct ListenMarker {
    needle: Vec<u8>,
}

impl ListenMarker {
    pub fn new(marker: &str) -> Self {
        Self {
            needle: marker.to_ascii_lowercase().into_bytes(),
        }
    }
}

impl Default for ListenMarker {
    fn default() -> Self {
        Self::new("listen")
    }
}

impl ReadinessDetector for ListenMarker {
    fn is_ready(&self, line: &[u8]) -> bool {
        if self.needle.is_empty() {
            return true;
        }
        line.windows(self.needle.len())
            .any(|w| w.eq_ignore_ascii_case(&self.needle))
    }
}

impl<F> ReadinessDetector for F
where
    F: Fn(&[u8]) -> bool + Send + Sync,
{
    fn is_ready(&self, line: &[u8]) -> bool {
        self(line)
    }
}

//! Captured process output.
//!
//! A [`LogBuffer`] is a cheaply clonable, append-only text sink shared between
//! the background log stream of an application and the scenario asserting on
//! it. Buildpacks colour their output, so assertions usually go through
//! [`LogBuffer::ansi_stripped`].

use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use regex::Regex;

fn ansi_pattern() -> &'static Regex {
    static ANSI: OnceLock<Regex> = OnceLock::new();
    ANSI.get_or_init(|| {
        // CSI sequences, OSC sequences terminated by BEL or ST, and lone two-byte escapes.
        Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-Z\\-_]")
            .expect("ANSI pattern is valid")
    })
}

/// Remove ANSI control sequences from `text`.
pub fn strip_ansi(text: &str) -> String {
    ansi_pattern().replace_all(text, "").into_owned()
}

/// Shared capture buffer.
#[derive(Debug, Clone, Default)]
pub struct LogBuffer {
    inner: Arc<Mutex<String>>,
}

impl LogBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw text.
    pub fn write(&self, text: &str) {
        self.inner.lock().push_str(text);
    }

    /// Append a line, adding the trailing newline.
    pub fn push_line(&self, line: &str) {
        let mut inner = self.inner.lock();
        inner.push_str(line);
        inner.push('\n');
    }

    /// Snapshot of everything captured so far.
    pub fn contents(&self) -> String {
        self.inner.lock().clone()
    }

    /// Snapshot with ANSI control sequences removed.
    pub fn ansi_stripped(&self) -> String {
        strip_ansi(&self.inner.lock())
    }

    /// Discard captured output (e.g. between two pushes of the same app).
    pub fn reset(&self) {
        self.inner.lock().clear();
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Substring test against the ANSI-stripped text.
    pub fn contains(&self, needle: &str) -> bool {
        self.ansi_stripped().contains(needle)
    }

    /// Regex test against the ANSI-stripped text.
    pub fn matches(&self, pattern: &Regex) -> bool {
        pattern.is_match(&self.ansi_stripped())
    }

    /// Number of non-overlapping matches in the ANSI-stripped text.
    pub fn count_matches(&self, pattern: &Regex) -> usize {
        pattern.find_iter(&self.ansi_stripped()).count()
    }

    /// Last `n` lines, for failure reports.
    pub fn tail(&self, n: usize) -> String {
        let text = self.ansi_stripped();
        let lines: Vec<&str> = text.lines().collect();
        let start = lines.len().saturating_sub(n);
        lines[start..].join("\n")
    }
}

//! Per-request timing trace, for logs only.

use std::time::{Duration, Instant};
use tracing::debug;

/// Ordered, append-only list of named timestamps
/// (`start`, `downloaded`, `waiting`, `converted`, `sent`).
#[derive(Debug, Clone)]
pub struct TimingTrace {
    marks: Vec<(&'static str, Instant)>,
}

impl TimingTrace {
    /// Start a trace with a `start` mark at the current instant.
    pub fn start() -> Self {
        Self {
            marks: vec![("start", Instant::now())],
        }
    }

    pub fn mark(&mut self, name: &'static str) {
        self.mark_at(name, Instant::now());
    }

    /// Record a mark for an instant observed elsewhere, such as the moment a
    /// queue worker picked the task up.
    pub fn mark_at(&mut self, name: &'static str, at: Instant) {
        self.marks.push((name, at));
    }

    pub fn started_at(&self) -> Instant {
        self.marks[0].1
    }

    /// Time between each mark and the one before it.
    pub fn deltas(&self) -> Vec<(&'static str, Duration)> {
        self.marks
            .windows(2)
            .map(|pair| (pair[1].0, pair[1].1.duration_since(pair[0].1)))
            .collect()
    }

    pub fn log(&self, label: &str) {
        for (name, elapsed) in self.deltas() {
            debug!("{label} {name}: {}ms", elapsed.as_millis());
        }
    }
}

//! Append-only progress history, duration tracking and the clock seam.
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of wall-clock milliseconds. Injected so tests can control time.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Clock backed by `SystemTime`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: AtomicU64::new(start_ms),
        }
    }

    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set(&self, ms: u64) {
        self.now.store(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// One write-once progress or error line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp_ms: u64,
    pub phase: String,
    pub message: String,
}

impl fmt::Display for HistoryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.timestamp_ms, self.phase, self.message)
    }
}

/// Ordered, append-only list of history entries.
///
/// Entries are never edited or removed; a retry carries the previous log
/// forward and keeps appending to it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryLog {
    entries: Vec<HistoryEntry>,
}

impl HistoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry stamped with `timestamp_ms`.
    pub fn append(&mut self, timestamp_ms: u64, phase: impl Into<String>, message: impl Into<String>) {
        self.entries.push(HistoryEntry {
            timestamp_ms,
            phase: phase.into(),
            message: message.into(),
        });
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last(&self) -> Option<&HistoryEntry> {
        self.entries.last()
    }

    /// Render one line per entry, oldest first.
    pub fn render(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.to_string()).collect()
    }
}

/// Start/end instants of an operation, in clock milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurationTracker {
    started_ms: Option<u64>,
    ended_ms: Option<u64>,
}

impl DurationTracker {
    pub fn started_at(now_ms: u64) -> Self {
        Self {
            started_ms: Some(now_ms),
            ended_ms: None,
        }
    }

    /// Records the end instant. Later calls keep the first value.
    pub fn stop(&mut self, now_ms: u64) {
        if self.ended_ms.is_none() {
            self.ended_ms = Some(now_ms);
        }
    }

    pub fn is_running(&self) -> bool {
        self.started_ms.is_some() && self.ended_ms.is_none()
    }

    /// Elapsed milliseconds up to the end instant, or up to `now_ms` while running.
    pub fn elapsed_ms(&self, now_ms: u64) -> u64 {
        match self.started_ms {
            Some(start) => self.ended_ms.unwrap_or(now_ms).saturating_sub(start),
            None => 0,
        }
    }

    /// Human-readable elapsed time, e.g. `1.250s`.
    pub fn describe(&self, now_ms: u64) -> String {
        let ms = self.elapsed_ms(now_ms);
        format!("{}.{:03}s", ms / 1000, ms % 1000)
    }
}

//! Manager configuration.
//!
//! ## Environment
//!
//! - `TXLC_TICK_INTERVAL_MS` (default: 1000) - Aging tick interval
//! - `TXLC_STEP_INTERVAL_MS` (default: 1000) - Delay between driver iterations
//! - `TXLC_TIMEOUT_MS` (default: 60000) - Time allowed after submission
//! - `TXLC_MAX_RETRIES` (default: 3) - Retry budget per operation
use std::time::Duration;

/// Configuration for an `OperationManager`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Interval between aging ticks.
    pub tick_interval: Duration,
    /// Delay between two iterations of one lifecycle's driver loop.
    pub step_interval: Duration,
    /// Elapsed time after submission at which a lifecycle times out.
    pub timeout: Duration,
    /// Retries allowed per operation. Zero disables retries.
    pub max_retries: u32,
    /// Store finalized snapshots in the configured history archive.
    pub archive_on_finalize: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(1_000),
            step_interval: Duration::from_millis(1_000),
            timeout: Duration::from_millis(60_000),
            max_retries: 3,
            archive_on_finalize: true,
        }
    }
}

impl ManagerConfig {
    /// Create configuration from environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let ms = |key: &str, fallback: Duration| {
            get(key)
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_millis)
                .unwrap_or(fallback)
        };
        Self {
            tick_interval: ms("TXLC_TICK_INTERVAL_MS", defaults.tick_interval),
            step_interval: ms("TXLC_STEP_INTERVAL_MS", defaults.step_interval),
            timeout: ms("TXLC_TIMEOUT_MS", defaults.timeout),
            max_retries: get("TXLC_MAX_RETRIES")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_retries),
            archive_on_finalize: defaults.archive_on_finalize,
        }
    }

    pub fn with_tick_interval(mut self, d: Duration) -> Self {
        self.tick_interval = d;
        self
    }

    pub fn with_step_interval(mut self, d: Duration) -> Self {
        self.step_interval = d;
        self
    }

    pub fn with_timeout(mut self, d: Duration) -> Self {
        self.timeout = d;
        self
    }

    pub fn with_max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }

    pub fn with_archive_on_finalize(mut self, yes: bool) -> Self {
        self.archive_on_finalize = yes;
        self
    }

    pub(crate) fn tick_ms(&self) -> u64 {
        self.tick_interval.as_millis() as u64
    }

    pub(crate) fn timeout_ms(&self) -> u64 {
        self.timeout.as_millis() as u64
    }
}

//! Leveled log sink used for transitions, errors and finalization dumps.
use std::sync::Mutex;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

/// Accepts leveled lines. Implementations must not block.
pub trait LogSink: Send + Sync {
    fn emit(&self, level: LogLevel, line: &str);
}

/// Forwards every line to the `tracing` macro of the same level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn emit(&self, level: LogLevel, line: &str) {
        match level {
            LogLevel::Error => error!(message = %line, "lifecycle"),
            LogLevel::Warn => warn!(message = %line, "lifecycle"),
            LogLevel::Debug => debug!(message = %line, "lifecycle"),
            LogLevel::Info => info!(message = %line, "lifecycle"),
        }
    }
}

/// Captures lines in memory. Handy for assertions in tests.
#[derive(Debug, Default)]
pub struct MemoryLogSink {
    lines: Mutex<Vec<(LogLevel, String)>>,
}

impl MemoryLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<(LogLevel, String)> {
        self.lines.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Lines containing `needle`, any level.
    pub fn matching(&self, needle: &str) -> Vec<String> {
        self.lines()
            .into_iter()
            .filter(|(_, l)| l.contains(needle))
            .map(|(_, l)| l)
            .collect()
    }
}

impl LogSink for MemoryLogSink {
    fn emit(&self, level: LogLevel, line: &str) {
        self.lines
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push((level, line.to_string()));
    }
}

/// Install a default `fmt` subscriber filtered by `RUST_LOG` (default `info`).
/// Safe to call many times; only the first call installs anything.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .try_init();
}

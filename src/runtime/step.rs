use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::debug;

use crate::error::StepError;
use crate::logging::{LogLevel, LogSink};
use crate::runtime::lifecycle::OperationLifecycle;
use crate::LifecycleState;

/// A phase action in flight: resolves to "done" or fails.
pub type StepFuture<'a> = Pin<Box<dyn Future<Output = Result<bool, StepError>> + Send + 'a>>;

/// Wraps every phase action executed by a lifecycle driver.
pub trait StepRunner: Send + Sync {
    /// Runs `step` for `lifecycle` while it sits in `phase`, returning the
    /// step's own result unchanged.
    fn run<'a>(&'a self, lifecycle: &'a OperationLifecycle, phase: LifecycleState, step: StepFuture<'a>) -> StepFuture<'a>;
}

/// Records `BEGIN`, `END -> RESOLVED` and `END -> REJECTED: <message>` in the
/// lifecycle history around every step, whatever the step itself logs.
pub struct HistoryStepRunner {
    sink: Arc<dyn LogSink>,
}

impl HistoryStepRunner {
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        Self { sink }
    }
}

impl StepRunner for HistoryStepRunner {
    fn run<'a>(&'a self, lifecycle: &'a OperationLifecycle, phase: LifecycleState, step: StepFuture<'a>) -> StepFuture<'a> {
        Box::pin(async move {
            lifecycle.record(phase.name(), "BEGIN");
            match step.await {
                Ok(done) => {
                    lifecycle.record(phase.name(), "END -> RESOLVED");
                    debug!(lifecycle = %lifecycle.id(), %phase, done, "step resolved");
                    Ok(done)
                }
                Err(e) => {
                    lifecycle.record(phase.name(), format!("END -> REJECTED: {e}"));
                    self.sink.emit(
                        LogLevel::Error,
                        &format!("{} '{}' {} rejected: {}", lifecycle.id(), lifecycle.intent().description(), phase, e),
                    );
                    Err(e)
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::ManualClock;
    use crate::intent::{JsonPayload, OperationIntent};
    use crate::logging::MemoryLogSink;
    use crate::{ChainError, HistoryLog, LifecycleId, PendingCall};

    fn lifecycle() -> OperationLifecycle {
        let intent = OperationIntent::builder("wrap test")
            .payload(JsonPayload::new(serde_json::json!({})))
            .build_call(|_h| Ok(PendingCall::new("0xc", vec![])))
            .build()
            .unwrap();
        OperationLifecycle::new(LifecycleId(1), LifecycleId(1), intent, Arc::new(ManualClock::new(0)), 0, HistoryLog::new())
    }

    #[tokio::test]
    async fn resolved_step_is_bracketed() {
        let sink = Arc::new(MemoryLogSink::new());
        let runner = HistoryStepRunner::new(sink.clone());
        let lc = lifecycle();
        let before = lc.history().len();
        let out = runner
            .run(&lc, LifecycleState::ReadyToSend, Box::pin(async { Ok(false) }))
            .await;
        assert_eq!(out, Ok(false));
        let h = lc.history();
        let tail: Vec<&str> = h.entries()[before..].iter().map(|e| e.message.as_str()).collect();
        assert_eq!(tail, vec!["BEGIN", "END -> RESOLVED"]);
        assert!(h.entries()[before..].iter().all(|e| e.phase == "ReadyToSend"));
        assert!(sink.lines().is_empty());
    }

    #[tokio::test]
    async fn rejected_step_is_recorded_and_reraised() {
        let sink = Arc::new(MemoryLogSink::new());
        let runner = HistoryStepRunner::new(sink.clone());
        let lc = lifecycle();
        let err = StepError::Chain(ChainError::Transport("boom".into()));
        let expected = err.clone();
        let out = runner
            .run(&lc, LifecycleState::RawTransactionCheck, Box::pin(async move { Err(err) }))
            .await;
        assert_eq!(out, Err(expected));
        let last = lc.history().last().cloned().unwrap();
        assert_eq!(last.message, "END -> REJECTED: rpc transport error: boom");
        assert_eq!(sink.matching("rejected").len(), 1);
    }
}

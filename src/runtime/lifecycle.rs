//! Per-operation state machine and its driver loop.
//!
//! A lifecycle owns one intent and walks it through the phases in order.
//! Only the driver loop executes phases; the manager's tick touches coarse
//! flags (`is_timed_out`, `is_retry_requested`, `is_deleted`) and moves a
//! timed-out lifecycle to `Failed`. All mutable fields sit behind one mutex that is never held across
//! an await point.
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

use crate::chain::{ChainContext, TransactionInfo, TransactionReceipt, TxHash, UnsignedTransaction};
use crate::error::{ChainError, IntentError, StepError};
use crate::history::{Clock, DurationTracker, HistoryLog};
use crate::intent::OperationIntent;
use crate::logging::{LogLevel, LogSink};
use crate::runtime::step::{StepFuture, StepRunner};
use crate::{LifecycleId, LifecycleState};

/// Extra gas on top of the node's estimate, in percent.
const GAS_LIMIT_HEADROOM_PERCENT: u64 = 20;

const LIFECYCLE_PHASE: &str = "Lifecycle";

/// Shared dependencies of every driver loop.
pub(crate) struct DriverEnv {
    pub chain: ChainContext,
    pub runner: Arc<dyn StepRunner>,
    pub sink: Arc<dyn LogSink>,
    pub step_interval: Duration,
    pub max_retries: u32,
}

/// First state for a fresh lifecycle of `intent`.
pub fn initial_state(intent: &OperationIntent) -> LifecycleState {
    if !intent.submitted_by_server() {
        LifecycleState::RawTransactionCheck
    } else if intent.has_prerequisites() {
        LifecycleState::PollingPrerequisites
    } else {
        LifecycleState::ReadyToSend
    }
}

/// State following `completed`, skipping phases without a handler.
pub fn next_state(completed: LifecycleState, has_confirmation: bool, has_completion: bool) -> LifecycleState {
    use LifecycleState::*;
    let after_confirmation = if has_completion { ExecuteCompletion } else { Succeeded };
    match completed {
        PollingPrerequisites => ReadyToSend,
        ReadyToSend => RawTransactionCheck,
        RawTransactionCheck => {
            if has_confirmation {
                PollingConfirmation
            } else {
                after_confirmation
            }
        }
        PollingConfirmation => after_confirmation,
        ExecuteCompletion => Succeeded,
        Succeeded => Succeeded,
        Failed => Failed,
    }
}

#[derive(Debug)]
struct LifecycleInner {
    state: LifecycleState,
    retry_count: u32,
    is_transaction_sent: bool,
    is_timed_out: bool,
    is_retry_requested: bool,
    is_deleted: bool,
    // whoever sets this first (driver or tick) consults on_error
    error_handled: bool,
    // set once the retry decision is recorded
    error_resolved: bool,
    elapsed_ms: u64,
    duration: DurationTracker,
    history: HistoryLog,
    trace: Vec<LifecycleState>,
    tx_hash: Option<TxHash>,
    gas_estimate: Option<u64>,
    submissions: u32,
    last_raw_result: Option<TransactionInfo>,
    last_receipt_result: Option<TransactionReceipt>,
    last_error: Option<String>,
}

/// Serializable view of a lifecycle, used for finalization dumps and archives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleSnapshot {
    pub id: LifecycleId,
    pub origin: LifecycleId,
    pub description: String,
    pub state: LifecycleState,
    pub retry_count: u32,
    pub is_transaction_sent: bool,
    pub is_timed_out: bool,
    pub is_retry_requested: bool,
    pub is_deleted: bool,
    pub elapsed_ms: u64,
    pub duration_ms: u64,
    pub tx_hash: Option<TxHash>,
    pub gas_estimate: Option<u64>,
    pub gas_used: Option<u64>,
    pub last_raw_result: Option<TransactionInfo>,
    pub last_receipt_result: Option<TransactionReceipt>,
    pub last_error: Option<String>,
    pub state_trace: Vec<LifecycleState>,
    pub history: HistoryLog,
}

/// Mutable state machine driving one `OperationIntent`.
pub struct OperationLifecycle {
    id: LifecycleId,
    origin: LifecycleId,
    intent: OperationIntent,
    clock: Arc<dyn Clock>,
    inner: Mutex<LifecycleInner>,
    successor: Mutex<Option<Arc<OperationLifecycle>>>,
}

impl std::fmt::Debug for OperationLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationLifecycle")
            .field("id", &self.id)
            .field("origin", &self.origin)
            .field("description", &self.intent.description())
            .field("state", &self.state())
            .finish()
    }
}

impl OperationLifecycle {
    /// Create a lifecycle. `history` is empty for a first attempt and carries
    /// the previous attempt's log for a retry.
    pub(crate) fn new(
        id: LifecycleId,
        origin: LifecycleId,
        intent: OperationIntent,
        clock: Arc<dyn Clock>,
        retry_count: u32,
        mut history: HistoryLog,
    ) -> Self {
        let state = initial_state(&intent);
        let now = clock.now_ms();
        let client_submitted = !intent.submitted_by_server();
        let tx_hash = if client_submitted {
            intent.payload().submitted_tx_hash()
        } else {
            None
        };
        history.append(
            now,
            LIFECYCLE_PHASE,
            format!(
                "CREATED {id} for '{}' (attempt {}), starting at {state}",
                intent.description(),
                retry_count + 1
            ),
        );
        Self {
            id,
            origin,
            intent,
            clock,
            inner: Mutex::new(LifecycleInner {
                state,
                retry_count,
                is_transaction_sent: client_submitted,
                is_timed_out: false,
                is_retry_requested: false,
                is_deleted: false,
                error_handled: false,
                error_resolved: false,
                elapsed_ms: 0,
                duration: DurationTracker::started_at(now),
                history,
                trace: vec![state],
                tx_hash,
                gas_estimate: None,
                submissions: 0,
                last_raw_result: None,
                last_receipt_result: None,
                last_error: None,
            }),
            successor: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LifecycleInner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn id(&self) -> LifecycleId {
        self.id
    }

    /// Id of the first attempt of this operation.
    pub fn origin(&self) -> LifecycleId {
        self.origin
    }

    pub fn intent(&self) -> &OperationIntent {
        &self.intent
    }

    pub fn state(&self) -> LifecycleState {
        self.lock().state
    }

    pub fn retry_count(&self) -> u32 {
        self.lock().retry_count
    }

    pub fn is_transaction_sent(&self) -> bool {
        self.lock().is_transaction_sent
    }

    pub fn is_timed_out(&self) -> bool {
        self.lock().is_timed_out
    }

    pub fn is_retry_requested(&self) -> bool {
        self.lock().is_retry_requested
    }

    pub fn is_deleted(&self) -> bool {
        self.lock().is_deleted
    }

    /// Aging counter; grows by one tick interval per manager tick once sent.
    pub fn elapsed_ms(&self) -> u64 {
        self.lock().elapsed_ms
    }

    /// Wall-clock time since creation, frozen at finalization or success.
    pub fn duration_ms(&self) -> u64 {
        let now = self.clock.now_ms();
        self.lock().duration.elapsed_ms(now)
    }

    /// Copy of the history log.
    pub fn history(&self) -> HistoryLog {
        self.lock().history.clone()
    }

    /// States visited so far, in order.
    pub fn state_trace(&self) -> Vec<LifecycleState> {
        self.lock().trace.clone()
    }

    pub fn tx_hash(&self) -> Option<TxHash> {
        self.lock().tx_hash.clone()
    }

    pub fn last_raw_result(&self) -> Option<TransactionInfo> {
        self.lock().last_raw_result.clone()
    }

    pub fn last_receipt_result(&self) -> Option<TransactionReceipt> {
        self.lock().last_receipt_result.clone()
    }

    pub fn gas_estimate(&self) -> Option<u64> {
        self.lock().gas_estimate
    }

    /// Gas actually consumed, once a receipt has been seen.
    pub fn gas_used(&self) -> Option<u64> {
        self.lock().last_receipt_result.as_ref().map(|r| r.gas_used)
    }

    /// Number of submissions made by this lifecycle. Never more than one.
    pub fn submission_count(&self) -> u32 {
        self.lock().submissions
    }

    pub fn last_error(&self) -> Option<String> {
        self.lock().last_error.clone()
    }

    /// The lifecycle that replaced this one after a retry, if any.
    pub fn successor(&self) -> Option<Arc<OperationLifecycle>> {
        self.successor.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Follow retry links to the most recent attempt.
    pub fn latest_attempt(self: &Arc<Self>) -> Arc<OperationLifecycle> {
        let mut cur = self.clone();
        while let Some(next) = cur.successor() {
            cur = next;
        }
        cur
    }

    /// The retry decision for a failure has been made and recorded.
    pub(crate) fn is_error_resolved(&self) -> bool {
        self.lock().error_resolved
    }

    /// Finalized and not handed over to a retry.
    pub fn is_settled(&self) -> bool {
        let g = self.lock();
        g.is_deleted && !g.is_retry_requested && (g.state.is_terminal() || g.is_timed_out)
    }

    /// Append a free-form note under the current phase. Handlers use this to
    /// leave breadcrumbs in the audit trail.
    pub fn note(&self, message: impl Into<String>) {
        let phase = self.state().name();
        self.record(phase, message);
    }

    /// Append to the history. No-op once the lifecycle is finalized.
    pub(crate) fn record(&self, phase: &str, message: impl Into<String>) {
        let now = self.clock.now_ms();
        let mut g = self.lock();
        if g.is_deleted {
            return;
        }
        g.history.append(now, phase, message);
    }

    pub fn snapshot(&self) -> LifecycleSnapshot {
        let now = self.clock.now_ms();
        let g = self.lock();
        LifecycleSnapshot {
            id: self.id,
            origin: self.origin,
            description: self.intent.description().to_string(),
            state: g.state,
            retry_count: g.retry_count,
            is_transaction_sent: g.is_transaction_sent,
            is_timed_out: g.is_timed_out,
            is_retry_requested: g.is_retry_requested,
            is_deleted: g.is_deleted,
            elapsed_ms: g.elapsed_ms,
            duration_ms: g.duration.elapsed_ms(now),
            tx_hash: g.tx_hash.clone(),
            gas_estimate: g.gas_estimate,
            gas_used: g.last_receipt_result.as_ref().map(|r| r.gas_used),
            last_raw_result: g.last_raw_result.clone(),
            last_receipt_result: g.last_receipt_result.clone(),
            last_error: g.last_error.clone(),
            state_trace: g.trace.clone(),
            history: g.history.clone(),
        }
    }

    // ---------------- driver loop

    /// Drive the lifecycle until it is terminal, fails, times out or is
    /// finalized. Never runs two phases at once.
    pub(crate) async fn drive(self: Arc<Self>, env: Arc<DriverEnv>) {
        debug!(lifecycle = %self.id, state = ?self.state(), "driver started");
        loop {
            // the tick moved it to Failed when it timed out
            if self.is_timed_out() || self.is_deleted() {
                return;
            }
            let state = self.state();
            if state.is_terminal() {
                return;
            }

            let step: StepFuture<'_> = Box::pin(self.execute(state, &env));
            let result = env.runner.run(&self, state, step).await;

            if self.is_timed_out() || self.is_deleted() {
                self.record(state.name(), "result discarded: lifecycle timed out");
                return;
            }
            match result {
                Ok(true) => {
                    if let Err(e) = self.advance_state(&env) {
                        self.fail(e, &env);
                        return;
                    }
                }
                Ok(false) => {}
                Err(e) => {
                    self.fail(e, &env);
                    return;
                }
            }
            if self.state().is_terminal() {
                return;
            }
            tokio::time::sleep(env.step_interval).await;
        }
    }

    async fn execute(self: &Arc<Self>, state: LifecycleState, env: &DriverEnv) -> Result<bool, StepError> {
        self.intent.validate()?;
        match state {
            LifecycleState::PollingPrerequisites => match self.intent.prerequisites() {
                Some(h) => h.run(self.clone()).await.map_err(|message| StepError::Callback {
                    phase: "check_prerequisites",
                    message,
                }),
                None => Ok(true),
            },
            LifecycleState::ReadyToSend => self.send(env).await,
            LifecycleState::RawTransactionCheck => self.check_raw_transaction(env).await,
            LifecycleState::PollingConfirmation => match self.intent.confirmation() {
                Some(h) => h.run(self.clone()).await.map_err(|message| StepError::Callback {
                    phase: "check_confirmation",
                    message,
                }),
                None => Ok(true),
            },
            LifecycleState::ExecuteCompletion => match self.intent.completion() {
                Some(h) => h.run(self.clone()).await.map_err(|message| StepError::Callback {
                    phase: "on_completion",
                    message,
                }),
                None => Ok(true),
            },
            LifecycleState::Succeeded | LifecycleState::Failed => Ok(true),
        }
    }

    /// Build, estimate, sign and submit. At most one submission per lifecycle.
    async fn send(&self, env: &DriverEnv) -> Result<bool, StepError> {
        if self.tx_hash().is_some() {
            return Ok(true);
        }
        let chain = &env.chain;
        let build = self.intent.build_call().ok_or(IntentError::MissingBuildCall)?;
        let call = build(&chain.handle).map_err(|message| StepError::Callback {
            phase: "build_call",
            message,
        })?;
        let from = chain.signer.address();
        let estimate = chain.client.estimate_gas(&from, &call).await?;
        let gas_limit = estimate.saturating_add(estimate.saturating_mul(GAS_LIMIT_HEADROOM_PERCENT) / 100);

        let nonce = chain.nonces.next(&from).await?;
        let tx = UnsignedTransaction::from_call(&call)
            .chain_id(chain.handle.chain_id)
            .from(from.clone())
            .nonce(nonce)
            .gas_limit(gas_limit);
        let raw = match chain.signer.sign(&tx).await {
            Ok(raw) => raw,
            Err(e) => {
                chain.nonces.resync(&from, nonce).await;
                return Err(e.into());
            }
        };

        self.lock().submissions += 1;
        match chain.client.send_raw_transaction(raw).await {
            Ok(hash) => {
                {
                    let mut g = self.lock();
                    g.tx_hash = Some(hash.clone());
                    g.is_transaction_sent = true;
                    g.gas_estimate = Some(estimate);
                }
                self.record(
                    LifecycleState::ReadyToSend.name(),
                    format!("submitted {hash} (nonce {nonce}, gas limit {gas_limit})"),
                );
                info!(lifecycle = %self.id, %hash, nonce, "transaction submitted");
                Ok(true)
            }
            Err(e) => {
                chain.nonces.resync(&from, nonce).await;
                Err(e.into())
            }
        }
    }

    /// Look the transaction up, then its receipt, and cross-check them.
    /// Not-yet-mined and transport hiccups poll again; a revert or a block
    /// disagreement fails the step.
    async fn check_raw_transaction(&self, env: &DriverEnv) -> Result<bool, StepError> {
        let hash = self.tx_hash().ok_or(StepError::MissingTxHash)?;
        let client = &env.chain.client;
        let phase = LifecycleState::RawTransactionCheck.name();

        let tx = match client.get_transaction_by_hash(&hash).await {
            Ok(tx) => tx,
            Err(ChainError::Transport(m)) => {
                self.record(phase, format!("transaction lookup failed, polling again: {m}"));
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };
        self.lock().last_raw_result = tx.clone();
        let tx_block = match tx.and_then(|t| t.block_number) {
            Some(b) => b,
            None => return Ok(false),
        };

        let receipt = match client.get_transaction_receipt(&hash).await {
            Ok(r) => r,
            Err(ChainError::Transport(m)) => {
                self.record(phase, format!("receipt lookup failed, polling again: {m}"));
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };
        self.lock().last_receipt_result = receipt.clone();
        let receipt = match receipt {
            Some(r) => r,
            None => return Ok(false),
        };

        if receipt.block_number != tx_block {
            return Err(StepError::BlockMismatch {
                transaction: tx_block,
                receipt: receipt.block_number,
            });
        }
        if !receipt.status {
            return Err(StepError::ReceiptStatusFailed(hash.to_string()));
        }
        self.record(
            phase,
            format!("mined in block {tx_block}, gas used {}", receipt.gas_used),
        );
        Ok(true)
    }

    /// Move to the state after the one that just completed.
    fn advance_state(&self, env: &DriverEnv) -> Result<(), StepError> {
        let now = self.clock.now_ms();
        let (from, to) = {
            let mut g = self.lock();
            let from = g.state;
            // the tick may have expired the lifecycle while the step ran
            if from.is_terminal() || g.is_timed_out {
                return Ok(());
            }
            if from == LifecycleState::ReadyToSend && g.tx_hash.is_none() {
                return Err(StepError::MissingTxHash);
            }
            let to = next_state(from, self.intent.has_confirmation(), self.intent.has_completion());
            g.state = to;
            g.trace.push(to);
            if to == LifecycleState::Succeeded {
                g.duration.stop(now);
            }
            if !g.is_deleted {
                g.history.append(now, LIFECYCLE_PHASE, format!("TRANSITION {from} -> {to}"));
            }
            (from, to)
        };
        env.sink.emit(
            LogLevel::Info,
            &format!("{} '{}' {from} -> {to}", self.id, self.intent.description()),
        );
        Ok(())
    }

    /// Move to `Failed` unless already terminal. Returns whether it moved.
    fn transition_to_failed(&self, error: &StepError) -> Option<LifecycleState> {
        let now = self.clock.now_ms();
        let mut g = self.lock();
        if g.state.is_terminal() {
            return None;
        }
        let from = g.state;
        g.state = LifecycleState::Failed;
        g.trace.push(LifecycleState::Failed);
        g.last_error = Some(error.to_string());
        g.duration.stop(now);
        if !g.is_deleted {
            g.history.append(
                now,
                LIFECYCLE_PHASE,
                format!("TRANSITION {from} -> Failed: {error}"),
            );
        }
        Some(from)
    }

    fn fail(&self, error: StepError, env: &DriverEnv) {
        if let Some(from) = self.transition_to_failed(&error) {
            env.sink.emit(
                LogLevel::Error,
                &format!("{} '{}' {from} -> Failed: {error}", self.id, self.intent.description()),
            );
        }
        match error {
            StepError::Validation(_) => {
                self.resolve_without_retry("validation error", env.sink.as_ref());
            }
            _ => {
                self.resolve_error(env.max_retries, env.sink.as_ref());
            }
        }
    }

    /// Take the right to decide about a retry. Only the first caller wins.
    pub(crate) fn claim_error_handling(&self) -> bool {
        let mut g = self.lock();
        if g.error_handled {
            return false;
        }
        g.error_handled = true;
        true
    }

    /// Consult the intent's `on_error` once per lifecycle and record the
    /// outcome. A retry is only requested while the budget allows it.
    pub(crate) fn resolve_error(&self, max_retries: u32, sink: &dyn LogSink) -> bool {
        if !self.claim_error_handling() {
            return self.is_retry_requested();
        }
        // on_error reads the lifecycle through its accessors; no lock held here
        let wants = self.intent.wants_retry(self);
        self.record_retry_decision(wants, max_retries, sink)
    }

    /// Fail permanently without asking `on_error`.
    fn resolve_without_retry(&self, reason: &str, sink: &dyn LogSink) {
        if self.claim_error_handling() {
            self.record_decision(format!("no retry ({reason})"), false, sink);
        }
    }

    /// Record the outcome of a claimed error, applying the retry budget.
    pub(crate) fn record_retry_decision(&self, wants: bool, max_retries: u32, sink: &dyn LogSink) -> bool {
        let retry_count = self.retry_count();
        let (message, requested) = if !wants {
            ("no retry requested".to_string(), false)
        } else if retry_count < max_retries {
            (format!("retry requested ({} of {max_retries})", retry_count + 1), true)
        } else {
            (format!("retry budget exhausted ({retry_count} of {max_retries}); failing permanently"), false)
        };
        self.record_decision(message, requested, sink)
    }

    fn record_decision(&self, message: String, requested: bool, sink: &dyn LogSink) -> bool {
        let now = self.clock.now_ms();
        let mut g = self.lock();
        g.is_retry_requested = requested;
        g.error_resolved = true;
        if !g.is_deleted {
            g.history.append(now, LIFECYCLE_PHASE, message.clone());
        }
        drop(g);
        let level = if requested { LogLevel::Warn } else { LogLevel::Error };
        sink.emit(level, &format!("{} '{}' {message}", self.id, self.intent.description()));
        requested
    }

    // ---------------- manager hooks

    /// Add one tick to the aging counter. Returns `true` when this tick
    /// pushed the lifecycle over `timeout_ms`; the lifecycle is then
    /// `Failed` with a timeout error.
    pub(crate) fn age(&self, tick_ms: u64, timeout_ms: u64) -> bool {
        let now = self.clock.now_ms();
        let mut g = self.lock();
        if g.is_deleted || g.is_timed_out || g.state.is_terminal() || !g.is_transaction_sent {
            return false;
        }
        g.elapsed_ms += tick_ms;
        if g.elapsed_ms <= timeout_ms {
            return false;
        }
        g.is_timed_out = true;
        let elapsed = g.elapsed_ms;
        let state = g.state;
        let err = StepError::TimedOut(elapsed);
        g.state = LifecycleState::Failed;
        g.trace.push(LifecycleState::Failed);
        g.last_error = Some(err.to_string());
        g.duration.stop(now);
        g.history
            .append(now, LIFECYCLE_PHASE, format!("TIMEOUT in {state} after {elapsed} ms"));
        g.history
            .append(now, LIFECYCLE_PHASE, format!("TRANSITION {state} -> Failed: {err}"));
        true
    }

    /// Mark finalized. Returns `false` if it already was.
    pub(crate) fn mark_deleted(&self) -> bool {
        let now = self.clock.now_ms();
        let mut g = self.lock();
        if g.is_deleted {
            return false;
        }
        g.duration.stop(now);
        let summary = format!(
            "FINALIZED in {} after {} (retries {}, elapsed {} ms)",
            g.state,
            g.duration.describe(now),
            g.retry_count,
            g.elapsed_ms
        );
        g.history.append(now, LIFECYCLE_PHASE, summary);
        g.is_deleted = true;
        true
    }

    pub(crate) fn set_successor(&self, next: Arc<OperationLifecycle>) {
        *self.successor.lock().unwrap_or_else(|p| p.into_inner()) = Some(next);
    }
}

//! Transaction lifecycle orchestration for contract calls recorded on a chain.
//!
//! This crate drives one external write operation at a time through a fixed
//! sequence of asynchronous phases and supervises many of them concurrently.
//! It provides:
//!
//! - Strategy objects: `OperationIntent` built and validated once via
//!   `OperationIntent::builder()`
//! - A per-operation state machine: `OperationLifecycle`, with a single
//!   re-entrant driver loop and an append-only `HistoryLog`
//! - A supervisor: `OperationManager`, which ages lifecycles on a fixed tick,
//!   times them out, finalizes terminal ones and resubmits retry requests
//! - Narrow seams for the outside world: `ChainClient`, `TransactionSigner`,
//!   `LogSink` and `HistoryArchive`
//!
//! States advance strictly in this order, skipping phases the intent does not
//! configure:
//!
//! ```text
//! PollingPrerequisites -> ReadyToSend -> RawTransactionCheck
//!     -> PollingConfirmation -> ExecuteCompletion -> Succeeded
//! ```
//!
//! `Failed` is reachable from every non-terminal state.
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod chain;
pub mod error;
pub mod history;
pub mod intent;
pub mod logging;
pub mod providers;
pub mod runtime;

pub use chain::{
    ChainClient, ChainHandle, JsonSigner, NonceManager, PendingCall, SimulatedChain, TransactionInfo,
    TransactionReceipt, TransactionSigner, TxHash, UnsignedTransaction,
};
pub use error::{ChainError, IntentError, StepError, WaitError};
pub use history::{Clock, DurationTracker, HistoryEntry, HistoryLog, ManualClock, SystemClock};
pub use intent::{JsonPayload, OperationIntent, OperationIntentBuilder, Payload, PhaseHandler};
pub use logging::{LogLevel, LogSink, MemoryLogSink, TracingLogSink};
pub use runtime::config::ManagerConfig;
pub use runtime::lifecycle::{LifecycleSnapshot, OperationLifecycle};
pub use providers::{FsHistoryArchive, HistoryArchive, InMemoryHistoryArchive};
pub use runtime::step::{HistoryStepRunner, StepRunner};
pub use runtime::{OperationManager, OperationManagerBuilder};

/// Lifecycle states in forward order. `Failed` may follow any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleState {
    /// Waiting for the intent's prerequisite check to report ready.
    PollingPrerequisites,
    /// Nonce, call, gas estimate, signature and submission happen here.
    ReadyToSend,
    /// Waiting for the transaction and its receipt to be mined and agree.
    RawTransactionCheck,
    /// Raw success observed; waiting for the domain confirmation oracle.
    PollingConfirmation,
    /// Running the intent's completion side effects.
    ExecuteCompletion,
    Succeeded,
    Failed,
}

impl LifecycleState {
    pub fn is_terminal(self) -> bool {
        matches!(self, LifecycleState::Succeeded | LifecycleState::Failed)
    }

    /// Position in the forward order; `Failed` sorts last.
    pub fn ordinal(self) -> u8 {
        match self {
            LifecycleState::PollingPrerequisites => 0,
            LifecycleState::ReadyToSend => 1,
            LifecycleState::RawTransactionCheck => 2,
            LifecycleState::PollingConfirmation => 3,
            LifecycleState::ExecuteCompletion => 4,
            LifecycleState::Succeeded => 5,
            LifecycleState::Failed => 6,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            LifecycleState::PollingPrerequisites => "PollingPrerequisites",
            LifecycleState::ReadyToSend => "ReadyToSend",
            LifecycleState::RawTransactionCheck => "RawTransactionCheck",
            LifecycleState::PollingConfirmation => "PollingConfirmation",
            LifecycleState::ExecuteCompletion => "ExecuteCompletion",
            LifecycleState::Succeeded => "Succeeded",
            LifecycleState::Failed => "Failed",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Process-unique lifecycle identifier. Retries receive a fresh id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LifecycleId(pub u64);

impl fmt::Display for LifecycleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lc-{}", self.0)
    }
}

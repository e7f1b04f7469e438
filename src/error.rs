use thiserror::Error;

/// Malformed intent or payload. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntentError {
    #[error("intent has no payload")]
    MissingPayload,
    #[error("payload failed validation: {0}")]
    InvalidPayload(String),
    #[error("intent description must not be empty")]
    EmptyDescription,
    #[error("server-submitted intent requires a build_call handler")]
    MissingBuildCall,
    #[error("client-submitted intent must not carry a build_call handler")]
    UnexpectedBuildCall,
    #[error("client-submitted intent must not carry a prerequisite check")]
    UnexpectedPrerequisites,
    #[error("client-submitted intent payload carries no transaction hash")]
    MissingSubmissionReceipt,
    #[error("operation manager is stopped")]
    ManagerStopped,
}

/// Failure reported by a `ChainClient`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    #[error("rpc transport error: {0}")]
    Transport(String),
    #[error("submission rejected: {0}")]
    Rejected(String),
    #[error("gas estimation failed: {0}")]
    Estimate(String),
    #[error("signing failed: {0}")]
    Signing(String),
}

/// Failure of a single lifecycle phase. Moves the lifecycle to `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepError {
    #[error("validation failed: {0}")]
    Validation(#[from] IntentError),
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error("transaction {0} reverted (receipt status failed)")]
    ReceiptStatusFailed(String),
    #[error("block number mismatch: transaction reports {transaction}, receipt reports {receipt}")]
    BlockMismatch { transaction: u64, receipt: u64 },
    #[error("no transaction hash stored for lifecycle")]
    MissingTxHash,
    #[error("{phase} handler failed: {message}")]
    Callback { phase: &'static str, message: String },
    #[error("timed out after {0} ms")]
    TimedOut(u64),
}

/// Error returned by the wait helpers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WaitError {
    #[error("timed out waiting")]
    Timeout,
    #[error("{0}")]
    Other(String),
}

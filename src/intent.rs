//! Operation intents: the immutable strategy object a lifecycle drives.
//!
//! An intent bundles an opaque payload with up to four optional async phase
//! handlers, an optional synchronous retry decision and a flag telling
//! whether the transaction is submitted here or was already submitted by a
//! client. Intents are built through [`OperationIntentBuilder`], which
//! rejects inconsistent combinations instead of coercing them.
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::chain::{ChainHandle, PendingCall, TxHash};
use crate::error::IntentError;
use crate::runtime::lifecycle::OperationLifecycle;

/// Operation-specific data carried by an intent.
///
/// Payloads are shared between attempts and never mutated by the lifecycle.
/// The hash of a transaction the server submitted is kept on the lifecycle;
/// phase handlers read it through [`OperationLifecycle::tx_hash`].
pub trait Payload: Send + Sync + fmt::Debug + 'static {
    /// Must not panic. Called at submit time and again at every phase entry.
    fn validate(&self) -> Result<(), String>;

    /// Hash of a transaction a client already submitted, if any.
    fn submitted_tx_hash(&self) -> Option<TxHash> {
        None
    }
}

/// JSON bag payload: an object whose `required` keys must be present and
/// non-null. A string under `txHash` is treated as the client submission.
#[derive(Debug, Clone)]
pub struct JsonPayload {
    value: Value,
    required: Vec<String>,
}

impl JsonPayload {
    pub fn new(value: Value) -> Self {
        Self {
            value,
            required: Vec::new(),
        }
    }

    pub fn require(mut self, key: impl Into<String>) -> Self {
        self.required.push(key.into());
        self
    }

    pub fn value(&self) -> &Value {
        &self.value
    }
}

impl Payload for JsonPayload {
    fn validate(&self) -> Result<(), String> {
        let obj = self.value.as_object().ok_or("payload must be a JSON object")?;
        for key in &self.required {
            match obj.get(key) {
                None | Some(Value::Null) => return Err(format!("missing required field `{key}`")),
                _ => {}
            }
        }
        Ok(())
    }

    fn submitted_tx_hash(&self) -> Option<TxHash> {
        self.value
            .get("txHash")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(TxHash::new)
    }
}

/// Async phase handler: `Ok(true)` means done, `Ok(false)` means poll again.
#[async_trait]
pub trait PhaseHandler: Send + Sync {
    async fn run(&self, lifecycle: Arc<OperationLifecycle>) -> Result<bool, String>;
}

/// Function wrapper that implements `PhaseHandler`.
pub struct FnPhase<F, Fut>(pub F)
where
    F: Fn(Arc<OperationLifecycle>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<bool, String>> + Send + 'static;

#[async_trait]
impl<F, Fut> PhaseHandler for FnPhase<F, Fut>
where
    F: Fn(Arc<OperationLifecycle>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<bool, String>> + Send + 'static,
{
    async fn run(&self, lifecycle: Arc<OperationLifecycle>) -> Result<bool, String> {
        (self.0)(lifecycle).await
    }
}

/// Builds the contract call to submit.
pub type BuildCallFn = Arc<dyn Fn(&ChainHandle) -> Result<PendingCall, String> + Send + Sync>;

/// Synchronous retry decision. Returns `true` to request a retry.
pub type OnErrorFn = Arc<dyn Fn(&OperationLifecycle) -> bool + Send + Sync>;

/// Immutable description of one external operation.
#[derive(Clone)]
pub struct OperationIntent {
    description: String,
    payload: Arc<dyn Payload>,
    submitted_by_server: bool,
    build_call: Option<BuildCallFn>,
    check_prerequisites: Option<Arc<dyn PhaseHandler>>,
    check_confirmation: Option<Arc<dyn PhaseHandler>>,
    on_completion: Option<Arc<dyn PhaseHandler>>,
    on_error: Option<OnErrorFn>,
}

impl fmt::Debug for OperationIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationIntent")
            .field("description", &self.description)
            .field("payload", &self.payload)
            .field("submitted_by_server", &self.submitted_by_server)
            .field("build_call", &self.build_call.is_some())
            .field("check_prerequisites", &self.check_prerequisites.is_some())
            .field("check_confirmation", &self.check_confirmation.is_some())
            .field("on_completion", &self.on_completion.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

impl OperationIntent {
    pub fn builder(description: impl Into<String>) -> OperationIntentBuilder {
        OperationIntentBuilder {
            description: description.into(),
            payload: None,
            submitted_by_server: true,
            build_call: None,
            check_prerequisites: None,
            check_confirmation: None,
            on_completion: None,
            on_error: None,
        }
    }

    /// Re-check the intent as a whole. Cheap; run at every phase entry.
    pub fn validate(&self) -> Result<(), IntentError> {
        if self.description.trim().is_empty() {
            return Err(IntentError::EmptyDescription);
        }
        self.payload.validate().map_err(IntentError::InvalidPayload)?;
        if self.submitted_by_server {
            if self.build_call.is_none() {
                return Err(IntentError::MissingBuildCall);
            }
        } else {
            if self.build_call.is_some() {
                return Err(IntentError::UnexpectedBuildCall);
            }
            if self.check_prerequisites.is_some() {
                return Err(IntentError::UnexpectedPrerequisites);
            }
            if self.payload.submitted_tx_hash().is_none() {
                return Err(IntentError::MissingSubmissionReceipt);
            }
        }
        Ok(())
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn payload(&self) -> &dyn Payload {
        self.payload.as_ref()
    }

    pub fn submitted_by_server(&self) -> bool {
        self.submitted_by_server
    }

    pub fn has_prerequisites(&self) -> bool {
        self.check_prerequisites.is_some()
    }

    pub fn has_confirmation(&self) -> bool {
        self.check_confirmation.is_some()
    }

    pub fn has_completion(&self) -> bool {
        self.on_completion.is_some()
    }

    pub fn has_on_error(&self) -> bool {
        self.on_error.is_some()
    }

    pub(crate) fn build_call(&self) -> Option<&BuildCallFn> {
        self.build_call.as_ref()
    }

    pub(crate) fn prerequisites(&self) -> Option<&Arc<dyn PhaseHandler>> {
        self.check_prerequisites.as_ref()
    }

    pub(crate) fn confirmation(&self) -> Option<&Arc<dyn PhaseHandler>> {
        self.check_confirmation.as_ref()
    }

    pub(crate) fn completion(&self) -> Option<&Arc<dyn PhaseHandler>> {
        self.on_completion.as_ref()
    }

    /// Ask the intent whether a failed or timed-out lifecycle should be retried.
    /// Defaults to "do not retry".
    pub(crate) fn wants_retry(&self, lifecycle: &OperationLifecycle) -> bool {
        match &self.on_error {
            Some(f) => f(lifecycle),
            None => false,
        }
    }
}

pub struct OperationIntentBuilder {
    description: String,
    payload: Option<Arc<dyn Payload>>,
    submitted_by_server: bool,
    build_call: Option<BuildCallFn>,
    check_prerequisites: Option<Arc<dyn PhaseHandler>>,
    check_confirmation: Option<Arc<dyn PhaseHandler>>,
    on_completion: Option<Arc<dyn PhaseHandler>>,
    on_error: Option<OnErrorFn>,
}

impl OperationIntentBuilder {
    pub fn payload(mut self, payload: impl Payload) -> Self {
        self.payload = Some(Arc::new(payload));
        self
    }

    pub fn shared_payload(mut self, payload: Arc<dyn Payload>) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Whether submission happens here (`true`, the default) or already
    /// happened on a client (`false`).
    pub fn submitted_by_server(mut self, yes: bool) -> Self {
        self.submitted_by_server = yes;
        self
    }

    pub fn build_call<F>(mut self, f: F) -> Self
    where
        F: Fn(&ChainHandle) -> Result<PendingCall, String> + Send + Sync + 'static,
    {
        self.build_call = Some(Arc::new(f));
        self
    }

    pub fn check_prerequisites<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Arc<OperationLifecycle>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<bool, String>> + Send + 'static,
    {
        self.check_prerequisites = Some(Arc::new(FnPhase(f)));
        self
    }

    pub fn check_confirmation<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Arc<OperationLifecycle>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<bool, String>> + Send + 'static,
    {
        self.check_confirmation = Some(Arc::new(FnPhase(f)));
        self
    }

    pub fn on_completion<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Arc<OperationLifecycle>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<bool, String>> + Send + 'static,
    {
        self.on_completion = Some(Arc::new(FnPhase(f)));
        self
    }

    /// Plug a handler object instead of a closure.
    pub fn completion_handler(mut self, handler: Arc<dyn PhaseHandler>) -> Self {
        self.on_completion = Some(handler);
        self
    }

    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&OperationLifecycle) -> bool + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(f));
        self
    }

    pub fn build(self) -> Result<OperationIntent, IntentError> {
        let payload = self.payload.ok_or(IntentError::MissingPayload)?;
        let intent = OperationIntent {
            description: self.description,
            payload,
            submitted_by_server: self.submitted_by_server,
            build_call: self.build_call,
            check_prerequisites: self.check_prerequisites,
            check_confirmation: self.check_confirmation,
            on_completion: self.on_completion,
            on_error: self.on_error,
        };
        intent.validate()?;
        Ok(intent)
    }
}

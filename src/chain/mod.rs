//! Narrow contracts with the chain: RPC client, signer and the value types
//! they exchange.
//!
//! The core never talks to a node directly. Everything it needs is behind
//! `ChainClient` (submit, look up, estimate, count) and `TransactionSigner`
//! (turn an `UnsignedTransaction` into raw bytes).
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::error::ChainError;

pub mod nonce;
pub mod simulated;

pub use nonce::NonceManager;
pub use simulated::{JsonSigner, SimulatedChain};

/// Transaction hash as returned by the node, e.g. `0xabc...`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxHash(pub String);

impl TxHash {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Encoded contract call produced by an intent's `build_call`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingCall {
    pub to: String,
    pub data: Vec<u8>,
    pub value: u128,
}

impl PendingCall {
    pub fn new(to: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            to: to.into(),
            data,
            value: 0,
        }
    }

    pub fn with_value(mut self, value: u128) -> Self {
        self.value = value;
        self
    }
}

/// Result of a transaction-by-hash lookup. `block_number` is `None` while pending.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionInfo {
    pub hash: TxHash,
    pub block_number: Option<u64>,
}

/// Receipt of a mined transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionReceipt {
    pub hash: TxHash,
    pub block_number: u64,
    /// `true` when execution succeeded, `false` when it reverted.
    pub status: bool,
    pub gas_used: u64,
}

/// Everything needed to sign a contract call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedTransaction {
    pub chain_id: u64,
    pub from: String,
    pub to: String,
    pub data: Vec<u8>,
    pub value: u128,
    pub nonce: u64,
    pub gas_limit: u64,
}

impl UnsignedTransaction {
    /// Start from a pending call; remaining fields are filled with the setters.
    pub fn from_call(call: &PendingCall) -> Self {
        Self {
            to: call.to.clone(),
            data: call.data.clone(),
            value: call.value,
            ..Default::default()
        }
    }

    pub fn chain_id(mut self, chain_id: u64) -> Self {
        self.chain_id = chain_id;
        self
    }

    pub fn from(mut self, from: impl Into<String>) -> Self {
        self.from = from.into();
        self
    }

    pub fn nonce(mut self, nonce: u64) -> Self {
        self.nonce = nonce;
        self
    }

    pub fn gas_limit(mut self, gas_limit: u64) -> Self {
        self.gas_limit = gas_limit;
        self
    }
}

/// RPC operations the lifecycle depends on.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Submit signed bytes; returns the transaction hash.
    async fn send_raw_transaction(&self, raw: Vec<u8>) -> Result<TxHash, ChainError>;
    /// `Ok(None)` when the node does not know the hash (yet).
    async fn get_transaction_by_hash(&self, hash: &TxHash) -> Result<Option<TransactionInfo>, ChainError>;
    /// `Ok(None)` until the transaction is mined.
    async fn get_transaction_receipt(&self, hash: &TxHash) -> Result<Option<TransactionReceipt>, ChainError>;
    async fn estimate_gas(&self, from: &str, call: &PendingCall) -> Result<u64, ChainError>;
    /// Number of transactions sent by `account`; must be monotonic per account.
    async fn get_transaction_count(&self, account: &str) -> Result<u64, ChainError>;
}

/// Turns an unsigned transaction into raw submission bytes.
#[async_trait]
pub trait TransactionSigner: Send + Sync {
    /// Sender address used for nonces and `from`.
    fn address(&self) -> String;
    async fn sign(&self, tx: &UnsignedTransaction) -> Result<Vec<u8>, ChainError>;
}

/// What `build_call` gets to see: the target program and the chain it lives on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainHandle {
    pub chain_id: u64,
    pub contract: String,
}

impl ChainHandle {
    pub fn new(chain_id: u64, contract: impl Into<String>) -> Self {
        Self {
            chain_id,
            contract: contract.into(),
        }
    }
}

/// Shared chain dependencies handed to every lifecycle driver.
#[derive(Clone)]
pub struct ChainContext {
    pub client: Arc<dyn ChainClient>,
    pub signer: Arc<dyn TransactionSigner>,
    pub nonces: Arc<NonceManager>,
    pub handle: ChainHandle,
}

impl ChainContext {
    pub fn new(client: Arc<dyn ChainClient>, signer: Arc<dyn TransactionSigner>, handle: ChainHandle) -> Self {
        let nonces = Arc::new(NonceManager::new(client.clone()));
        Self {
            client,
            signer,
            nonces,
            handle,
        }
    }
}

//! In-process chain used by tests and local runs.
//!
//! Every knob is scriptable: how many lookups before a transaction is mined,
//! whether receipts revert, whether the receipt disagrees with the
//! transaction about the block, transport failures and rejected submissions.
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use super::{ChainClient, PendingCall, TransactionInfo, TransactionReceipt, TransactionSigner, TxHash, UnsignedTransaction};
use crate::error::ChainError;

#[derive(Debug, Clone)]
struct SimTx {
    lookups: u32,
    block: Option<u64>,
    status: bool,
    gas_used: u64,
}

#[derive(Debug)]
struct SimInner {
    txs: HashMap<TxHash, SimTx>,
    counts: HashMap<String, u64>,
    submissions: Vec<UnsignedTransaction>,
    raw_submissions: usize,
    next_block: u64,
    next_hash: u64,
    mine_after_lookups: u32,
    revert: bool,
    stalled: bool,
    receipt_block_offset: u64,
    gas_estimate: u64,
    gas_used: u64,
    reject_next: Option<String>,
    failing_lookups: u32,
    total_lookups: usize,
}

impl Default for SimInner {
    fn default() -> Self {
        Self {
            txs: HashMap::new(),
            counts: HashMap::new(),
            submissions: Vec::new(),
            raw_submissions: 0,
            next_block: 100,
            next_hash: 1,
            mine_after_lookups: 0,
            revert: false,
            stalled: false,
            receipt_block_offset: 0,
            gas_estimate: 50_000,
            gas_used: 42_000,
            reject_next: None,
            failing_lookups: 0,
            total_lookups: 0,
        }
    }
}

#[derive(Debug, Default)]
pub struct SimulatedChain {
    inner: Mutex<SimInner>,
}

impl SimulatedChain {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut SimInner) -> R) -> R {
        let mut g = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut g)
    }

    /// Number of transaction lookups that report "pending" before the
    /// transaction is mined. Applies to transactions submitted afterwards.
    pub fn set_mine_after_lookups(&self, n: u32) {
        self.with(|s| s.mine_after_lookups = n);
    }

    /// Transactions submitted from now on produce a failed receipt.
    pub fn set_revert(&self, revert: bool) {
        self.with(|s| s.revert = revert);
    }

    /// While stalled nothing gets mined.
    pub fn set_stalled(&self, stalled: bool) {
        self.with(|s| s.stalled = stalled);
    }

    /// Receipts report `block + offset`; non-zero offsets break the cross-check.
    pub fn set_receipt_block_offset(&self, offset: u64) {
        self.with(|s| s.receipt_block_offset = offset);
    }

    pub fn set_gas_estimate(&self, gas: u64) {
        self.with(|s| s.gas_estimate = gas);
    }

    pub fn set_transaction_count(&self, account: &str, count: u64) {
        self.with(|s| {
            s.counts.insert(account.to_string(), count);
        });
    }

    /// The next `send_raw_transaction` fails with `ChainError::Rejected`.
    pub fn reject_next_submission(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.with(|s| s.reject_next = Some(reason));
    }

    /// The next `n` lookups (transaction or receipt) fail with a transport error.
    pub fn fail_next_lookups(&self, n: u32) {
        self.with(|s| s.failing_lookups = n);
    }

    /// Register a transaction submitted outside this process, already mined.
    pub fn insert_mined(&self, hash: TxHash, block: u64, status: bool) {
        self.with(|s| {
            let gas_used = s.gas_used;
            s.txs.insert(
                hash,
                SimTx {
                    lookups: 0,
                    block: Some(block),
                    status,
                    gas_used,
                },
            );
        });
    }

    /// Decoded submissions, in arrival order.
    pub fn submissions(&self) -> Vec<UnsignedTransaction> {
        self.with(|s| s.submissions.clone())
    }

    /// Raw submissions accepted, decodable or not.
    pub fn submission_count(&self) -> usize {
        self.with(|s| s.raw_submissions)
    }

    /// Transaction and receipt lookups served so far, failed ones included.
    pub fn lookup_count(&self) -> usize {
        self.with(|s| s.total_lookups)
    }

    fn take_lookup_failure(s: &mut SimInner) -> Result<(), ChainError> {
        s.total_lookups += 1;
        if s.failing_lookups > 0 {
            s.failing_lookups -= 1;
            return Err(ChainError::Transport("simulated rpc timeout".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ChainClient for SimulatedChain {
    async fn send_raw_transaction(&self, raw: Vec<u8>) -> Result<TxHash, ChainError> {
        self.with(|s| {
            if let Some(reason) = s.reject_next.take() {
                return Err(ChainError::Rejected(reason));
            }
            let hash = TxHash(format!("0x{:064x}", s.next_hash));
            s.next_hash += 1;
            s.raw_submissions += 1;
            if let Ok(tx) = serde_json::from_slice::<UnsignedTransaction>(&raw) {
                *s.counts.entry(tx.from.clone()).or_insert(0) += 1;
                s.submissions.push(tx);
            }
            let sim = SimTx {
                lookups: 0,
                block: None,
                status: !s.revert,
                gas_used: s.gas_used,
            };
            s.txs.insert(hash.clone(), sim);
            Ok(hash)
        })
    }

    async fn get_transaction_by_hash(&self, hash: &TxHash) -> Result<Option<TransactionInfo>, ChainError> {
        self.with(|s| {
            Self::take_lookup_failure(s)?;
            let mine_after = s.mine_after_lookups;
            let stalled = s.stalled;
            let mut next_block = s.next_block;
            let out = match s.txs.get_mut(hash) {
                None => None,
                Some(tx) => {
                    if tx.block.is_none() && !stalled {
                        if tx.lookups >= mine_after {
                            tx.block = Some(next_block);
                            next_block += 1;
                        } else {
                            tx.lookups += 1;
                        }
                    }
                    Some(TransactionInfo {
                        hash: hash.clone(),
                        block_number: tx.block,
                    })
                }
            };
            s.next_block = next_block;
            Ok(out)
        })
    }

    async fn get_transaction_receipt(&self, hash: &TxHash) -> Result<Option<TransactionReceipt>, ChainError> {
        self.with(|s| {
            Self::take_lookup_failure(s)?;
            let offset = s.receipt_block_offset;
            Ok(s.txs.get(hash).and_then(|tx| {
                tx.block.map(|block| TransactionReceipt {
                    hash: hash.clone(),
                    block_number: block + offset,
                    status: tx.status,
                    gas_used: tx.gas_used,
                })
            }))
        })
    }

    async fn estimate_gas(&self, _from: &str, _call: &PendingCall) -> Result<u64, ChainError> {
        Ok(self.with(|s| s.gas_estimate))
    }

    async fn get_transaction_count(&self, account: &str) -> Result<u64, ChainError> {
        Ok(self.with(|s| s.counts.get(account).copied().unwrap_or(0)))
    }
}

/// Signer that encodes the transaction as JSON instead of signing it.
/// Pairs with `SimulatedChain`, which decodes the same format.
#[derive(Debug, Clone)]
pub struct JsonSigner {
    address: String,
}

impl JsonSigner {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

#[async_trait]
impl TransactionSigner for JsonSigner {
    fn address(&self) -> String {
        self.address.clone()
    }

    async fn sign(&self, tx: &UnsignedTransaction) -> Result<Vec<u8>, ChainError> {
        serde_json::to_vec(tx).map_err(|e| ChainError::Signing(e.to_string()))
    }
}

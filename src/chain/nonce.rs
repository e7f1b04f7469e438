//! Server-wide nonce allocation.
//!
//! One async mutex covers the whole read-chain-then-increment sequence, so
//! at most one "next nonce" request is in flight at a time and two pending
//! submissions can never be handed the same value.
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use super::ChainClient;
use crate::error::ChainError;

#[derive(Debug, Default)]
struct AccountCursor {
    // next never-allocated nonce
    next: u64,
    // nonces handed back below `next`, reused lowest first
    released: BTreeSet<u64>,
}

pub struct NonceManager {
    client: Arc<dyn ChainClient>,
    cursors: Mutex<HashMap<String, AccountCursor>>,
}

impl NonceManager {
    pub fn new(client: Arc<dyn ChainClient>) -> Self {
        Self {
            client,
            cursors: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate the next nonce for `account`.
    ///
    /// Released nonces the chain has not consumed yet are reused first;
    /// otherwise the result is `max(chain transaction count, local cursor)`,
    /// which keeps nonces unique while earlier submissions are still pending.
    pub async fn next(&self, account: &str) -> Result<u64, ChainError> {
        let mut cursors = self.cursors.lock().await;
        let on_chain = self.client.get_transaction_count(account).await?;
        let cursor = cursors.entry(account.to_string()).or_default();
        cursor.released = cursor.released.split_off(&on_chain);
        let nonce = match cursor.released.pop_first() {
            Some(n) => n,
            None => {
                let n = on_chain.max(cursor.next);
                cursor.next = n + 1;
                n
            }
        };
        debug!(account, on_chain, nonce, "allocated nonce");
        Ok(nonce)
    }

    /// Hand back `nonce` after the node rejected its submission. Nonces given
    /// to other, still pending submissions are never reissued.
    pub async fn resync(&self, account: &str, nonce: u64) {
        let mut cursors = self.cursors.lock().await;
        let Some(cursor) = cursors.get_mut(account) else {
            return;
        };
        if nonce + 1 == cursor.next {
            cursor.next = nonce;
            // fold released nonces directly below the cursor back into it
            while cursor.next > 0 && cursor.released.remove(&(cursor.next - 1)) {
                cursor.next -= 1;
            }
        } else if nonce < cursor.next {
            cursor.released.insert(nonce);
        }
        debug!(account, nonce, next = cursor.next, "released nonce");
    }
}

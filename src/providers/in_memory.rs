use std::collections::BTreeMap;
use tokio::sync::Mutex;

use super::HistoryArchive;
use crate::runtime::lifecycle::LifecycleSnapshot;
use crate::LifecycleId;

/// Process-local archive. Keeps at most `cap` lineages and drops the
/// oldest one when a new lineage would exceed it.
pub struct InMemoryHistoryArchive {
    lineages: Mutex<BTreeMap<LifecycleId, Vec<LifecycleSnapshot>>>,
    cap: usize,
}

impl Default for InMemoryHistoryArchive {
    fn default() -> Self {
        Self {
            lineages: Mutex::new(BTreeMap::new()),
            cap: 1024,
        }
    }
}

impl InMemoryHistoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an archive with a custom lineage cap (useful for tests).
    pub fn with_cap(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            ..Self::default()
        }
    }
}

#[async_trait::async_trait]
impl HistoryArchive for InMemoryHistoryArchive {
    async fn store(&self, snapshot: &LifecycleSnapshot) -> Result<(), String> {
        let mut g = self.lineages.lock().await;
        if !g.contains_key(&snapshot.origin) && g.len() >= self.cap {
            // ids grow monotonically, so the first key is the oldest lineage
            g.pop_first();
        }
        let attempts = g.entry(snapshot.origin).or_default();
        if attempts.iter().any(|s| s.id == snapshot.id) {
            return Err(format!("lifecycle already archived: {}", snapshot.id));
        }
        attempts.push(snapshot.clone());
        Ok(())
    }

    async fn read(&self, id: LifecycleId) -> Option<LifecycleSnapshot> {
        let g = self.lineages.lock().await;
        g.values().flatten().find(|s| s.id == id).cloned()
    }

    async fn read_lineage(&self, origin: LifecycleId) -> Vec<LifecycleSnapshot> {
        self.lineages.lock().await.get(&origin).cloned().unwrap_or_default()
    }

    async fn list(&self) -> Vec<LifecycleId> {
        self.lineages.lock().await.keys().copied().collect()
    }
}

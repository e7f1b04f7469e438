use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;

use super::lifecycle::OperationLifecycle;
use crate::LifecycleId;

struct Entry {
    lifecycle: Arc<OperationLifecycle>,
    driver: Option<JoinHandle<()>>,
}

/// Active lifecycles and their driver tasks, plus the retry links between
/// attempts. Mutated only by `submit` and the tick.
#[derive(Default)]
pub struct LifecycleRegistry {
    active: Mutex<HashMap<LifecycleId, Entry>>,
    // old attempt -> the attempt that replaced it
    retries: Mutex<HashMap<LifecycleId, LifecycleId>>,
}

impl LifecycleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn active(&self) -> MutexGuard<'_, HashMap<LifecycleId, Entry>> {
        self.active.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn insert(&self, lifecycle: Arc<OperationLifecycle>) {
        self.active().insert(
            lifecycle.id(),
            Entry {
                lifecycle,
                driver: None,
            },
        );
    }

    /// Remember the driver task so `abort_all` can cancel it. If the
    /// lifecycle is already gone the task is left to finish on its own.
    pub fn attach_driver(&self, id: LifecycleId, driver: JoinHandle<()>) {
        if let Some(e) = self.active().get_mut(&id) {
            e.driver = Some(driver);
        }
    }

    /// Active lifecycles ordered by id.
    pub fn snapshot(&self) -> Vec<Arc<OperationLifecycle>> {
        let mut out: Vec<_> = self.active().values().map(|e| e.lifecycle.clone()).collect();
        out.sort_by_key(|lc| lc.id());
        out
    }

    pub fn get(&self, id: LifecycleId) -> Option<Arc<OperationLifecycle>> {
        self.active().get(&id).map(|e| e.lifecycle.clone())
    }

    /// Drop a finalized lifecycle. Its driver task, if still running, exits
    /// on its own once it sees the deleted flag.
    pub fn remove(&self, id: LifecycleId) -> Option<Arc<OperationLifecycle>> {
        self.active().remove(&id).map(|e| e.lifecycle)
    }

    pub fn len(&self) -> usize {
        self.active().len()
    }

    pub fn is_empty(&self) -> bool {
        self.active().is_empty()
    }

    pub fn link_retry(&self, from: LifecycleId, to: LifecycleId) {
        self.retries.lock().unwrap_or_else(|p| p.into_inner()).insert(from, to);
    }

    /// Follow retry links starting at `id`.
    pub fn latest_id(&self, id: LifecycleId) -> LifecycleId {
        let links = self.retries.lock().unwrap_or_else(|p| p.into_inner());
        let mut cur = id;
        while let Some(next) = links.get(&cur) {
            cur = *next;
        }
        cur
    }

    /// Forget the retry links leading to `last`, the final attempt of its
    /// lineage.
    pub fn prune_lineage(&self, last: LifecycleId) {
        let mut links = self.retries.lock().unwrap_or_else(|p| p.into_inner());
        let mut cur = last;
        while let Some(prev) = links.iter().find(|(_, to)| **to == cur).map(|(from, _)| *from) {
            links.remove(&prev);
            cur = prev;
        }
    }

    pub fn retry_link_count(&self) -> usize {
        self.retries.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Abort every driver task. Lifecycles stay registered for inspection.
    pub fn abort_all(&self) -> usize {
        let mut n = 0;
        for e in self.active().values_mut() {
            if let Some(j) = e.driver.take() {
                j.abort();
                n += 1;
            }
        }
        n
    }
}

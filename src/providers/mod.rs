use crate::runtime::lifecycle::LifecycleSnapshot;
use crate::LifecycleId;

pub mod fs;
pub mod in_memory;

pub use fs::FsHistoryArchive;
pub use in_memory::InMemoryHistoryArchive;

/// Storage for finalized lifecycles.
///
/// Snapshots are grouped by lineage: every attempt of one operation shares
/// the origin id of the first attempt, and attempts are kept in the order
/// they were stored.
#[async_trait::async_trait]
pub trait HistoryArchive: Send + Sync {
    /// Persist the snapshot of a finalized lifecycle.
    async fn store(&self, snapshot: &LifecycleSnapshot) -> Result<(), String>;

    /// Snapshot of one attempt, if archived.
    async fn read(&self, id: LifecycleId) -> Option<LifecycleSnapshot>;

    /// Every archived attempt of the operation started as `origin`, oldest first.
    async fn read_lineage(&self, origin: LifecycleId) -> Vec<LifecycleSnapshot>;

    /// Origin ids with at least one archived attempt, ascending.
    async fn list(&self) -> Vec<LifecycleId>;

    /// Human-readable dump of everything archived, for debugging.
    async fn dump_all_pretty(&self) -> String {
        let mut out = String::new();
        for origin in self.list().await {
            out.push_str(&format!("lineage={origin}\n"));
            for snap in self.read_lineage(origin).await {
                out.push_str(&format!(
                    "  {} attempt#{} {} ({} entries)\n",
                    snap.id,
                    snap.retry_count + 1,
                    snap.state,
                    snap.history.len()
                ));
                for line in snap.history.render() {
                    out.push_str(&format!("    {line}\n"));
                }
            }
        }
        out
    }
}

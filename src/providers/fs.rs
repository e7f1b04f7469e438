use std::path::{Path, PathBuf};
use tokio::{fs, io::AsyncWriteExt, sync::Mutex};

use super::HistoryArchive;
use crate::runtime::lifecycle::LifecycleSnapshot;
use crate::LifecycleId;

/// Filesystem archive writing one JSONL file per lineage
/// (`lc-<origin>.jsonl`), one snapshot per line.
pub struct FsHistoryArchive {
    root: PathBuf,
    // serializes appends so lines never interleave
    write_lock: Mutex<()>,
}

impl FsHistoryArchive {
    /// Create an archive rooted at the given directory path.
    /// If `reset_on_create` is true, delete any existing data under the root first.
    pub fn new(root: impl AsRef<Path>, reset_on_create: bool) -> Self {
        let path = root.as_ref().to_path_buf();
        if reset_on_create {
            let _ = std::fs::remove_dir_all(&path);
        }
        // best-effort create
        let _ = std::fs::create_dir_all(&path);
        Self {
            root: path,
            write_lock: Mutex::new(()),
        }
    }

    fn lineage_path(&self, origin: LifecycleId) -> PathBuf {
        self.root.join(format!("{origin}.jsonl"))
    }

    fn parse_origin(file_name: &str) -> Option<LifecycleId> {
        let n = file_name.strip_prefix("lc-")?.strip_suffix(".jsonl")?;
        n.parse().ok().map(LifecycleId)
    }
}

#[async_trait::async_trait]
impl HistoryArchive for FsHistoryArchive {
    async fn store(&self, snapshot: &LifecycleSnapshot) -> Result<(), String> {
        let _guard = self.write_lock.lock().await;
        fs::create_dir_all(&self.root).await.map_err(|e| e.to_string())?;
        if self
            .read_lineage(snapshot.origin)
            .await
            .iter()
            .any(|s| s.id == snapshot.id)
        {
            return Err(format!("lifecycle already archived: {}", snapshot.id));
        }
        let mut line = serde_json::to_string(snapshot).map_err(|e| e.to_string())?;
        line.push('\n');
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.lineage_path(snapshot.origin))
            .await
            .map_err(|e| e.to_string())?;
        file.write_all(line.as_bytes()).await.map_err(|e| e.to_string())?;
        file.flush().await.map_err(|e| e.to_string())?;
        Ok(())
    }

    async fn read(&self, id: LifecycleId) -> Option<LifecycleSnapshot> {
        for origin in self.list().await {
            if let Some(s) = self.read_lineage(origin).await.into_iter().find(|s| s.id == id) {
                return Some(s);
            }
        }
        None
    }

    /// Read the lineage file and deserialize each line; unreadable lines are skipped.
    async fn read_lineage(&self, origin: LifecycleId) -> Vec<LifecycleSnapshot> {
        let data = fs::read_to_string(self.lineage_path(origin)).await.unwrap_or_default();
        let mut out = Vec::new();
        for line in data.lines() {
            if line.trim().is_empty() {
                continue;
            }
            if let Ok(snap) = serde_json::from_str::<LifecycleSnapshot>(line) {
                out.push(snap);
            }
        }
        out
    }

    async fn list(&self) -> Vec<LifecycleId> {
        let mut out = Vec::new();
        if let Ok(mut rd) = fs::read_dir(&self.root).await {
            while let Ok(Some(ent)) = rd.next_entry().await {
                if let Some(origin) = ent.file_name().to_str().and_then(Self::parse_origin) {
                    out.push(origin);
                }
            }
        }
        out.sort();
        out
    }
}

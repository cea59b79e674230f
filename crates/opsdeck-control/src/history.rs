use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use opsdeck_protocol::{InvocationOutcome, InvocationRecord};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("io error: {0}")]
    Io(String),
    #[error("serialize error: {0}")]
    Serialize(String),
}

/// Explicit store configuration; nothing falls back to an ambient platform
/// location.
#[derive(Clone, Debug)]
pub struct HistoryOptions {
    /// State directory; logs live under `<root>/history/`.
    pub root: PathBuf,
    /// Bound N on each per-(target, capability) log.
    pub limit: usize,
}

impl HistoryOptions {
    pub fn new(root: impl Into<PathBuf>, limit: usize) -> Self {
        Self {
            root: root.into(),
            limit: limit.max(1),
        }
    }
}

/// On-disk form: self-describing so a log can be read without knowing which
/// key its file name hashes.
#[derive(Serialize, Deserialize)]
struct HistoryFile {
    target: String,
    capability: String,
    entries: Vec<InvocationRecord>,
}

type HistoryKey = (String, String);

/// Bounded, persisted, per-(target, capability) log of past invocations,
/// newest first. Appends enforce the bound immediately; every log is
/// persisted as one digest-named JSON file under the history directory.
pub struct ExecutionHistoryStore {
    dir: PathBuf,
    limit: usize,
    entries: Mutex<HashMap<HistoryKey, Vec<InvocationRecord>>>,
}

impl ExecutionHistoryStore {
    pub async fn open(options: HistoryOptions) -> Result<Self, HistoryError> {
        let dir = options.root.join("history");
        fs::create_dir_all(&dir)
            .await
            .map_err(|err| HistoryError::Io(err.to_string()))?;
        Ok(Self {
            dir,
            limit: options.limit,
            entries: Mutex::new(HashMap::new()),
        })
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    fn file_path(&self, target: &str, capability: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(target.as_bytes());
        hasher.update(b"\0");
        hasher.update(capability.as_bytes());
        self.dir.join(format!("{:x}.json", hasher.finalize()))
    }

    /// Append a finalized invocation, evicting the oldest entries beyond the
    /// bound. Cancelled runs are provisional by contract and are never
    /// persisted.
    pub async fn append(&self, record: InvocationRecord) -> Result<(), HistoryError> {
        if record.outcome == InvocationOutcome::Cancelled {
            debug!(
                target: "opsdeck::history",
                id = %record.id,
                "discarding cancelled invocation record"
            );
            return Ok(());
        }
        let key = (record.target.clone(), record.capability.clone());
        let mut map = self.entries.lock().await;
        let log = self.loaded_log(&mut map, &key).await;
        log.insert(0, record);
        log.truncate(self.limit);
        let snapshot = log.clone();
        self.persist(&key.0, &key.1, &snapshot).await
    }

    /// Newest-first entries for one (target, capability) pair.
    pub async fn entries(&self, target: &str, capability: &str) -> Vec<InvocationRecord> {
        let key = (target.to_string(), capability.to_string());
        let mut map = self.entries.lock().await;
        self.loaded_log(&mut map, &key).await.clone()
    }

    /// Exact-match lookup of the argument snapshot for a past invocation.
    /// Returns `None` when the id is unknown (including after a clear) and
    /// never fails; unreadable files are skipped.
    pub async fn load_for_replay(&self, id: &str) -> Option<Value> {
        {
            let map = self.entries.lock().await;
            for log in map.values() {
                if let Some(record) = log.iter().find(|record| record.id == id) {
                    return Some(record.args.clone());
                }
            }
        }

        // Fall back to logs not yet pulled into memory.
        let mut dir = match fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(err) => {
                warn!(target: "opsdeck::history", error = %err, "history scan failed");
                return None;
            }
        };
        while let Ok(Some(entry)) = dir.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(file) = read_history_file(&path).await {
                if let Some(record) = file.entries.iter().find(|record| record.id == id) {
                    return Some(record.args.clone());
                }
            }
        }
        None
    }

    /// Drop all entries for one (target, capability) pair, in memory and on
    /// disk.
    pub async fn clear(&self, target: &str, capability: &str) -> Result<(), HistoryError> {
        let key = (target.to_string(), capability.to_string());
        self.entries.lock().await.remove(&key);
        let path = self.file_path(target, capability);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(HistoryError::Io(err.to_string())),
        }
    }

    async fn loaded_log<'a>(
        &self,
        map: &'a mut HashMap<HistoryKey, Vec<InvocationRecord>>,
        key: &HistoryKey,
    ) -> &'a mut Vec<InvocationRecord> {
        if !map.contains_key(key) {
            let path = self.file_path(&key.0, &key.1);
            let mut log = match read_history_file(&path).await {
                Some(file) => file.entries,
                None => Vec::new(),
            };
            log.truncate(self.limit);
            map.insert(key.clone(), log);
        }
        map.get_mut(key).expect("history log just inserted")
    }

    async fn persist(
        &self,
        target: &str,
        capability: &str,
        entries: &[InvocationRecord],
    ) -> Result<(), HistoryError> {
        let file = HistoryFile {
            target: target.to_string(),
            capability: capability.to_string(),
            entries: entries.to_vec(),
        };
        let bytes =
            serde_json::to_vec(&file).map_err(|err| HistoryError::Serialize(err.to_string()))?;
        let path = self.file_path(target, capability);
        fs::write(&path, bytes)
            .await
            .map_err(|err| HistoryError::Io(err.to_string()))
    }
}

async fn read_history_file(path: &Path) -> Option<HistoryFile> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == ErrorKind::NotFound => return None,
        Err(err) => {
            warn!(target: "opsdeck::history", path = %path.display(), error = %err, "history read failed");
            return None;
        }
    };
    match serde_json::from_slice::<HistoryFile>(&bytes) {
        Ok(file) => Some(file),
        Err(err) => {
            warn!(
                target: "opsdeck::history",
                path = %path.display(),
                error = %err,
                "history file unreadable; treating log as empty"
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use tempfile::tempdir;

    fn record(id: &str, seq: u64) -> InvocationRecord {
        InvocationRecord {
            id: id.to_string(),
            target: "srv1".to_string(),
            capability: "search".to_string(),
            args: json!({"query": format!("q{seq}")}),
            started_at: Utc::now(),
            outcome: InvocationOutcome::Success,
            result: Some(json!({"hits": seq})),
            error: None,
            duration_ms: seq,
        }
    }

    #[tokio::test]
    async fn append_enforces_the_bound_evicting_oldest() {
        let tmp = tempdir().unwrap();
        let store = ExecutionHistoryStore::open(HistoryOptions::new(tmp.path(), 20))
            .await
            .expect("open");

        for seq in 0..25u64 {
            store
                .append(record(&format!("inv-{seq}"), seq))
                .await
                .expect("append");
        }

        let entries = store.entries("srv1", "search").await;
        assert_eq!(entries.len(), 20);
        // Newest first; the oldest five (0..5) were evicted in insertion order.
        assert_eq!(entries[0].id, "inv-24");
        assert_eq!(entries[19].id, "inv-5");
        assert!(entries.iter().all(|r| r.duration_ms >= 5));
    }

    #[tokio::test]
    async fn replay_round_trips_the_argument_snapshot() {
        let tmp = tempdir().unwrap();
        let store = ExecutionHistoryStore::open(HistoryOptions::new(tmp.path(), 20))
            .await
            .expect("open");

        let args = json!({"query": "rust", "limit": 3});
        let mut rec = record("inv-a", 1);
        rec.args = args.clone();
        store.append(rec).await.expect("append");

        assert_eq!(store.load_for_replay("inv-a").await, Some(args));
        assert_eq!(store.load_for_replay("inv-missing").await, None);
    }

    #[tokio::test]
    async fn logs_survive_reopen() {
        let tmp = tempdir().unwrap();
        {
            let store = ExecutionHistoryStore::open(HistoryOptions::new(tmp.path(), 20))
                .await
                .expect("open");
            store.append(record("inv-a", 1)).await.expect("append");
            store.append(record("inv-b", 2)).await.expect("append");
        }

        let store = ExecutionHistoryStore::open(HistoryOptions::new(tmp.path(), 20))
            .await
            .expect("reopen");
        let entries = store.entries("srv1", "search").await;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id, "inv-b");

        // Replay reads logs that were never touched in this process.
        let store = ExecutionHistoryStore::open(HistoryOptions::new(tmp.path(), 20))
            .await
            .expect("reopen again");
        assert!(store.load_for_replay("inv-a").await.is_some());
    }

    #[tokio::test]
    async fn clear_removes_log_and_replay_reports_absent() {
        let tmp = tempdir().unwrap();
        let store = ExecutionHistoryStore::open(HistoryOptions::new(tmp.path(), 20))
            .await
            .expect("open");

        store.append(record("inv-a", 1)).await.expect("append");
        store.clear("srv1", "search").await.expect("clear");

        assert!(store.entries("srv1", "search").await.is_empty());
        assert_eq!(store.load_for_replay("inv-a").await, None);
        // Clearing an absent log is not an error.
        store.clear("srv1", "search").await.expect("clear again");
    }

    #[tokio::test]
    async fn cancelled_records_are_never_persisted() {
        let tmp = tempdir().unwrap();
        let store = ExecutionHistoryStore::open(HistoryOptions::new(tmp.path(), 20))
            .await
            .expect("open");

        let mut rec = record("inv-cancelled", 1);
        rec.outcome = InvocationOutcome::Cancelled;
        store.append(rec).await.expect("append is a no-op");

        assert!(store.entries("srv1", "search").await.is_empty());
        assert_eq!(store.load_for_replay("inv-cancelled").await, None);
    }

    #[tokio::test]
    async fn unreadable_file_is_treated_as_empty() {
        let tmp = tempdir().unwrap();
        let store = ExecutionHistoryStore::open(HistoryOptions::new(tmp.path(), 20))
            .await
            .expect("open");

        let path = store.file_path("srv1", "search");
        fs::write(&path, b"not json").await.expect("write garbage");

        assert!(store.entries("srv1", "search").await.is_empty());
        store.append(record("inv-a", 1)).await.expect("append");
        assert_eq!(store.entries("srv1", "search").await.len(), 1);
    }

    #[tokio::test]
    async fn logs_are_partitioned_by_target_and_capability() {
        let tmp = tempdir().unwrap();
        let store = ExecutionHistoryStore::open(HistoryOptions::new(tmp.path(), 20))
            .await
            .expect("open");

        let mut other = record("inv-other", 1);
        other.capability = "summarize".to_string();
        store.append(record("inv-a", 1)).await.expect("append");
        store.append(other).await.expect("append");

        assert_eq!(store.entries("srv1", "search").await.len(), 1);
        assert_eq!(store.entries("srv1", "summarize").await.len(), 1);
        store.clear("srv1", "search").await.expect("clear");
        assert_eq!(store.entries("srv1", "summarize").await.len(), 1);
    }
}

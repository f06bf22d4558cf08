//! Durable storage of transfer records.
//!
//! The [`TransferStore`] trait is the persistence seam of the engine: the
//! commander discovers eligible records through it, runners and sessions
//! persist every status transition through it, and nothing else in the core
//! is durable. [`MemoryStore`] is the in-process implementation, with an
//! optional JSON snapshot for surviving restarts.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::record::{TransferRecord, UpdatedInfo, ILLEGAL_SPECIAL_ID};

/// Persistence seam for transfer records.
#[async_trait]
pub trait TransferStore: Send + Sync {
    /// Insert a record, assigning a special id when it has none yet.
    /// Returns the record's special id.
    async fn insert(&self, record: TransferRecord) -> Result<i64>;

    /// Persist the current state of a record. The record must exist.
    async fn update(&self, record: &TransferRecord) -> Result<()>;

    /// Load a record by special id.
    async fn select(&self, special_id: i64) -> Result<Option<TransferRecord>>;

    /// Records eligible for submission, oldest update first.
    async fn next_to_submit(&self, limit: usize) -> Result<Vec<TransferRecord>>;

    /// The running record matching a dedup key, if any.
    async fn find_active_by_key(
        &self,
        requested: &str,
        requester: &str,
        special_id: i64,
    ) -> Result<Option<TransferRecord>>;

    /// Startup recovery: move `Running`/`Interrupted` records back to
    /// `ToSubmit` so work cut short by a crash is rescheduled.
    async fn reset_to_submit(&self) -> Result<usize>;

    /// All records, for status inspection.
    async fn all(&self) -> Result<Vec<TransferRecord>>;
}

/// In-memory record store with JSON snapshot persistence.
pub struct MemoryStore {
    records: RwLock<HashMap<i64, TransferRecord>>,
    next_id: AtomicI64,
    snapshot_path: Option<PathBuf>,
}

impl MemoryStore {
    /// An empty store without snapshot persistence.
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            next_id: AtomicI64::new(1),
            snapshot_path: None,
        }
    }

    /// A store backed by a JSON snapshot file. Loads existing records when
    /// the file is present; the id counter resumes past the highest seen id.
    pub async fn with_snapshot(path: PathBuf) -> Result<Self> {
        let mut records = HashMap::new();
        let mut max_id = 0;
        if path.exists() {
            let contents = fs::read_to_string(&path).await?;
            let loaded: Vec<TransferRecord> = serde_json::from_str(&contents)
                .map_err(|e| Error::Store(format!("unreadable snapshot: {e}")))?;
            for record in loaded {
                max_id = max_id.max(record.special_id);
                records.insert(record.special_id, record);
            }
            tracing::debug!(count = records.len(), path = %path.display(), "Loaded record snapshot");
        }
        Ok(Self {
            records: RwLock::new(records),
            next_id: AtomicI64::new(max_id + 1),
            snapshot_path: Some(path),
        })
    }

    /// Write the snapshot when a path is configured. Atomic via a temporary
    /// file renamed into place.
    async fn save_snapshot(&self, records: &HashMap<i64, TransferRecord>) -> Result<()> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        let mut list: Vec<&TransferRecord> = records.values().collect();
        list.sort_by_key(|r| r.special_id);
        let json = serde_json::to_string_pretty(&list)
            .map_err(|e| Error::Serialization(e.to_string()))?;

        let temp_path = path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&temp_path, path).await?;
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransferStore for MemoryStore {
    async fn insert(&self, mut record: TransferRecord) -> Result<i64> {
        let mut records = self.records.write().await;
        if record.special_id == ILLEGAL_SPECIAL_ID {
            record.special_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        } else if records.contains_key(&record.special_id) {
            return Err(Error::Store(format!(
                "record {} already exists",
                record.special_id
            )));
        } else {
            // keep the counter ahead of externally assigned ids
            self.next_id
                .fetch_max(record.special_id + 1, Ordering::SeqCst);
        }
        let id = record.special_id;
        records.insert(id, record);
        self.save_snapshot(&records).await?;
        Ok(id)
    }

    async fn update(&self, record: &TransferRecord) -> Result<()> {
        let mut records = self.records.write().await;
        if !records.contains_key(&record.special_id) {
            return Err(Error::Store(format!(
                "record {} not found",
                record.special_id
            )));
        }
        records.insert(record.special_id, record.clone());
        self.save_snapshot(&records).await?;
        Ok(())
    }

    async fn select(&self, special_id: i64) -> Result<Option<TransferRecord>> {
        Ok(self.records.read().await.get(&special_id).cloned())
    }

    async fn next_to_submit(&self, limit: usize) -> Result<Vec<TransferRecord>> {
        let records = self.records.read().await;
        let mut eligible: Vec<TransferRecord> = records
            .values()
            .filter(|r| r.status == UpdatedInfo::ToSubmit)
            .cloned()
            .collect();
        eligible.sort_by_key(|r| r.updated_at);
        eligible.truncate(limit);
        Ok(eligible)
    }

    async fn find_active_by_key(
        &self,
        requested: &str,
        requester: &str,
        special_id: i64,
    ) -> Result<Option<TransferRecord>> {
        let records = self.records.read().await;
        Ok(records
            .values()
            .find(|r| {
                r.status == UpdatedInfo::Running
                    && r.requested == requested
                    && r.requester == requester
                    && r.special_id == special_id
            })
            .cloned())
    }

    async fn reset_to_submit(&self) -> Result<usize> {
        let mut records = self.records.write().await;
        let mut reset = 0;
        for record in records.values_mut() {
            if matches!(
                record.status,
                UpdatedInfo::Running | UpdatedInfo::Interrupted | UpdatedInfo::ToRun
            ) {
                record.status = UpdatedInfo::ToSubmit;
                reset += 1;
            }
        }
        if reset > 0 {
            self.save_snapshot(&records).await?;
        }
        Ok(reset)
    }

    async fn all(&self) -> Result<Vec<TransferRecord>> {
        let records = self.records.read().await;
        let mut list: Vec<TransferRecord> = records.values().cloned().collect();
        list.sort_by_key(|r| r.special_id);
        Ok(list)
    }
}

/// Default snapshot location inside a data directory.
#[must_use]
pub fn snapshot_path(data_dir: &Path) -> PathBuf {
    data_dir.join("transfers.json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::TransferMode;

    fn record(requester: &str, requested: &str) -> TransferRecord {
        TransferRecord::new(
            "backup",
            requester,
            requested,
            TransferMode::Send,
            "f.bin",
            4096,
        )
    }

    #[tokio::test]
    async fn test_insert_assigns_monotonic_ids() {
        let store = MemoryStore::new();
        let first = store.insert(record("a", "b")).await.unwrap();
        let second = store.insert(record("a", "b")).await.unwrap();
        assert!(second > first);
    }

    #[tokio::test]
    async fn test_duplicate_insert_rejected() {
        let store = MemoryStore::new();
        let mut r = record("a", "b");
        r.special_id = 7;
        store.insert(r.clone()).await.unwrap();
        assert!(store.insert(r).await.is_err());
    }

    #[tokio::test]
    async fn test_next_to_submit_orders_by_update_time() {
        let store = MemoryStore::new();
        let mut older = record("a", "b");
        older.updated_at = chrono::Utc::now() - chrono::Duration::minutes(5);
        let older_id = store.insert(older).await.unwrap();
        let _newer_id = store.insert(record("a", "c")).await.unwrap();

        let eligible = store.next_to_submit(10).await.unwrap();
        assert_eq!(eligible.len(), 2);
        assert_eq!(eligible[0].special_id, older_id);

        let limited = store.next_to_submit(1).await.unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn test_find_active_by_key_matches_running_records_only() {
        let store = MemoryStore::new();
        let id = store.insert(record("alpha", "beta")).await.unwrap();
        assert!(store
            .find_active_by_key("beta", "alpha", id)
            .await
            .unwrap()
            .is_none());

        let mut r = store.select(id).await.unwrap().unwrap();
        r.status = UpdatedInfo::Running;
        store.update(&r).await.unwrap();

        let found = store
            .find_active_by_key("beta", "alpha", id)
            .await
            .unwrap()
            .expect("running record");
        assert_eq!(found.special_id, id);
        assert!(store
            .find_active_by_key("beta", "gamma", id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_reset_to_submit_recovers_interrupted_work() {
        let store = MemoryStore::new();
        let id = store.insert(record("a", "b")).await.unwrap();
        let mut r = store.select(id).await.unwrap().unwrap();
        r.status = UpdatedInfo::Running;
        store.update(&r).await.unwrap();

        let reset = store.reset_to_submit().await.unwrap();
        assert_eq!(reset, 1);
        let r = store.select(id).await.unwrap().unwrap();
        assert_eq!(r.status, UpdatedInfo::ToSubmit);
    }

    #[tokio::test]
    async fn test_snapshot_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = snapshot_path(dir.path());

        let store = MemoryStore::with_snapshot(path.clone()).await.unwrap();
        let id = store.insert(record("a", "b")).await.unwrap();
        drop(store);

        let reloaded = MemoryStore::with_snapshot(path).await.unwrap();
        assert!(reloaded.select(id).await.unwrap().is_some());
        // ids keep increasing across restarts
        let next = reloaded.insert(record("a", "c")).await.unwrap();
        assert!(next > id);
    }
}

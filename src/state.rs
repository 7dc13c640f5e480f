//! Idempotency state persistence
//!
//! `StateStore` is the serialization point for idempotency records. The
//! contract is a read plus an atomic conditional write; the guard never
//! decides to proceed on a plain read. Stores only accept the forward
//! transitions `NotStarted → InProgress → Completed`.

use crate::error::{EdaError, Result};
use crate::types::{IdempotencyRecord, IdempotencyStatus};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, RwLock};

/// Trait for idempotency record storage backends
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Fetch an owned snapshot of the record for `key`
    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>>;

    /// Atomically set `key` to `new_status` (and `result`) if its current
    /// status is `expected`
    ///
    /// An absent key counts as `NotStarted`. Returns `false` without
    /// writing when the current status differs. A request that would not
    /// move the status forward fails with `InvalidStateTransition`.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: IdempotencyStatus,
        new_status: IdempotencyStatus,
        result: Option<serde_json::Value>,
    ) -> Result<bool>;
}

/// Apply one conditional write to a loaded record map
///
/// Shared by every store so the forward-only rule lives in one place.
fn apply_transition(
    records: &mut HashMap<String, IdempotencyRecord>,
    key: &str,
    expected: IdempotencyStatus,
    new_status: IdempotencyStatus,
    result: Option<serde_json::Value>,
) -> Result<bool> {
    let current = records
        .get(key)
        .map(|r| r.status)
        .unwrap_or(IdempotencyStatus::NotStarted);

    if !expected.can_transition_to(new_status) {
        tracing::warn!(
            key = %key,
            from = %expected,
            to = %new_status,
            "Rejected illegal state transition"
        );
        return Err(EdaError::InvalidStateTransition {
            key: key.to_string(),
            observed: current,
        });
    }
    if current != expected {
        return Ok(false);
    }

    records.insert(
        key.to_string(),
        IdempotencyRecord::new(key, new_status, result),
    );
    Ok(true)
}

/// In-memory state store
///
/// Lost on drop. The conditional write runs under a single write guard.
#[derive(Default)]
pub struct MemoryStateStore {
    records: RwLock<HashMap<String, IdempotencyRecord>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys ever claimed
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>> {
        let records = self.records.read().await;
        Ok(records.get(key).cloned())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: IdempotencyStatus,
        new_status: IdempotencyStatus,
        result: Option<serde_json::Value>,
    ) -> Result<bool> {
        let mut records = self.records.write().await;
        apply_transition(&mut records, key, expected, new_status, result)
    }
}

/// JSON file-based state store
///
/// Persists all records as one JSON object keyed by idempotency key.
/// Each conditional write holds an exclusive OS lock on a sidecar
/// `<name>.lock` file for its whole load → compare → save cycle, so any
/// number of stores and processes may share one path. Writes go to a
/// uniquely named temp file and are renamed into place; readers always
/// see a complete file.
pub struct FileStateStore {
    path: PathBuf,
    lock_path: PathBuf,
    lock: Mutex<()>,
}

impl FileStateStore {
    /// Create a new file state store at the given path
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let lock_path = path.with_extension("lock");
        Self {
            path,
            lock_path,
            lock: Mutex::new(()),
        }
    }

    /// Get the file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get the sidecar lock file path
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// Open the sidecar lock file and take an exclusive lock on it
    ///
    /// The lock is released when the returned handle is dropped.
    fn lock_exclusive(&self) -> Result<File> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                EdaError::StateStoreUnavailable(format!(
                    "Failed to create state directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.lock_path)
            .map_err(|e| {
                EdaError::StateStoreUnavailable(format!(
                    "Failed to open lock file {}: {}",
                    self.lock_path.display(),
                    e
                ))
            })?;

        fs2::FileExt::lock_exclusive(&file).map_err(|e| {
            EdaError::StateStoreUnavailable(format!(
                "Failed to lock {}: {}",
                self.lock_path.display(),
                e
            ))
        })?;
        Ok(file)
    }

    fn load(&self) -> Result<HashMap<String, IdempotencyRecord>> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }

        let json = std::fs::read_to_string(&self.path).map_err(|e| {
            EdaError::StateStoreUnavailable(format!(
                "Failed to read state file {}: {}",
                self.path.display(),
                e
            ))
        })?;

        let records: HashMap<String, IdempotencyRecord> =
            serde_json::from_str(&json).map_err(|e| {
                EdaError::StateStoreUnavailable(format!(
                    "Failed to parse state file {}: {}",
                    self.path.display(),
                    e
                ))
            })?;

        tracing::debug!(
            path = %self.path.display(),
            count = records.len(),
            "Idempotency state loaded"
        );
        Ok(records)
    }

    fn save(&self, records: &HashMap<String, IdempotencyRecord>) -> Result<()> {
        let json = serde_json::to_string_pretty(records)?;
        let tmp_path = self
            .path
            .with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));

        std::fs::write(&tmp_path, json).map_err(|e| {
            EdaError::StateStoreUnavailable(format!(
                "Failed to write state file {}: {}",
                tmp_path.display(),
                e
            ))
        })?;

        std::fs::rename(&tmp_path, &self.path).map_err(|e| {
            let _ = std::fs::remove_file(&tmp_path);
            EdaError::StateStoreUnavailable(format!(
                "Failed to rename state file {} → {}: {}",
                tmp_path.display(),
                self.path.display(),
                e
            ))
        })?;

        tracing::debug!(path = %self.path.display(), "Idempotency state saved");
        Ok(())
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>> {
        let mut records = self.load()?;
        Ok(records.remove(key))
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: IdempotencyStatus,
        new_status: IdempotencyStatus,
        result: Option<serde_json::Value>,
    ) -> Result<bool> {
        // Tasks of this instance queue here instead of blocking threads on
        // the OS lock; the OS lock is never held across an await.
        let _guard = self.lock.lock().await;
        let _file_lock = self.lock_exclusive()?;

        let mut records = self.load()?;
        let written = apply_transition(&mut records, key, expected, new_status, result)?;
        if written {
            self.save(&records)?;
        }
        Ok(written)
    }
}

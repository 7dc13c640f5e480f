//! Claim-check collaborators
//!
//! Large payloads go to a `BlobStore`; the message carries only a
//! `ClaimCheck` (reference plus small attributes). `RecordStore` holds
//! records that are stored first and enriched later by reference, and
//! `project` cuts a record down to an allow-list of fields.

use crate::error::{EdaError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Trait for blob storage backends
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `bytes`, returning an opaque reference
    async fn put(&self, bytes: Bytes) -> Result<String>;

    /// Fetch the bytes behind `reference`
    async fn get(&self, reference: &str) -> Result<Bytes>;
}

/// In-memory blob store
///
/// References are UUID v4 hex strings.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, Bytes>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blobs.read().await.is_empty()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, bytes: Bytes) -> Result<String> {
        let reference = uuid::Uuid::new_v4().simple().to_string();
        let size = bytes.len();
        self.blobs.write().await.insert(reference.clone(), bytes);
        tracing::debug!(reference = %reference, size, "Blob stored");
        Ok(reference)
    }

    async fn get(&self, reference: &str) -> Result<Bytes> {
        self.blobs
            .read()
            .await
            .get(reference)
            .cloned()
            .ok_or_else(|| EdaError::NotFound(format!("Blob not found: {}", reference)))
    }
}

/// Reference to a stored payload, carried in place of the payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimCheck {
    /// Blob store reference
    pub reference: String,

    /// Small attributes that travel with the reference (e.g. star rating)
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

impl ClaimCheck {
    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_value(value: &Value) -> Result<Self> {
        Ok(serde_json::from_value(value.clone())?)
    }
}

/// Store `content` and return a claim check for it
///
/// Empty or whitespace-only content is not stored and yields `None`.
/// UTF-8 content counts as blank when it is all Unicode whitespace; other
/// bytes count as blank only when they are all ASCII whitespace.
pub async fn check_in(
    store: &dyn BlobStore,
    content: impl Into<Bytes>,
    attributes: Map<String, Value>,
) -> Result<Option<ClaimCheck>> {
    let content = content.into();
    let blank = match std::str::from_utf8(&content) {
        Ok(text) => text.trim().is_empty(),
        Err(_) => content.iter().all(u8::is_ascii_whitespace),
    };
    if blank {
        tracing::debug!("Skipping check-in of blank content");
        return Ok(None);
    }

    let reference = store.put(content).await?;
    Ok(Some(ClaimCheck {
        reference,
        attributes,
    }))
}

/// Resolve a claim check back to its payload
pub async fn redeem(store: &dyn BlobStore, ticket: &ClaimCheck) -> Result<Bytes> {
    store.get(&ticket.reference).await
}

/// Enrichment status of a stored record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RecordStatus {
    /// Stored, waiting for enrichment
    Pending,
    /// Enriched at least once
    Ok,
}

/// Owned snapshot of a record held by a `RecordStore`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub status: RecordStatus,
    pub fields: Map<String, Value>,
}

/// Store-first, enrich-later record store
///
/// Callers get a reference back and enrich through `update`; no mutable
/// alias to a stored record ever leaves the store.
#[derive(Default)]
pub struct RecordStore {
    records: RwLock<HashMap<String, StoredRecord>>,
}

impl RecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `fields` as a pending record and return its reference
    pub async fn store_pending(&self, fields: Map<String, Value>) -> String {
        let reference = uuid::Uuid::new_v4().simple().to_string();
        self.records.write().await.insert(
            reference.clone(),
            StoredRecord {
                status: RecordStatus::Pending,
                fields,
            },
        );
        tracing::debug!(reference = %reference, "Record stored as pending");
        reference
    }

    /// Merge `fields` into an existing record and mark it `Ok`
    pub async fn update(&self, reference: &str, fields: Map<String, Value>) -> Result<()> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(reference)
            .ok_or_else(|| EdaError::NotFound(format!("Record not found: {}", reference)))?;
        record.fields.extend(fields);
        record.status = RecordStatus::Ok;
        tracing::debug!(reference = %reference, "Record enriched");
        Ok(())
    }

    /// Merge `fields` into the record at `reference`, creating it if absent
    pub async fn upsert(&self, reference: &str, fields: Map<String, Value>) {
        let mut records = self.records.write().await;
        let record = records
            .entry(reference.to_string())
            .or_insert_with(|| StoredRecord {
                status: RecordStatus::Ok,
                fields: Map::new(),
            });
        record.fields.extend(fields);
        record.status = RecordStatus::Ok;
    }

    /// Owned snapshot of the record at `reference`
    pub async fn get(&self, reference: &str) -> Option<StoredRecord> {
        self.records.read().await.get(reference).cloned()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

/// Keep only the allow-listed `fields` of `record`
///
/// Fields missing from the record are skipped. The result does not depend
/// on the order of `fields`.
pub fn project<'a, I>(record: &Map<String, Value>, fields: I) -> Map<String, Value>
where
    I: IntoIterator<Item = &'a str>,
{
    fields
        .into_iter()
        .filter_map(|field| {
            record
                .get(field)
                .map(|value| (field.to_string(), value.clone()))
        })
        .collect()
}

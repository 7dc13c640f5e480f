//! Core types for the eda-core system
//!
//! All serialized types use camelCase JSON for wire compatibility.

use crate::error::Result;
use crate::key::derive_key;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Processing status of one logical unit of work
///
/// Ordered so that a legal transition always goes from a smaller to a
/// larger value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum IdempotencyStatus {
    /// Never observed, or observed but not yet claimed
    #[default]
    #[serde(rename = "NOTSTARTED")]
    NotStarted,
    /// Claimed by a worker; business logic is running (or crashed)
    #[serde(rename = "INPROGRESS")]
    InProgress,
    /// Business logic returned; result is cached
    #[serde(rename = "COMPLETED")]
    Completed,
}

impl IdempotencyStatus {
    /// Whether moving from `self` to `next` keeps the status monotonic
    pub fn can_transition_to(self, next: IdempotencyStatus) -> bool {
        matches!(
            (self, next),
            (IdempotencyStatus::NotStarted, IdempotencyStatus::InProgress)
                | (IdempotencyStatus::InProgress, IdempotencyStatus::Completed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IdempotencyStatus::NotStarted => "NOTSTARTED",
            IdempotencyStatus::InProgress => "INPROGRESS",
            IdempotencyStatus::Completed => "COMPLETED",
        }
    }
}

impl fmt::Display for IdempotencyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of one idempotency key as held by a `StateStore`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdempotencyRecord {
    /// Idempotency key this record belongs to
    pub key: String,

    /// Current processing status
    pub status: IdempotencyStatus,

    /// Cached output, present only once `status` is `Completed`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,

    /// Unix timestamp in milliseconds of the last transition
    #[serde(default)]
    pub updated_at: u64,
}

impl IdempotencyRecord {
    /// Create a record in the given status, stamped with the current time
    pub fn new(
        key: impl Into<String>,
        status: IdempotencyStatus,
        result: Option<serde_json::Value>,
    ) -> Self {
        Self {
            key: key.into(),
            status,
            result,
            updated_at: now_millis(),
        }
    }

    pub fn is_in_progress(&self) -> bool {
        self.status == IdempotencyStatus::InProgress
    }

    pub fn is_completed(&self) -> bool {
        self.status == IdempotencyStatus::Completed
    }
}

/// Delivery metadata attached once by the producer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    /// Key derived from the original payload; consumers never recompute it
    pub idempotency_key: String,

    /// Logical timestamp used to re-sequence out-of-order deliveries
    pub ordering_key: DateTime<Utc>,
}

/// A message as carried by the event bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Business payload (or a serialized claim check)
    pub data: serde_json::Value,

    /// Delivery metadata
    pub metadata: Metadata,
}

impl Message {
    /// Build a message, deriving its idempotency key from `data`
    pub fn new(data: serde_json::Value, ordering_key: DateTime<Utc>) -> Result<Self> {
        let idempotency_key = derive_key(&data)?.into_string();
        Ok(Self {
            data,
            metadata: Metadata {
                idempotency_key,
                ordering_key,
            },
        })
    }

    /// Idempotency key carried in the metadata
    pub fn idempotency_key(&self) -> &str {
        &self.metadata.idempotency_key
    }

    /// Ordering key carried in the metadata
    pub fn ordering_key(&self) -> DateTime<Utc> {
        self.metadata.ordering_key
    }
}

pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

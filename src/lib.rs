//! # eda-core
//!
//! Idempotent consumer and ordered delivery core for event-driven systems.
//!
//! ## Overview
//!
//! At-least-once transports redeliver and reorder messages. `eda-core`
//! provides the two pieces a consumer needs to tolerate that:
//!
//! - **IdempotencyGuard** — runs business logic at most once per
//!   idempotency key and returns the cached result to redeliveries
//! - **OrderedEventBuffer** — keeps arrival history and derives a view
//!   sorted by ordering key
//!
//! ## Quick Start
//!
//! ```rust
//! use eda_core::{IdempotencyGuard, MemoryStateStore};
//! use std::sync::Arc;
//!
//! # async fn example() -> eda_core::Result<()> {
//! let guard = IdempotencyGuard::new(Arc::new(MemoryStateStore::new()));
//! let key = eda_core::derive_key(&serde_json::json!({"order": 42}))?;
//!
//! let first = guard.run(key.as_str(), || async { Ok(serde_json::json!({"x": 1})) }).await?;
//! let again = guard.run(key.as_str(), || async { Ok(serde_json::json!({"x": 2})) }).await?;
//! assert_eq!(first, again);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **StateStore** trait — atomic conditional writes, the serialization point
//! - **Consumer** — guard then buffer, so duplicates never reach the buffer
//! - **BlobStore** / **ClaimCheck** — large payloads travel by reference

pub mod claim_check;
pub mod classify;
pub mod error;
pub mod idempotency;
pub mod key;
pub mod ordering;
pub mod pipeline;
pub mod state;
pub mod types;

// Re-export core types
pub use error::{EdaError, Result};
pub use idempotency::{Decision, IdempotencyGuard, Outcome};
pub use key::{derive_key, to_canonical_json, IdempotencyKey};
pub use ordering::{OrderedEvent, OrderedEventBuffer};
pub use state::{FileStateStore, MemoryStateStore, StateStore};
pub use types::{IdempotencyRecord, IdempotencyStatus, Message, Metadata};

// Re-export pipeline and claim-check collaborators for convenience
pub use claim_check::{
    check_in, project, redeem, BlobStore, ClaimCheck, MemoryBlobStore, RecordStatus, RecordStore,
    StoredRecord,
};
pub use classify::{
    classify_sentiment, count_words, route_by_length, ClassifierConfig, FeedbackHandler, Feeling,
    LengthRoute,
};
pub use pipeline::{
    Consumer, Delivery, EchoHandler, Handler, MessageBroker, Producer, Publication, Subscriber,
};

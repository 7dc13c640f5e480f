//! Idempotent consumer guard
//!
//! `IdempotencyGuard` runs side-effecting business logic at most once per
//! idempotency key. Each key moves `NotStarted → InProgress → Completed`
//! through conditional writes on the backing `StateStore`; redeliveries of a
//! completed key get the cached result back.
//!
//! A business function that fails after `begin` returned `Proceed` leaves the
//! key `InProgress`. Later deliveries observe `OperationInProgress` until an
//! external reaper resets the record; the guard does not roll back.

use crate::error::{EdaError, Result};
use crate::state::StateStore;
use crate::types::IdempotencyStatus;
use std::future::Future;
use std::sync::Arc;

/// What the caller should do with a delivery
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// This caller claimed the key and must run the business logic
    Proceed,
    /// Another caller holds the key right now
    RejectInProgress,
    /// The key already completed; here is its result
    ReturnCached(serde_json::Value),
}

/// Result of `IdempotencyGuard::run_with_outcome`
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Business logic ran during this call
    Executed(serde_json::Value),
    /// Business logic ran earlier; the cached result was returned
    Cached(serde_json::Value),
}

impl Outcome {
    pub fn into_value(self) -> serde_json::Value {
        match self {
            Outcome::Executed(v) | Outcome::Cached(v) => v,
        }
    }

    pub fn was_executed(&self) -> bool {
        matches!(self, Outcome::Executed(_))
    }
}

/// At-most-once execution guard backed by a pluggable state store
#[derive(Clone)]
pub struct IdempotencyGuard {
    store: Arc<dyn StateStore>,
}

impl IdempotencyGuard {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// Current status of `key`; absent keys report `NotStarted`
    pub async fn status(&self, key: &str) -> Result<IdempotencyStatus> {
        Ok(self
            .store
            .get(key)
            .await?
            .map(|r| r.status)
            .unwrap_or_default())
    }

    /// Try to claim `key` for processing
    pub async fn begin(&self, key: &str) -> Result<Decision> {
        if let Some(decision) = self.observe(key).await? {
            return Ok(decision);
        }

        let claimed = self
            .store
            .compare_and_set(
                key,
                IdempotencyStatus::NotStarted,
                IdempotencyStatus::InProgress,
                None,
            )
            .await?;

        if claimed {
            tracing::debug!(key = %key, "Idempotency key claimed");
            return Ok(Decision::Proceed);
        }

        // Lost the claim to a concurrent caller
        match self.observe(key).await? {
            Some(decision) => Ok(decision),
            None => {
                tracing::warn!(
                    key = %key,
                    "Claim failed but record reads as not started; rejecting"
                );
                Ok(Decision::RejectInProgress)
            }
        }
    }

    /// Mark a claimed key as completed and cache its result
    pub async fn complete(&self, key: &str, result: serde_json::Value) -> Result<()> {
        let completed = self
            .store
            .compare_and_set(
                key,
                IdempotencyStatus::InProgress,
                IdempotencyStatus::Completed,
                Some(result),
            )
            .await?;

        if !completed {
            let observed = self.status(key).await?;
            return Err(EdaError::InvalidStateTransition {
                key: key.to_string(),
                observed,
            });
        }

        tracing::debug!(key = %key, "Idempotency key completed");
        Ok(())
    }

    /// Run `business_fn` at most once for `key`, returning its result
    pub async fn run<F, Fut>(&self, key: &str, business_fn: F) -> Result<serde_json::Value>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<serde_json::Value>>,
    {
        self.run_with_outcome(key, business_fn)
            .await
            .map(Outcome::into_value)
    }

    /// Like `run`, but reports whether the business logic executed
    pub async fn run_with_outcome<F, Fut>(&self, key: &str, business_fn: F) -> Result<Outcome>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<serde_json::Value>>,
    {
        match self.begin(key).await? {
            Decision::Proceed => {
                let result = match business_fn().await {
                    Ok(result) => result,
                    Err(e) => {
                        tracing::warn!(
                            key = %key,
                            error = %e,
                            "Business logic failed; key left in progress"
                        );
                        return Err(e);
                    }
                };
                self.complete(key, result.clone()).await?;
                Ok(Outcome::Executed(result))
            }
            Decision::ReturnCached(result) => {
                tracing::info!(key = %key, "Key already completed, returning cached result");
                Ok(Outcome::Cached(result))
            }
            Decision::RejectInProgress => {
                tracing::warn!(key = %key, "Key is in progress elsewhere");
                Err(EdaError::OperationInProgress {
                    key: key.to_string(),
                })
            }
        }
    }

    async fn observe(&self, key: &str) -> Result<Option<Decision>> {
        let decision = match self.store.get(key).await? {
            Some(record) if record.is_completed() => Some(Decision::ReturnCached(
                record.result.unwrap_or(serde_json::Value::Null),
            )),
            Some(record) if record.is_in_progress() => Some(Decision::RejectInProgress),
            _ => None,
        };
        Ok(decision)
    }
}

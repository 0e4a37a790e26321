//! Phase checkpoints for handlers with several non-atomic side effects.
//!
//! The middleware puts a [`PhaseManager`] bound to the request's key into
//! the request extensions. It only helps when an attempt failed part-way
//! and a retry with the same key reclaimed the lock; cached replays never
//! re-enter the handler.
//!
//! Handlers must be written as an ordered list of named phases, each one
//! consulting the manager before doing its work. Nothing here can enforce
//! that structure:
//!
//! ```ignore
//! async fn create_order(Extension(phases): Extension<PhaseManager>, ..) -> .. {
//!     phases.run("validated", || validate(&req)).await?;
//!     phases.run("inventory_reserved", || reserve(&req)).await?;
//!     let order = phases.run("order_created", || insert(&req)).await?;
//!     phases.run("notified", || publish(&order)).await?;
//! }
//! ```
//!
//! A skipped phase yields [`PhaseRun::Skipped`]; steps whose output later
//! phases need must be able to recompute or look it up.

use crate::clock::Clock;
use crate::error::{PhaseError, StoreError};
use crate::store::KeyStore;
use std::future::Future;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseRun<T> {
    Ran(T),
    /// Checkpointed by an earlier attempt; the step was not run.
    Skipped,
}

impl<T> PhaseRun<T> {
    pub fn ran(self) -> Option<T> {
        match self {
            Self::Ran(v) => Some(v),
            Self::Skipped => None,
        }
    }

    pub fn was_skipped(&self) -> bool {
        matches!(self, Self::Skipped)
    }
}

#[derive(Clone)]
struct Binding {
    store: Arc<dyn KeyStore>,
    clock: Arc<dyn Clock>,
    service_id: String,
    key: String,
}

/// Checkpoint reader/writer bound to one (service, key).
#[derive(Clone)]
pub struct PhaseManager {
    binding: Option<Binding>,
}

impl PhaseManager {
    pub fn new(
        store: Arc<dyn KeyStore>,
        clock: Arc<dyn Clock>,
        service_id: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            binding: Some(Binding {
                store,
                clock,
                service_id: service_id.into(),
                key: key.into(),
            }),
        }
    }

    /// For requests that carry no key: every step runs, nothing is recorded.
    pub fn disabled() -> Self {
        Self { binding: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.binding.is_some()
    }

    pub fn key(&self) -> Option<&str> {
        self.binding.as_ref().map(|b| b.key.as_str())
    }

    /// Record `phase` as done. `Ok(false)` if it already was (or disabled).
    pub async fn checkpoint(&self, phase: &str) -> Result<bool, StoreError> {
        let Some(b) = &self.binding else {
            return Ok(false);
        };
        let added = b
            .store
            .append_checkpoint(&b.service_id, &b.key, phase, b.clock.now())
            .await?;
        tracing::debug!(service = %b.service_id, key = %b.key, phase, added, "phase checkpoint");
        Ok(added)
    }

    pub async fn has_completed(&self, phase: &str) -> Result<bool, StoreError> {
        let Some(b) = &self.binding else {
            return Ok(false);
        };
        Ok(b.store
            .get(&b.service_id, &b.key, b.clock.now())
            .await?
            .is_some_and(|r| r.has_checkpoint(phase)))
    }

    /// Names of checkpointed phases, in completion order.
    pub async fn completed_phases(&self) -> Result<Vec<String>, StoreError> {
        let Some(b) = &self.binding else {
            return Ok(Vec::new());
        };
        Ok(b.store
            .get(&b.service_id, &b.key, b.clock.now())
            .await?
            .map(|r| r.phase_checkpoints.into_iter().map(|c| c.name).collect())
            .unwrap_or_default())
    }

    /// Skip `phase` if checkpointed, else run `step` and checkpoint on success.
    /// A failing step leaves no checkpoint.
    pub async fn run<T, E, F, Fut>(&self, phase: &str, step: F) -> Result<PhaseRun<T>, PhaseError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if self.has_completed(phase).await? {
            tracing::info!(key = ?self.key(), phase, "phase already completed, skipping");
            return Ok(PhaseRun::Skipped);
        }
        let value = step().await.map_err(PhaseError::Step)?;
        self.checkpoint(phase).await?;
        Ok(PhaseRun::Ran(value))
    }
}

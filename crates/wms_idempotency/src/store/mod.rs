//! Key Store and Message Dedup Store contracts.
//!
//! Every method is one round-trip and every mutating method is a single
//! atomic conditional write in the backend:
//!
//! | operation           | guard                                              |
//! |---------------------|----------------------------------------------------|
//! | `insert_if_absent`  | unique (service_id, key); expired rows replaceable |
//! | `reclaim`           | status == expected AND lock_token == expected      |
//! | `complete` / `fail` | status == in_progress AND lock_token == holder's   |
//! | `append_checkpoint` | phase name not yet present                         |
//! | `mark_consumed`     | unique (message_id, service_name, consumer_group)  |
//!
//! Implementations must not read-then-write outside such a guard.

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use crate::clock::Clock;
use crate::error::StoreError;
use crate::record::{ConsumedMessageRecord, IdempotencyRecord, RecordStatus, StoredResponse};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

pub use memory::{MemoryKeyStore, MemoryMessageStore};
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A live record already holds the key; returned as found.
    Existing(IdempotencyRecord),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    Recorded,
    /// The unique index rejected the insert: another consumer got there first.
    AlreadyRecorded,
}

#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Create the table, the unique (service_id, key) index and the expiry
    /// index. Safe to call on every startup.
    async fn ensure_indexes(&self) -> Result<(), StoreError>;

    /// Insert `record` unless a live record exists for its (service_id, key).
    /// An expired record counts as absent and is overwritten.
    async fn insert_if_absent(
        &self,
        record: &IdempotencyRecord,
        now: DateTime<Utc>,
    ) -> Result<InsertOutcome, StoreError>;

    /// Take over an abandoned or failed record: set `InProgress`,
    /// `lock_acquired_at = now`, `lock_token = new_token`, but only while the
    /// stored status and token still equal the expected ones. `None` means
    /// the race was lost.
    async fn reclaim(
        &self,
        service_id: &str,
        key: &str,
        expected_status: RecordStatus,
        expected_token: &str,
        new_token: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<IdempotencyRecord>, StoreError>;

    /// `InProgress -> Completed` for the current lock holder. `false` if the
    /// lock was lost (reclaimed or expired).
    async fn complete(
        &self,
        service_id: &str,
        key: &str,
        lock_token: &str,
        response: &StoredResponse,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// `InProgress -> Failed` for the current lock holder.
    async fn fail(
        &self,
        service_id: &str,
        key: &str,
        lock_token: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Append a phase checkpoint. `Ok(false)` when the phase was already
    /// recorded; `NotFound` when no live record exists.
    async fn append_checkpoint(
        &self,
        service_id: &str,
        key: &str,
        phase: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// The live record for a key, if any.
    async fn get(
        &self,
        service_id: &str,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<IdempotencyRecord>, StoreError>;

    /// Delete records whose `expires_at` has passed. Returns the count.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn ensure_indexes(&self) -> Result<(), StoreError>;

    async fn is_consumed(
        &self,
        message_id: &str,
        service_name: &str,
        consumer_group: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn mark_consumed(
        &self,
        record: &ConsumedMessageRecord,
        now: DateTime<Utc>,
    ) -> Result<MarkOutcome, StoreError>;

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// Periodically delete expired records from both stores, for backends
/// without a native TTL index.
pub fn spawn_purge_task(
    keys: Arc<dyn KeyStore>,
    messages: Arc<dyn MessageStore>,
    clock: Arc<dyn Clock>,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let now = clock.now();
            match keys.purge_expired(now).await {
                Ok(0) => {}
                Ok(n) => tracing::debug!(purged = n, "expired idempotency keys removed"),
                Err(e) => tracing::error!(error = %e, "idempotency key purge failed"),
            }
            match messages.purge_expired(now).await {
                Ok(0) => {}
                Ok(n) => tracing::debug!(purged = n, "expired consumed-message records removed"),
                Err(e) => tracing::error!(error = %e, "consumed-message purge failed"),
            }
        }
    })
}

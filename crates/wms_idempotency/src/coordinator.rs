//! Lock Coordinator: decides, in one or two conditional writes, whether a
//! keyed request runs, replays, or is refused.
//!
//! 1. `insert_if_absent` a fresh `InProgress` record. Inserted: `Acquired`.
//! 2. Otherwise inspect the existing record:
//!    - fingerprint differs: `Mismatch` (whatever the status);
//!    - `Completed`: `ServeCached`;
//!    - `InProgress`, lock younger than the timeout: `Conflict`;
//!    - `InProgress` stale, or `Failed`: `reclaim` conditioned on the
//!      token we just read. Won: `Acquired`. Lost: `Conflict`.
//!
//! Store errors are returned as `Err` and never folded into an outcome.

use crate::clock::Clock;
use crate::config::IdempotencyConfig;
use crate::error::StoreError;
use crate::fingerprint::Fingerprint;
use crate::record::{new_lock_token, IdempotencyRecord, RecordStatus, StoredResponse};
use crate::store::{InsertOutcome, KeyStore};
use std::sync::Arc;
use std::time::Duration;

/// Proof of lock ownership; required to complete or fail the record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    pub service_id: String,
    pub key: String,
    pub lock_token: String,
    /// Taken over from a crashed holder or a failed attempt.
    pub reclaimed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired(LockHandle),
    ServeCached(StoredResponse),
    Conflict { lock_age: Duration },
    Mismatch,
}

impl AcquireOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Acquired(_) => "acquired",
            Self::ServeCached(_) => "serve_cached",
            Self::Conflict { .. } => "conflict",
            Self::Mismatch => "mismatch",
        }
    }
}

/// The record as seen by the decision, plus the decision.
#[derive(Debug, Clone)]
pub struct Acquisition {
    pub record: IdempotencyRecord,
    pub outcome: AcquireOutcome,
}

#[derive(Clone)]
pub struct LockCoordinator {
    store: Arc<dyn KeyStore>,
    clock: Arc<dyn Clock>,
    lock_timeout: Duration,
    retention: Duration,
}

impl LockCoordinator {
    pub fn new(
        store: Arc<dyn KeyStore>,
        clock: Arc<dyn Clock>,
        lock_timeout: Duration,
        retention: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            lock_timeout,
            retention,
        }
    }

    pub fn from_config(
        store: Arc<dyn KeyStore>,
        clock: Arc<dyn Clock>,
        config: &IdempotencyConfig,
    ) -> Self {
        Self::new(store, clock, config.lock_timeout, config.retention_period)
    }

    pub fn store(&self) -> &Arc<dyn KeyStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub async fn acquire_or_inspect(
        &self,
        service_id: &str,
        key: &str,
        method: &str,
        path: &str,
        fingerprint: &Fingerprint,
    ) -> Result<Acquisition, StoreError> {
        self.acquire_for_user(service_id, key, None, method, path, fingerprint)
            .await
    }

    /// [`Self::acquire_or_inspect`], recording `user_id` on a fresh record.
    /// The user is metadata: it does not take part in key uniqueness or in
    /// the mismatch check.
    pub async fn acquire_for_user(
        &self,
        service_id: &str,
        key: &str,
        user_id: Option<&str>,
        method: &str,
        path: &str,
        fingerprint: &Fingerprint,
    ) -> Result<Acquisition, StoreError> {
        let now = self.clock.now();
        let fresh = IdempotencyRecord::in_progress(
            service_id,
            key,
            method,
            path,
            fingerprint.clone(),
            now,
            self.retention,
        )
        .with_user(user_id.map(str::to_string));

        let existing = match self.store.insert_if_absent(&fresh, now).await? {
            InsertOutcome::Inserted => {
                let handle = LockHandle {
                    service_id: service_id.to_string(),
                    key: key.to_string(),
                    lock_token: fresh.lock_token.clone(),
                    reclaimed: false,
                };
                return Ok(Acquisition {
                    record: fresh,
                    outcome: AcquireOutcome::Acquired(handle),
                });
            }
            InsertOutcome::Existing(record) => record,
        };

        if existing.request_fingerprint != *fingerprint {
            return Ok(Acquisition {
                record: existing,
                outcome: AcquireOutcome::Mismatch,
            });
        }

        match existing.status {
            RecordStatus::Completed => {
                let response = existing.response.clone().ok_or_else(|| {
                    StoreError::Corrupt(format!(
                        "completed record {service_id}/{key} has no response"
                    ))
                })?;
                Ok(Acquisition {
                    record: existing,
                    outcome: AcquireOutcome::ServeCached(response),
                })
            }
            RecordStatus::InProgress if !existing.is_lock_stale(now, self.lock_timeout) => {
                let lock_age = existing
                    .lock_age(now)
                    .and_then(|age| age.to_std().ok())
                    .unwrap_or_default();
                Ok(Acquisition {
                    record: existing,
                    outcome: AcquireOutcome::Conflict { lock_age },
                })
            }
            status => self.reclaim(existing, status, now).await,
        }
    }

    async fn reclaim(
        &self,
        existing: IdempotencyRecord,
        status: RecordStatus,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<Acquisition, StoreError> {
        let new_token = new_lock_token();
        let lock_age_ms = existing.lock_age(now).map(|a| a.num_milliseconds());
        let won = self
            .store
            .reclaim(
                &existing.service_id,
                &existing.key,
                status,
                &existing.lock_token,
                &new_token,
                now,
            )
            .await?;

        match won {
            Some(record) => {
                tracing::info!(
                    service = %record.service_id,
                    key = %record.key,
                    previous_status = %status,
                    lock_age_ms = ?lock_age_ms,
                    "idempotency lock reclaimed"
                );
                let handle = LockHandle {
                    service_id: record.service_id.clone(),
                    key: record.key.clone(),
                    lock_token: new_token,
                    reclaimed: true,
                };
                Ok(Acquisition {
                    record,
                    outcome: AcquireOutcome::Acquired(handle),
                })
            }
            None => Ok(Acquisition {
                record: existing,
                outcome: AcquireOutcome::Conflict {
                    lock_age: Duration::ZERO,
                },
            }),
        }
    }

    /// Store the handler's response. `false` means the lock was lost and the
    /// response was discarded.
    pub async fn complete(
        &self,
        handle: &LockHandle,
        response: &StoredResponse,
    ) -> Result<bool, StoreError> {
        let stored = self
            .store
            .complete(
                &handle.service_id,
                &handle.key,
                &handle.lock_token,
                response,
                self.clock.now(),
            )
            .await?;
        if !stored {
            tracing::warn!(
                service = %handle.service_id,
                key = %handle.key,
                "idempotency lock lost before completion; response not stored"
            );
        }
        Ok(stored)
    }

    /// Mark the attempt failed so the key can be retried at once.
    pub async fn fail(&self, handle: &LockHandle) -> Result<bool, StoreError> {
        let marked = self
            .store
            .fail(
                &handle.service_id,
                &handle.key,
                &handle.lock_token,
                self.clock.now(),
            )
            .await?;
        if !marked {
            tracing::warn!(
                service = %handle.service_id,
                key = %handle.key,
                "idempotency lock lost before failure could be recorded"
            );
        }
        Ok(marked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::fingerprint::fingerprint;
    use crate::record::CachedResponse;
    use crate::store::MemoryKeyStore;
    use std::collections::BTreeMap;

    const TIMEOUT: Duration = Duration::from_secs(300);
    const RETENTION: Duration = Duration::from_secs(86_400);

    fn setup() -> (LockCoordinator, ManualClock, MemoryKeyStore) {
        let clock = ManualClock::starting_now();
        let store = MemoryKeyStore::new();
        let coord = LockCoordinator::new(
            Arc::new(store.clone()),
            Arc::new(clock.clone()),
            TIMEOUT,
            RETENTION,
        );
        (coord, clock, store)
    }

    fn order_fp(qty: u32) -> Fingerprint {
        fingerprint("POST", "/v1/orders", format!(r#"{{"sku":"X","qty":{qty}}}"#).as_bytes())
    }

    async fn acquire(coord: &LockCoordinator, key: &str, fp: &Fingerprint) -> AcquireOutcome {
        coord
            .acquire_or_inspect("order-service", key, "POST", "/v1/orders", fp)
            .await
            .unwrap()
            .outcome
    }

    fn created() -> StoredResponse {
        StoredResponse::Cached(CachedResponse {
            status_code: 201,
            headers: BTreeMap::new(),
            body: br#"{"orderId":"ORD-1"}"#.to_vec(),
        })
    }

    fn handle_of(outcome: AcquireOutcome) -> LockHandle {
        match outcome {
            AcquireOutcome::Acquired(h) => h,
            other => panic!("expected acquired, got {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn only_one_concurrent_caller_acquires() {
        let (coord, _, _) = setup();
        let fp = order_fp(2);
        let mut tasks = Vec::new();
        for _ in 0..32 {
            let coord = coord.clone();
            let fp = fp.clone();
            tasks.push(tokio::spawn(async move { acquire(&coord, "dup-1", &fp).await }));
        }
        let mut acquired = 0;
        let mut conflicts = 0;
        for t in tasks {
            match t.await.unwrap() {
                AcquireOutcome::Acquired(_) => acquired += 1,
                AcquireOutcome::Conflict { .. } => conflicts += 1,
                other => panic!("unexpected outcome {other:?}"),
            }
        }
        assert_eq!(acquired, 1);
        assert_eq!(conflicts, 31);
    }

    #[tokio::test]
    async fn completed_record_is_served_from_cache() {
        let (coord, _, _) = setup();
        let fp = order_fp(2);
        let handle = handle_of(acquire(&coord, "abc-123", &fp).await);
        assert!(coord.complete(&handle, &created()).await.unwrap());
        assert_eq!(
            acquire(&coord, "abc-123", &fp).await,
            AcquireOutcome::ServeCached(created())
        );
    }

    #[tokio::test]
    async fn different_payload_is_a_mismatch_in_every_state() {
        let (coord, _, _) = setup();
        let handle = handle_of(acquire(&coord, "abc-123", &order_fp(2)).await);
        assert_eq!(acquire(&coord, "abc-123", &order_fp(3)).await, AcquireOutcome::Mismatch);

        coord.complete(&handle, &created()).await.unwrap();
        assert_eq!(acquire(&coord, "abc-123", &order_fp(3)).await, AcquireOutcome::Mismatch);

        let other_path = fingerprint("POST", "/v1/waves", br#"{"sku":"X","qty":2}"#);
        assert_eq!(acquire(&coord, "abc-123", &other_path).await, AcquireOutcome::Mismatch);
    }

    #[tokio::test]
    async fn fresh_lock_conflicts_and_reports_age() {
        let (coord, clock, _) = setup();
        let fp = order_fp(2);
        acquire(&coord, "dup-1", &fp).await;
        clock.advance(Duration::from_secs(10));
        assert_eq!(
            acquire(&coord, "dup-1", &fp).await,
            AcquireOutcome::Conflict { lock_age: Duration::from_secs(10) }
        );
    }

    #[tokio::test]
    async fn stale_lock_is_reclaimed_and_old_holder_is_fenced() {
        let (coord, clock, store) = setup();
        let fp = order_fp(2);
        let crashed = handle_of(acquire(&coord, "abc-123", &fp).await);

        clock.advance(Duration::from_secs(6 * 60));
        let retry = handle_of(acquire(&coord, "abc-123", &fp).await);
        assert!(retry.reclaimed);
        assert_ne!(retry.lock_token, crashed.lock_token);

        // the crashed holder wakes up late: its writes are rejected
        assert!(!coord.complete(&crashed, &created()).await.unwrap());
        assert!(!coord.fail(&crashed).await.unwrap());

        assert!(coord.complete(&retry, &created()).await.unwrap());
        let rec = store.get("order-service", "abc-123", clock.now()).await.unwrap().unwrap();
        assert_eq!(rec.status, RecordStatus::Completed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_reclaims_yield_one_winner() {
        let (coord, clock, _) = setup();
        let fp = order_fp(2);
        acquire(&coord, "abc-123", &fp).await;
        clock.advance(Duration::from_secs(301));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let coord = coord.clone();
            let fp = fp.clone();
            tasks.push(tokio::spawn(async move { acquire(&coord, "abc-123", &fp).await }));
        }
        let mut winners = 0;
        for t in tasks {
            if let AcquireOutcome::Acquired(h) = t.await.unwrap() {
                assert!(h.reclaimed);
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn failed_record_is_reclaimable_immediately() {
        let (coord, _, _) = setup();
        let fp = order_fp(2);
        let first = handle_of(acquire(&coord, "abc-123", &fp).await);
        assert!(coord.fail(&first).await.unwrap());
        let second = handle_of(acquire(&coord, "abc-123", &fp).await);
        assert!(second.reclaimed);
    }

    #[tokio::test]
    async fn expired_record_is_treated_as_absent() {
        let (coord, clock, _) = setup();
        let fp = order_fp(2);
        let first = handle_of(acquire(&coord, "abc-123", &fp).await);
        coord.complete(&first, &created()).await.unwrap();

        clock.advance(RETENTION);
        let fresh = handle_of(acquire(&coord, "abc-123", &order_fp(3)).await);
        assert!(!fresh.reclaimed);
    }

    #[tokio::test]
    async fn store_outage_is_an_error_not_an_outcome() {
        let (coord, _, store) = setup();
        store.set_offline(true);
        let err = coord
            .acquire_or_inspect("order-service", "abc-123", "POST", "/v1/orders", &order_fp(2))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
    }

    /// One coordinator per simulated replica, each with its own connection
    /// to the same database file.
    #[cfg(feature = "sqlite")]
    async fn sqlite_replicas(
        path: &std::path::Path,
        n: usize,
        clock: &ManualClock,
    ) -> Vec<LockCoordinator> {
        use crate::store::SqliteStore;

        let mut replicas = Vec::new();
        for _ in 0..n {
            let store = SqliteStore::open(path).unwrap();
            KeyStore::ensure_indexes(&store).await.unwrap();
            replicas.push(LockCoordinator::new(
                Arc::new(store),
                Arc::new(clock.clone()),
                TIMEOUT,
                RETENTION,
            ));
        }
        replicas
    }

    #[cfg(feature = "sqlite")]
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn sqlite_replicas_allow_one_acquirer() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::starting_now();
        let replicas = sqlite_replicas(&dir.path().join("idem.db"), 4, &clock).await;
        let fp = order_fp(2);

        let mut tasks = Vec::new();
        for i in 0..16 {
            let coord = replicas[i % replicas.len()].clone();
            let fp = fp.clone();
            tasks.push(tokio::spawn(async move { acquire(&coord, "dup-1", &fp).await }));
        }
        let mut acquired = 0;
        for t in tasks {
            match t.await.unwrap() {
                AcquireOutcome::Acquired(h) => {
                    assert!(!h.reclaimed);
                    acquired += 1;
                }
                AcquireOutcome::Conflict { .. } => {}
                other => panic!("unexpected outcome {other:?}"),
            }
        }
        assert_eq!(acquired, 1);
    }

    #[cfg(feature = "sqlite")]
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn sqlite_replicas_reclaim_stale_lock_once() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::starting_now();
        let replicas = sqlite_replicas(&dir.path().join("idem.db"), 4, &clock).await;
        let fp = order_fp(2);
        let crashed = handle_of(acquire(&replicas[0], "abc-123", &fp).await);
        clock.advance(TIMEOUT + Duration::from_secs(1));

        let mut tasks = Vec::new();
        for i in 0..16 {
            let coord = replicas[i % replicas.len()].clone();
            let fp = fp.clone();
            tasks.push(tokio::spawn(async move { acquire(&coord, "abc-123", &fp).await }));
        }
        let mut winners = Vec::new();
        for t in tasks {
            if let AcquireOutcome::Acquired(h) = t.await.unwrap() {
                assert!(h.reclaimed);
                winners.push(h);
            }
        }
        assert_eq!(winners.len(), 1);

        // the crashed holder is fenced out on every replica
        assert!(!replicas[1].complete(&crashed, &created()).await.unwrap());
        assert!(replicas[2].complete(&winners[0], &created()).await.unwrap());
        match acquire(&replicas[3], "abc-123", &fp).await {
            AcquireOutcome::ServeCached(stored) => assert_eq!(stored, created()),
            other => panic!("expected cached replay, got {other:?}"),
        }
    }
}

//! In-process stores for single-replica deployments and tests.
//!
//! Each trait method runs inside one critical section, which plays the role
//! of the backend's single atomic round-trip. Sharing across replicas needs
//! a real backend such as [`super::SqliteStore`].

use super::{InsertOutcome, KeyStore, MarkOutcome, MessageStore};
use crate::error::StoreError;
use crate::record::{
    ConsumedMessageRecord, IdempotencyRecord, PhaseCheckpoint, RecordStatus, StoredResponse,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

type KeyId = (String, String);
type MessageId = (String, String, String);

#[derive(Default)]
struct Outage(AtomicBool);

impl Outage {
    fn check(&self) -> Result<(), StoreError> {
        if self.0.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store offline".into()));
        }
        Ok(())
    }
}

fn guard<T>(m: &Mutex<T>) -> Result<MutexGuard<'_, T>, StoreError> {
    m.lock()
        .map_err(|_| StoreError::Unavailable("store mutex poisoned".into()))
}

#[derive(Clone, Default)]
pub struct MemoryKeyStore {
    records: Arc<Mutex<HashMap<KeyId, IdempotencyRecord>>>,
    outage: Arc<Outage>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with `Unavailable` until switched back.
    pub fn set_offline(&self, offline: bool) {
        self.outage.0.store(offline, Ordering::SeqCst);
    }

    /// Number of stored rows, expired ones included.
    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn id(service_id: &str, key: &str) -> KeyId {
        (service_id.to_string(), key.to_string())
    }

    /// Apply `f` to the live in-progress record held by `lock_token`.
    fn with_held_lock(
        &self,
        service_id: &str,
        key: &str,
        lock_token: &str,
        now: DateTime<Utc>,
        f: impl FnOnce(&mut IdempotencyRecord),
    ) -> Result<bool, StoreError> {
        self.outage.check()?;
        let mut records = guard(&self.records)?;
        match records.get_mut(&Self::id(service_id, key)) {
            Some(r)
                if !r.is_expired(now)
                    && r.status == RecordStatus::InProgress
                    && r.lock_token == lock_token =>
            {
                f(r);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl KeyStore for MemoryKeyStore {
    async fn ensure_indexes(&self) -> Result<(), StoreError> {
        self.outage.check()
    }

    async fn insert_if_absent(
        &self,
        record: &IdempotencyRecord,
        now: DateTime<Utc>,
    ) -> Result<InsertOutcome, StoreError> {
        self.outage.check()?;
        let mut records = guard(&self.records)?;
        let id = Self::id(&record.service_id, &record.key);
        if let Some(existing) = records.get(&id) {
            if !existing.is_expired(now) {
                return Ok(InsertOutcome::Existing(existing.clone()));
            }
        }
        records.insert(id, record.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn reclaim(
        &self,
        service_id: &str,
        key: &str,
        expected_status: RecordStatus,
        expected_token: &str,
        new_token: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<IdempotencyRecord>, StoreError> {
        self.outage.check()?;
        let mut records = guard(&self.records)?;
        match records.get_mut(&Self::id(service_id, key)) {
            Some(r)
                if !r.is_expired(now)
                    && r.status == expected_status
                    && r.lock_token == expected_token =>
            {
                r.status = RecordStatus::InProgress;
                r.lock_acquired_at = Some(now);
                r.lock_token = new_token.to_string();
                Ok(Some(r.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn complete(
        &self,
        service_id: &str,
        key: &str,
        lock_token: &str,
        response: &StoredResponse,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.with_held_lock(service_id, key, lock_token, now, |r| {
            r.status = RecordStatus::Completed;
            r.response = Some(response.clone());
            r.completed_at = Some(now);
        })
    }

    async fn fail(
        &self,
        service_id: &str,
        key: &str,
        lock_token: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.with_held_lock(service_id, key, lock_token, now, |r| {
            r.status = RecordStatus::Failed;
        })
    }

    async fn append_checkpoint(
        &self,
        service_id: &str,
        key: &str,
        phase: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.outage.check()?;
        let mut records = guard(&self.records)?;
        match records.get_mut(&Self::id(service_id, key)) {
            Some(r) if !r.is_expired(now) => {
                if r.has_checkpoint(phase) {
                    return Ok(false);
                }
                r.phase_checkpoints.push(PhaseCheckpoint {
                    name: phase.to_string(),
                    completed_at: now,
                });
                Ok(true)
            }
            _ => Err(StoreError::NotFound {
                service_id: service_id.to_string(),
                key: key.to_string(),
            }),
        }
    }

    async fn get(
        &self,
        service_id: &str,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<IdempotencyRecord>, StoreError> {
        self.outage.check()?;
        let records = guard(&self.records)?;
        Ok(records
            .get(&Self::id(service_id, key))
            .filter(|r| !r.is_expired(now))
            .cloned())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        self.outage.check()?;
        let mut records = guard(&self.records)?;
        let before = records.len();
        records.retain(|_, r| !r.is_expired(now));
        Ok((before - records.len()) as u64)
    }
}

#[derive(Clone, Default)]
pub struct MemoryMessageStore {
    records: Arc<Mutex<HashMap<MessageId, ConsumedMessageRecord>>>,
    outage: Arc<Outage>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offline(&self, offline: bool) {
        self.outage.0.store(offline, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn id(message_id: &str, service_name: &str, consumer_group: &str) -> MessageId {
        (
            message_id.to_string(),
            service_name.to_string(),
            consumer_group.to_string(),
        )
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn ensure_indexes(&self) -> Result<(), StoreError> {
        self.outage.check()
    }

    async fn is_consumed(
        &self,
        message_id: &str,
        service_name: &str,
        consumer_group: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.outage.check()?;
        let records = guard(&self.records)?;
        Ok(records
            .get(&Self::id(message_id, service_name, consumer_group))
            .is_some_and(|r| !r.is_expired(now)))
    }

    async fn mark_consumed(
        &self,
        record: &ConsumedMessageRecord,
        now: DateTime<Utc>,
    ) -> Result<MarkOutcome, StoreError> {
        self.outage.check()?;
        let mut records = guard(&self.records)?;
        let id = Self::id(&record.message_id, &record.service_name, &record.consumer_group);
        if records.get(&id).is_some_and(|r| !r.is_expired(now)) {
            return Ok(MarkOutcome::AlreadyRecorded);
        }
        records.insert(id, record.clone());
        Ok(MarkOutcome::Recorded)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        self.outage.check()?;
        let mut records = guard(&self.records)?;
        let before = records.len();
        records.retain(|_, r| !r.is_expired(now));
        Ok((before - records.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::fingerprint;
    use crate::record::CachedResponse;
    use chrono::Duration;
    use std::collections::BTreeMap;

    const DAY: std::time::Duration = std::time::Duration::from_secs(86_400);

    fn rec(key: &str, now: DateTime<Utc>) -> IdempotencyRecord {
        IdempotencyRecord::in_progress(
            "order-service",
            key,
            "POST",
            "/v1/orders",
            fingerprint("POST", "/v1/orders", b"{}"),
            now,
            DAY,
        )
    }

    fn ok_response() -> StoredResponse {
        StoredResponse::Cached(CachedResponse {
            status_code: 201,
            headers: BTreeMap::new(),
            body: b"{}".to_vec(),
        })
    }

    #[tokio::test]
    async fn second_insert_returns_existing() {
        let store = MemoryKeyStore::new();
        let now = Utc::now();
        let first = rec("k1", now);
        assert_eq!(store.insert_if_absent(&first, now).await.unwrap(), InsertOutcome::Inserted);
        match store.insert_if_absent(&rec("k1", now), now).await.unwrap() {
            InsertOutcome::Existing(r) => assert_eq!(r.lock_token, first.lock_token),
            other => panic!("expected existing, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn keys_are_scoped_per_service() {
        let store = MemoryKeyStore::new();
        let now = Utc::now();
        store.insert_if_absent(&rec("k1", now), now).await.unwrap();
        let mut other = rec("k1", now);
        other.service_id = "wave-service".into();
        assert_eq!(store.insert_if_absent(&other, now).await.unwrap(), InsertOutcome::Inserted);
    }

    #[tokio::test]
    async fn expired_record_is_replaced() {
        let store = MemoryKeyStore::new();
        let now = Utc::now();
        store.insert_if_absent(&rec("k1", now), now).await.unwrap();
        let later = now + Duration::hours(25);
        assert!(store.get("order-service", "k1", later).await.unwrap().is_none());
        assert_eq!(
            store.insert_if_absent(&rec("k1", later), later).await.unwrap(),
            InsertOutcome::Inserted
        );
    }

    #[tokio::test]
    async fn complete_requires_current_token() {
        let store = MemoryKeyStore::new();
        let now = Utc::now();
        let r = rec("k1", now);
        store.insert_if_absent(&r, now).await.unwrap();
        assert!(!store.complete("order-service", "k1", "stale-token", &ok_response(), now).await.unwrap());
        assert!(store.complete("order-service", "k1", &r.lock_token, &ok_response(), now).await.unwrap());
        // already completed: a second completion is refused
        assert!(!store.complete("order-service", "k1", &r.lock_token, &ok_response(), now).await.unwrap());
        let stored = store.get("order-service", "k1", now).await.unwrap().unwrap();
        assert_eq!(stored.status, RecordStatus::Completed);
        assert_eq!(stored.completed_at, Some(now));
    }

    #[tokio::test]
    async fn reclaim_is_compare_and_swap() {
        let store = MemoryKeyStore::new();
        let now = Utc::now();
        let r = rec("k1", now);
        store.insert_if_absent(&r, now).await.unwrap();
        let won = store
            .reclaim("order-service", "k1", RecordStatus::InProgress, &r.lock_token, "t2", now)
            .await
            .unwrap();
        assert_eq!(won.map(|w| w.lock_token), Some("t2".to_string()));
        let lost = store
            .reclaim("order-service", "k1", RecordStatus::InProgress, &r.lock_token, "t3", now)
            .await
            .unwrap();
        assert!(lost.is_none());
    }

    #[tokio::test]
    async fn checkpoints_append_once() {
        let store = MemoryKeyStore::new();
        let now = Utc::now();
        store.insert_if_absent(&rec("k1", now), now).await.unwrap();
        assert!(store.append_checkpoint("order-service", "k1", "reserved", now).await.unwrap());
        assert!(!store.append_checkpoint("order-service", "k1", "reserved", now).await.unwrap());
        assert!(matches!(
            store.append_checkpoint("order-service", "missing", "reserved", now).await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn offline_store_surfaces_unavailable() {
        let store = MemoryKeyStore::new();
        store.set_offline(true);
        let now = Utc::now();
        assert!(matches!(
            store.insert_if_absent(&rec("k1", now), now).await,
            Err(StoreError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn purge_drops_only_expired() {
        let store = MemoryKeyStore::new();
        let now = Utc::now();
        store.insert_if_absent(&rec("old", now), now).await.unwrap();
        let later = now + Duration::hours(23);
        store.insert_if_absent(&rec("new", later), later).await.unwrap();
        let purged = store.purge_expired(now + Duration::hours(24)).await.unwrap();
        assert_eq!(purged, 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn message_mark_is_unique_per_group() {
        let store = MemoryMessageStore::new();
        let now = Utc::now();
        let msg = ConsumedMessageRecord {
            message_id: "evt-42".into(),
            service_name: "inventory-service".into(),
            topic: "wms.orders".into(),
            consumer_group: "inventory".into(),
            event_type: "wms.order.received".into(),
            correlation_id: None,
            workflow_id: None,
            consumed_at: now,
            expires_at: now + Duration::hours(24),
        };
        assert_eq!(store.mark_consumed(&msg, now).await.unwrap(), MarkOutcome::Recorded);
        assert_eq!(store.mark_consumed(&msg, now).await.unwrap(), MarkOutcome::AlreadyRecorded);
        assert!(store.is_consumed("evt-42", "inventory-service", "inventory", now).await.unwrap());
        assert!(!store.is_consumed("evt-42", "inventory-service", "audit", now).await.unwrap());
        assert!(!store
            .is_consumed("evt-42", "inventory-service", "inventory", now + Duration::hours(24))
            .await
            .unwrap());
    }
}

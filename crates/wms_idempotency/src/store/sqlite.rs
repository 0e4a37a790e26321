//! SQLite backend shared by every replica that opens the same database file.
//!
//! Atomicity comes from SQLite itself: the acquire path is one
//! `INSERT .. ON CONFLICT DO UPDATE .. WHERE expired` statement against the
//! unique (service_id, idem_key) index, and reclaim / complete / fail are
//! single `UPDATE .. WHERE lock_token = ?` statements. SQLite has no TTL
//! index, so reads filter on `expires_at` and [`super::spawn_purge_task`]
//! deletes the rows.

use super::{InsertOutcome, KeyStore, MarkOutcome, MessageStore};
use crate::error::StoreError;
use crate::fingerprint::Fingerprint;
use crate::record::{
    CachedResponse, ConsumedMessageRecord, IdempotencyRecord, PhaseCheckpoint, RecordStatus,
    StoredResponse,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const KEYS_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS idempotency_keys (
    service_id          TEXT    NOT NULL,
    idem_key            TEXT    NOT NULL,
    user_id             TEXT,
    request_method      TEXT    NOT NULL,
    request_path        TEXT    NOT NULL,
    request_fingerprint TEXT    NOT NULL,
    status              TEXT    NOT NULL,
    response_status     INTEGER,
    response_headers    TEXT,
    response_body       BLOB,
    response_truncated  INTEGER NOT NULL DEFAULT 0,
    response_size       INTEGER,
    lock_acquired_at    INTEGER,
    lock_token          TEXT    NOT NULL,
    phase_checkpoints   TEXT    NOT NULL DEFAULT '[]',
    created_at          INTEGER NOT NULL,
    completed_at        INTEGER,
    expires_at          INTEGER NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_service_key ON idempotency_keys (service_id, idem_key);
CREATE INDEX IF NOT EXISTS idx_keys_ttl ON idempotency_keys (expires_at);
";

const MESSAGES_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS consumed_messages (
    message_id     TEXT    NOT NULL,
    service_name   TEXT    NOT NULL,
    topic          TEXT    NOT NULL,
    consumer_group TEXT    NOT NULL,
    event_type     TEXT    NOT NULL,
    correlation_id TEXT,
    workflow_id    TEXT,
    consumed_at    INTEGER NOT NULL,
    expires_at     INTEGER NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_msg_service_group
    ON consumed_messages (message_id, service_name, consumer_group);
CREATE INDEX IF NOT EXISTS idx_msg_ttl ON consumed_messages (expires_at);
";

const SELECT_RECORD: &str = "
SELECT service_id, idem_key, user_id, request_method, request_path, request_fingerprint, status,
       response_status, response_headers, response_body, response_truncated, response_size,
       lock_acquired_at, lock_token, phase_checkpoints, created_at, completed_at, expires_at
FROM idempotency_keys
WHERE service_id = ?1 AND idem_key = ?2 AND expires_at > ?3
";

#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` on the blocking pool. The mutex wait and SQLite's busy
    /// timeout both happen there, off the async workers.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|_| StoreError::Unavailable("sqlite connection mutex poisoned".into()))?;
            f(&conn)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("sqlite task failed: {e}")))?
    }
}

fn ms(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

fn from_ms(v: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(v)
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range: {v}")))
}

#[derive(Deserialize)]
struct RawCheckpoint {
    name: String,
    completed_at: i64,
}

/// Row image before validation.
struct RawRecord {
    service_id: String,
    key: String,
    user_id: Option<String>,
    request_method: String,
    request_path: String,
    request_fingerprint: String,
    status: String,
    response_status: Option<u16>,
    response_headers: Option<String>,
    response_body: Option<Vec<u8>>,
    response_truncated: bool,
    response_size: Option<i64>,
    lock_acquired_at: Option<i64>,
    lock_token: String,
    phase_checkpoints: String,
    created_at: i64,
    completed_at: Option<i64>,
    expires_at: i64,
}

impl RawRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            service_id: row.get(0)?,
            key: row.get(1)?,
            user_id: row.get(2)?,
            request_method: row.get(3)?,
            request_path: row.get(4)?,
            request_fingerprint: row.get(5)?,
            status: row.get(6)?,
            response_status: row.get(7)?,
            response_headers: row.get(8)?,
            response_body: row.get(9)?,
            response_truncated: row.get(10)?,
            response_size: row.get(11)?,
            lock_acquired_at: row.get(12)?,
            lock_token: row.get(13)?,
            phase_checkpoints: row.get(14)?,
            created_at: row.get(15)?,
            completed_at: row.get(16)?,
            expires_at: row.get(17)?,
        })
    }

    fn into_record(self) -> Result<IdempotencyRecord, StoreError> {
        let status = RecordStatus::parse(&self.status)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown status {:?}", self.status)))?;

        let response = match (self.response_status, self.response_truncated) {
            (None, _) => None,
            (Some(code), true) => Some(StoredResponse::Truncated {
                status_code: code,
                body_size: self.response_size.unwrap_or(0).max(0) as usize,
            }),
            (Some(code), false) => {
                let headers: BTreeMap<String, String> = match self.response_headers {
                    Some(h) => serde_json::from_str(&h)?,
                    None => BTreeMap::new(),
                };
                Some(StoredResponse::Cached(CachedResponse {
                    status_code: code,
                    headers,
                    body: self.response_body.unwrap_or_default(),
                }))
            }
        };

        let raw_phases: Vec<RawCheckpoint> = serde_json::from_str(&self.phase_checkpoints)?;
        let phase_checkpoints = raw_phases
            .into_iter()
            .map(|c| {
                Ok(PhaseCheckpoint {
                    name: c.name,
                    completed_at: from_ms(c.completed_at)?,
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()?;

        Ok(IdempotencyRecord {
            service_id: self.service_id,
            key: self.key,
            user_id: self.user_id,
            request_method: self.request_method,
            request_path: self.request_path,
            request_fingerprint: Fingerprint::from_stored(self.request_fingerprint),
            status,
            response,
            lock_acquired_at: self.lock_acquired_at.map(from_ms).transpose()?,
            lock_token: self.lock_token,
            phase_checkpoints,
            created_at: from_ms(self.created_at)?,
            completed_at: self.completed_at.map(from_ms).transpose()?,
            expires_at: from_ms(self.expires_at)?,
        })
    }
}

fn select_record(
    conn: &Connection,
    service_id: &str,
    key: &str,
    now: DateTime<Utc>,
) -> Result<Option<IdempotencyRecord>, StoreError> {
    conn.query_row(SELECT_RECORD, params![service_id, key, ms(now)], RawRecord::from_row)
        .optional()?
        .map(RawRecord::into_record)
        .transpose()
}

#[async_trait]
impl KeyStore for SqliteStore {
    async fn ensure_indexes(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| Ok(conn.execute_batch(KEYS_SCHEMA)?)).await
    }

    async fn insert_if_absent(
        &self,
        record: &IdempotencyRecord,
        now: DateTime<Utc>,
    ) -> Result<InsertOutcome, StoreError> {
        let record = record.clone();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "INSERT INTO idempotency_keys (
                     service_id, idem_key, request_method, request_path, request_fingerprint,
                     status, lock_acquired_at, lock_token, phase_checkpoints, created_at, expires_at,
                     user_id
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, '[]', ?9, ?10, ?12)
                 ON CONFLICT (service_id, idem_key) DO UPDATE SET
                     user_id             = excluded.user_id,
                     request_method      = excluded.request_method,
                     request_path        = excluded.request_path,
                     request_fingerprint = excluded.request_fingerprint,
                     status              = excluded.status,
                     response_status     = NULL,
                     response_headers    = NULL,
                     response_body       = NULL,
                     response_truncated  = 0,
                     response_size       = NULL,
                     lock_acquired_at    = excluded.lock_acquired_at,
                     lock_token          = excluded.lock_token,
                     phase_checkpoints   = '[]',
                     created_at          = excluded.created_at,
                     completed_at        = NULL,
                     expires_at          = excluded.expires_at
                 WHERE idempotency_keys.expires_at <= ?11",
                params![
                    record.service_id,
                    record.key,
                    record.request_method,
                    record.request_path,
                    record.request_fingerprint.as_str(),
                    record.status.as_str(),
                    record.lock_acquired_at.map(ms),
                    record.lock_token,
                    ms(record.created_at),
                    ms(record.expires_at),
                    ms(now),
                    record.user_id,
                ],
            )?;
            if changed == 1 {
                return Ok(InsertOutcome::Inserted);
            }
            match select_record(conn, &record.service_id, &record.key, now)? {
                Some(existing) => Ok(InsertOutcome::Existing(existing)),
                // Deleted between the two statements; the caller may simply retry.
                None => Err(StoreError::Unavailable(format!(
                    "record {}/{} vanished during acquire",
                    record.service_id, record.key
                ))),
            }
        })
        .await
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
        let (service_id, key) = (service_id.to_string(), key.to_string());
        let (expected_token, new_token) = (expected_token.to_string(), new_token.to_string());
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE idempotency_keys
                 SET status = 'in_progress', lock_acquired_at = ?1, lock_token = ?2
                 WHERE service_id = ?3 AND idem_key = ?4
                   AND status = ?5 AND lock_token = ?6 AND expires_at > ?1",
                params![
                    ms(now),
                    new_token,
                    service_id,
                    key,
                    expected_status.as_str(),
                    expected_token
                ],
            )?;
            if changed == 0 {
                return Ok(None);
            }
            select_record(conn, &service_id, &key, now)
        })
        .await
    }

    async fn complete(
        &self,
        service_id: &str,
        key: &str,
        lock_token: &str,
        response: &StoredResponse,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let (code, headers, body, truncated, size) = match response {
            StoredResponse::Cached(r) => (
                r.status_code,
                Some(serde_json::to_string(&r.headers)?),
                Some(r.body.clone()),
                false,
                r.body.len() as i64,
            ),
            StoredResponse::Truncated { status_code, body_size } => {
                (*status_code, None, None, true, *body_size as i64)
            }
        };
        let (service_id, key, lock_token) =
            (service_id.to_string(), key.to_string(), lock_token.to_string());
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE idempotency_keys
                 SET status = 'completed', response_status = ?1, response_headers = ?2,
                     response_body = ?3, response_truncated = ?4, response_size = ?5,
                     completed_at = ?6
                 WHERE service_id = ?7 AND idem_key = ?8
                   AND status = 'in_progress' AND lock_token = ?9 AND expires_at > ?6",
                params![code, headers, body, truncated, size, ms(now), service_id, key, lock_token],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn fail(
        &self,
        service_id: &str,
        key: &str,
        lock_token: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let (service_id, key, lock_token) =
            (service_id.to_string(), key.to_string(), lock_token.to_string());
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE idempotency_keys SET status = 'failed'
                 WHERE service_id = ?1 AND idem_key = ?2
                   AND status = 'in_progress' AND lock_token = ?3 AND expires_at > ?4",
                params![service_id, key, lock_token, ms(now)],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn append_checkpoint(
        &self,
        service_id: &str,
        key: &str,
        phase: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let (service_id, key, phase) = (service_id.to_string(), key.to_string(), phase.to_string());
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE idempotency_keys
                 SET phase_checkpoints = json_insert(
                     phase_checkpoints, '$[#]', json_object('name', ?3, 'completed_at', ?4))
                 WHERE service_id = ?1 AND idem_key = ?2 AND expires_at > ?4
                   AND NOT EXISTS (
                       SELECT 1 FROM json_each(idempotency_keys.phase_checkpoints)
                       WHERE json_extract(json_each.value, '$.name') = ?3)",
                params![service_id, key, phase, ms(now)],
            )?;
            if changed == 1 {
                return Ok(true);
            }
            let exists: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM idempotency_keys
                     WHERE service_id = ?1 AND idem_key = ?2 AND expires_at > ?3",
                    params![service_id, key, ms(now)],
                    |row| row.get(0),
                )
                .optional()?;
            match exists {
                Some(_) => Ok(false),
                None => Err(StoreError::NotFound { service_id, key }),
            }
        })
        .await
    }

    async fn get(
        &self,
        service_id: &str,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<IdempotencyRecord>, StoreError> {
        let (service_id, key) = (service_id.to_string(), key.to_string());
        self.with_conn(move |conn| select_record(conn, &service_id, &key, now))
            .await
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        self.with_conn(move |conn| {
            let n = conn.execute(
                "DELETE FROM idempotency_keys WHERE expires_at <= ?1",
                params![ms(now)],
            )?;
            Ok(n as u64)
        })
        .await
    }
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn ensure_indexes(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| Ok(conn.execute_batch(MESSAGES_SCHEMA)?)).await
    }

    async fn is_consumed(
        &self,
        message_id: &str,
        service_name: &str,
        consumer_group: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let (message_id, service_name, consumer_group) = (
            message_id.to_string(),
            service_name.to_string(),
            consumer_group.to_string(),
        );
        self.with_conn(move |conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM consumed_messages
                     WHERE message_id = ?1 AND service_name = ?2 AND consumer_group = ?3
                       AND expires_at > ?4",
                    params![message_id, service_name, consumer_group, ms(now)],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
        .await
    }

    async fn mark_consumed(
        &self,
        record: &ConsumedMessageRecord,
        now: DateTime<Utc>,
    ) -> Result<MarkOutcome, StoreError> {
        let record = record.clone();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "INSERT INTO consumed_messages (
                     message_id, service_name, topic, consumer_group, event_type,
                     correlation_id, workflow_id, consumed_at, expires_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT (message_id, service_name, consumer_group) DO UPDATE SET
                     topic          = excluded.topic,
                     event_type     = excluded.event_type,
                     correlation_id = excluded.correlation_id,
                     workflow_id    = excluded.workflow_id,
                     consumed_at    = excluded.consumed_at,
                     expires_at     = excluded.expires_at
                 WHERE consumed_messages.expires_at <= ?10",
                params![
                    record.message_id,
                    record.service_name,
                    record.topic,
                    record.consumer_group,
                    record.event_type,
                    record.correlation_id,
                    record.workflow_id,
                    ms(record.consumed_at),
                    ms(record.expires_at),
                    ms(now),
                ],
            )?;
            Ok(if changed == 1 {
                MarkOutcome::Recorded
            } else {
                MarkOutcome::AlreadyRecorded
            })
        })
        .await
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        self.with_conn(move |conn| {
            let n = conn.execute(
                "DELETE FROM consumed_messages WHERE expires_at <= ?1",
                params![ms(now)],
            )?;
            Ok(n as u64)
        })
        .await
    }
}

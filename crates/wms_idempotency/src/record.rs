//! Persisted records: one [`IdempotencyRecord`] per (service, key) and one
//! [`ConsumedMessageRecord`] per (message id, service, consumer group).

use crate::fingerprint::Fingerprint;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Record lifecycle: `InProgress -> Completed | Failed`, never backwards.
/// A `Failed` (or stale `InProgress`) record may be reclaimed into a fresh
/// `InProgress` lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    InProgress,
    Completed,
    Failed,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A response replayed verbatim on retries. `body` never exceeds the
/// configured `max_response_size`; larger bodies are stored as
/// [`StoredResponse::Truncated`] instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub status_code: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

/// What `complete` persisted for a finished request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoredResponse {
    Cached(CachedResponse),
    /// The body was over the cap and was dropped; only the status survives.
    Truncated { status_code: u16, body_size: usize },
}

impl StoredResponse {
    /// Cache `response` unless its body is larger than `max_size`.
    pub fn capture(response: CachedResponse, max_size: usize) -> Self {
        if response.body.len() > max_size {
            StoredResponse::Truncated {
                status_code: response.status_code,
                body_size: response.body.len(),
            }
        } else {
            StoredResponse::Cached(response)
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::Cached(r) => r.status_code,
            Self::Truncated { status_code, .. } => *status_code,
        }
    }

    pub fn is_truncated(&self) -> bool {
        matches!(self, Self::Truncated { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseCheckpoint {
    pub name: String,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub service_id: String,
    pub key: String,
    /// Caller identity at first use, when the service extracts one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub request_method: String,
    pub request_path: String,
    pub request_fingerprint: Fingerprint,
    pub status: RecordStatus,
    /// Set only once the record is `Completed`.
    pub response: Option<StoredResponse>,
    /// When the current (or last) holder took the lock.
    pub lock_acquired_at: Option<DateTime<Utc>>,
    /// Rotated on every acquire; the compare-and-swap fence for reclaim,
    /// complete and fail.
    pub lock_token: String,
    /// Append-only, in completion order, names unique.
    pub phase_checkpoints: Vec<PhaseCheckpoint>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    /// A freshly locked record, as written by the first caller for a key.
    pub fn in_progress(
        service_id: impl Into<String>,
        key: impl Into<String>,
        method: impl Into<String>,
        path: impl Into<String>,
        fingerprint: Fingerprint,
        now: DateTime<Utc>,
        retention: std::time::Duration,
    ) -> Self {
        Self {
            service_id: service_id.into(),
            key: key.into(),
            user_id: None,
            request_method: method.into(),
            request_path: path.into(),
            request_fingerprint: fingerprint,
            status: RecordStatus::InProgress,
            response: None,
            lock_acquired_at: Some(now),
            lock_token: new_lock_token(),
            phase_checkpoints: Vec::new(),
            created_at: now,
            completed_at: None,
            expires_at: now + to_chrono(retention),
        }
    }

    pub fn with_user(mut self, user_id: Option<String>) -> Self {
        self.user_id = user_id;
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn lock_age(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.lock_acquired_at.map(|at| now - at)
    }

    /// An `InProgress` lock older than `timeout` belongs to a crashed or hung holder.
    pub fn is_lock_stale(&self, now: DateTime<Utc>, timeout: std::time::Duration) -> bool {
        match self.lock_age(now) {
            Some(age) => age >= to_chrono(timeout),
            None => true,
        }
    }

    pub fn response_truncated(&self) -> bool {
        self.response.as_ref().is_some_and(StoredResponse::is_truncated)
    }

    pub fn has_checkpoint(&self, phase: &str) -> bool {
        self.phase_checkpoints.iter().any(|c| c.name == phase)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumedMessageRecord {
    pub message_id: String,
    pub service_name: String,
    pub topic: String,
    pub consumer_group: String,
    pub event_type: String,
    pub correlation_id: Option<String>,
    pub workflow_id: Option<String>,
    pub consumed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ConsumedMessageRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

pub(crate) fn new_lock_token() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub(crate) fn to_chrono(d: std::time::Duration) -> Duration {
    Duration::from_std(d).unwrap_or_else(|_| Duration::days(36_500))
}

//! Exactly-once request processing for WMS services.
//!
//! Guards mutating HTTP calls with client-supplied idempotency keys and
//! guards broker consumers with consumed-message records, so a retry or a
//! redelivery never runs a warehouse operation twice.
//!
//! # Architecture
//!
//! ```text
//! HTTP request ──► middleware ──► fingerprint + LockCoordinator ──► KeyStore
//!                     │                 │
//!                     │   Acquired ─────┴──► handler (PhaseManager) ──► complete / fail
//!                     │   ServeCached / Conflict / Mismatch ──► short-circuit
//!                     ▼
//!                 StorageUnavailable ──► 503
//!
//! broker message ──► DedupHandler ──► MessageStore ──► handler ──► mark consumed
//! ```
//!
//! There is no in-process mutex anywhere on the correctness path. Every lock
//! transition is a single conditional write against the store (unique-index
//! insert or compare-and-swap on `lock_token`), so any number of service
//! replicas may share one store.

pub mod clock;
pub mod config;
pub mod consumer;
pub mod coordinator;
pub mod error;
pub mod fingerprint;
pub mod metrics;
pub mod middleware;
pub mod phases;
pub mod record;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConsumerConfig, IdempotencyConfig};
pub use consumer::{handler_fn, Delivery, DedupHandler, InboundMessage, MessageHandler};
pub use coordinator::{Acquisition, AcquireOutcome, LockCoordinator, LockHandle};
pub use error::{BoxError, ConsumeError, KeyError, PhaseError, StoreError};
pub use fingerprint::{fingerprint, normalize_key, validate_key, Fingerprint};
pub use self::metrics::{MetricsSink, NoopMetrics, RecorderMetrics, RequestLabels};
pub use middleware::{idempotency_middleware, Idempotency, IdempotencyRejection, UserIdExtractor};
pub use phases::{PhaseManager, PhaseRun};
pub use record::{
    CachedResponse, ConsumedMessageRecord, IdempotencyRecord, PhaseCheckpoint, RecordStatus,
    StoredResponse,
};
pub use store::{spawn_purge_task, KeyStore, MessageStore};

/// HTTP header carrying the client-supplied idempotency key.
pub const HEADER_IDEMPOTENCY_KEY: &str = "idempotency-key";

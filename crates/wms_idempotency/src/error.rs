use thiserror::Error;

/// Boxed error returned by business handlers wrapped by this crate.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Failure of the backing store. Every variant is an infrastructure error:
/// callers must never read one as "lock acquired" or as "conflict".
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("record not found: {service_id}/{key}")]
    NotFound { service_id: String, key: String },

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Corrupt(e.to_string())
    }
}

/// Why an idempotency key was refused.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("idempotency key is required")]
    Required,

    #[error("idempotency key is {len} characters, maximum is {max}")]
    TooLong { len: usize, max: usize },

    #[error("idempotency key contains invalid character {0:?}")]
    InvalidCharacter(char),
}

/// Failure of a deduplicated message delivery. Both variants leave the
/// message unrecorded so the broker redelivers it.
#[derive(Error, Debug)]
pub enum ConsumeError {
    #[error("dedup store: {0}")]
    Store(#[from] StoreError),

    #[error("handler: {0}")]
    Handler(BoxError),
}

/// Failure inside [`crate::PhaseManager::run`].
#[derive(Error, Debug)]
pub enum PhaseError<E> {
    #[error("checkpoint store: {0}")]
    Store(#[from] StoreError),

    #[error("phase step failed: {0}")]
    Step(E),
}

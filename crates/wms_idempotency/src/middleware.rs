//! axum middleware guarding write endpoints with `Idempotency-Key`.
//!
//! ```ignore
//! let idem = Idempotency::new(IdempotencyConfig::from_env("order-service"), store)
//!     .with_metrics(Arc::new(RecorderMetrics));
//! let app = Router::new()
//!     .route("/v1/orders", post(create_order))
//!     .layer(axum::middleware::from_fn_with_state(idem, idempotency_middleware));
//! ```
//!
//! Per request:
//!
//! | situation                          | result                                   |
//! |------------------------------------|------------------------------------------|
//! | read-only verb, `only_mutating`    | handler runs unguarded                   |
//! | no key, `require_key`              | 400 `IDEMPOTENCY_KEY_REQUIRED`           |
//! | no key                             | handler runs unguarded                   |
//! | bad key                            | 400 `IDEMPOTENCY_KEY_INVALID`            |
//! | body over `max_request_size`       | 413 `REQUEST_BODY_TOO_LARGE`             |
//! | `Acquired`                         | handler runs, response recorded          |
//! | `ServeCached`                      | stored status, headers and body replayed |
//! | `Conflict`                         | 409 `IDEMPOTENCY_CONCURRENT_REQUEST`     |
//! | `Mismatch`                         | 422 `IDEMPOTENCY_PARAMETER_MISMATCH`     |
//! | store error                        | 503 `IDEMPOTENCY_STORAGE_UNAVAILABLE`    |
//! | response not storable after retry  | 503 `IDEMPOTENCY_STORAGE_UNAVAILABLE`    |
//!
//! Handlers always find a [`PhaseManager`] in the request extensions; it
//! is disabled when the request is unguarded.

use crate::clock::{Clock, SystemClock};
use crate::config::IdempotencyConfig;
use crate::coordinator::{AcquireOutcome, LockCoordinator, LockHandle};
use crate::error::KeyError;
use crate::fingerprint::{fingerprint, normalize_key, validate_key};
use crate::metrics::{MetricsSink, NoopMetrics, RequestLabels};
use crate::phases::PhaseManager;
use crate::record::{CachedResponse, StoredResponse};
use crate::store::KeyStore;
use crate::HEADER_IDEMPOTENCY_KEY;
use axum::{
    body::{to_bytes, Body, Bytes, HttpBody},
    extract::{MatchedPath, Request, State},
    http::{header, request::Parts, HeaderName, HeaderValue, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use futures_util::{stream, StreamExt};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub mod codes {
    pub const KEY_REQUIRED: &str = "IDEMPOTENCY_KEY_REQUIRED";
    pub const KEY_INVALID: &str = "IDEMPOTENCY_KEY_INVALID";
    pub const CONCURRENT_REQUEST: &str = "IDEMPOTENCY_CONCURRENT_REQUEST";
    pub const PARAMETER_MISMATCH: &str = "IDEMPOTENCY_PARAMETER_MISMATCH";
    pub const STORAGE_UNAVAILABLE: &str = "IDEMPOTENCY_STORAGE_UNAVAILABLE";
    pub const REQUEST_BODY_TOO_LARGE: &str = "REQUEST_BODY_TOO_LARGE";
    /// Replay of a completed request whose body was too large to keep.
    pub const RESPONSE_NOT_CACHED: &str = "IDEMPOTENCY_RESPONSE_NOT_CACHED";
}

/// Set on replays of truncated responses.
pub const HEADER_RESPONSE_TRUNCATED: &str = "idempotency-response-truncated";

const CONFLICT_RETRY_AFTER_SECS: u64 = 1;
const STORAGE_RETRY_AFTER_SECS: u64 = 5;

/// Attempts at storing a handler's outcome before the caller gets a 503.
const COMPLETE_ATTEMPTS: u32 = 3;
const COMPLETE_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Never captured for replay.
const UNCACHED_HEADERS: [&str; 4] = ["content-length", "transfer-encoding", "connection", "date"];

/// Pulls the caller's identity out of a request, e.g. from an auth header.
pub type UserIdExtractor = Arc<dyn Fn(&Parts) -> Option<String> + Send + Sync>;

/// Shared middleware state: config, coordinator and metrics sink.
#[derive(Clone)]
pub struct Idempotency {
    config: Arc<IdempotencyConfig>,
    coordinator: LockCoordinator,
    metrics: Arc<dyn MetricsSink>,
    user_id: Option<UserIdExtractor>,
}

impl Idempotency {
    pub fn new(config: IdempotencyConfig, store: Arc<dyn KeyStore>) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let coordinator = LockCoordinator::from_config(store, clock, &config);
        Self {
            config: Arc::new(config),
            coordinator,
            metrics: Arc::new(NoopMetrics),
            user_id: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Record the extracted user id on each new record.
    pub fn with_user_id(
        mut self,
        extract: impl Fn(&Parts) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        self.user_id = Some(Arc::new(extract));
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.coordinator =
            LockCoordinator::from_config(self.coordinator.store().clone(), clock, &self.config);
        self
    }

    pub fn config(&self) -> &IdempotencyConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &LockCoordinator {
        &self.coordinator
    }

    pub fn store(&self) -> &Arc<dyn KeyStore> {
        self.coordinator.store()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        self.coordinator.clock()
    }
}

/// A request refused before (or instead of) reaching the handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdempotencyRejection {
    KeyRequired,
    KeyInvalid(KeyError),
    ConcurrentRequest,
    ParameterMismatch,
    StorageUnavailable,
    RequestBodyTooLarge { limit: usize },
}

impl IdempotencyRejection {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::KeyRequired | Self::KeyInvalid(_) => StatusCode::BAD_REQUEST,
            Self::ConcurrentRequest => StatusCode::CONFLICT,
            Self::ParameterMismatch => StatusCode::UNPROCESSABLE_ENTITY,
            Self::StorageUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::RequestBodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::KeyRequired => codes::KEY_REQUIRED,
            Self::KeyInvalid(_) => codes::KEY_INVALID,
            Self::ConcurrentRequest => codes::CONCURRENT_REQUEST,
            Self::ParameterMismatch => codes::PARAMETER_MISMATCH,
            Self::StorageUnavailable => codes::STORAGE_UNAVAILABLE,
            Self::RequestBodyTooLarge { .. } => codes::REQUEST_BODY_TOO_LARGE,
        }
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::ConcurrentRequest => Some(CONFLICT_RETRY_AFTER_SECS),
            Self::StorageUnavailable => Some(STORAGE_RETRY_AFTER_SECS),
            _ => None,
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::KeyRequired => "Idempotency-Key header is required for this operation".into(),
            Self::KeyInvalid(e) => e.to_string(),
            Self::ConcurrentRequest => {
                "a request with this idempotency key is currently being processed".into()
            }
            Self::ParameterMismatch => {
                "idempotency key was already used with different request parameters".into()
            }
            Self::StorageUnavailable => "idempotency storage is unavailable, retry later".into(),
            Self::RequestBodyTooLarge { limit } => {
                format!("request body exceeds {limit} bytes")
            }
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RejectionBody {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

impl IntoResponse for IdempotencyRejection {
    fn into_response(self) -> Response {
        let body = RejectionBody {
            code: self.code(),
            message: self.message(),
            retry_after_secs: self.retry_after_secs(),
        };
        let mut resp = (self.status(), Json(body)).into_response();
        if let Some(secs) = self.retry_after_secs() {
            resp.headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        resp
    }
}

impl std::fmt::Display for IdempotencyRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}: {}", self.status().as_u16(), self.code(), self.message())
    }
}

impl std::error::Error for IdempotencyRejection {}

pub fn is_mutating(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::PATCH | Method::DELETE)
}

pub async fn idempotency_middleware(
    State(idem): State<Idempotency>,
    mut req: Request,
    next: Next,
) -> Response {
    let cfg = idem.config.clone();
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let endpoint = req
        .extensions()
        .get::<MatchedPath>()
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| path.clone());
    let labels = RequestLabels::new(cfg.service_name.clone(), endpoint, method.as_str());

    if cfg.only_mutating && !is_mutating(&method) {
        req.extensions_mut().insert(PhaseManager::disabled());
        return next.run(req).await;
    }

    let key = req
        .headers()
        .get(HEADER_IDEMPOTENCY_KEY)
        .map(|v| normalize_key(&String::from_utf8_lossy(v.as_bytes())).to_string())
        .filter(|k| !k.is_empty());

    let Some(key) = key else {
        if cfg.require_key {
            return reject(&idem, &labels, IdempotencyRejection::KeyRequired);
        }
        req.extensions_mut().insert(PhaseManager::disabled());
        return next.run(req).await;
    };

    if let Err(e) = validate_key(&key, cfg.max_key_length) {
        tracing::warn!(service = %cfg.service_name, path = %path, error = %e, "invalid idempotency key");
        return reject(&idem, &labels, IdempotencyRejection::KeyInvalid(e));
    }

    let (parts, body) = req.into_parts();
    let bytes = match to_bytes(body, cfg.max_request_size).await {
        Ok(b) => b,
        Err(e) => {
            tracing::warn!(service = %cfg.service_name, path = %path, error = %e, "request body not readable for fingerprinting");
            return reject(
                &idem,
                &labels,
                IdempotencyRejection::RequestBodyTooLarge {
                    limit: cfg.max_request_size,
                },
            );
        }
    };

    let fp = fingerprint(method.as_str(), &path, &bytes);
    let user_id = idem.user_id.as_ref().and_then(|extract| extract(&parts));
    let started = Instant::now();
    let acquisition = match idem
        .coordinator
        .acquire_for_user(
            &cfg.service_name,
            &key,
            user_id.as_deref(),
            method.as_str(),
            &path,
            &fp,
        )
        .await
    {
        Ok(a) => a,
        Err(e) => {
            idem.metrics.record_storage_error(&cfg.service_name, "acquire");
            tracing::error!(service = %cfg.service_name, key = %key, error = %e, "idempotency store failed during acquire");
            return IdempotencyRejection::StorageUnavailable.into_response();
        }
    };

    match acquisition.outcome {
        AcquireOutcome::Acquired(handle) => {
            idem.metrics.record_lock_acquisition(&labels, started.elapsed());
            idem.metrics.record_miss(&labels);
            tracing::info!(
                service = %cfg.service_name,
                key = %key,
                method = %method,
                path = %path,
                user = ?user_id,
                reclaimed = handle.reclaimed,
                "processing new idempotent request"
            );

            let mut req = Request::from_parts(parts, Body::from(bytes));
            req.extensions_mut().insert(PhaseManager::new(
                idem.store().clone(),
                idem.clock().clone(),
                cfg.service_name.clone(),
                key.clone(),
            ));

            let guard = FailOnDrop::arm(idem.coordinator.clone(), handle.clone());
            let response = next.run(req).await;
            let response = record_outcome(&idem, &handle, response).await;
            guard.disarm();
            response
        }
        AcquireOutcome::ServeCached(stored) => {
            idem.metrics.record_hit(&labels);
            tracing::info!(
                service = %cfg.service_name,
                key = %key,
                status = stored.status_code(),
                truncated = stored.is_truncated(),
                "returning cached idempotent response"
            );
            replay(stored)
        }
        AcquireOutcome::Conflict { lock_age } => {
            idem.metrics.record_concurrent_collision(&labels);
            tracing::warn!(
                service = %cfg.service_name,
                key = %key,
                lock_age_ms = lock_age.as_millis() as u64,
                "concurrent request with same idempotency key"
            );
            IdempotencyRejection::ConcurrentRequest.into_response()
        }
        AcquireOutcome::Mismatch => {
            idem.metrics.record_parameter_mismatch(&labels);
            tracing::warn!(
                service = %cfg.service_name,
                key = %key,
                path = %path,
                original_path = %acquisition.record.request_path,
                "idempotency key reused with different parameters"
            );
            IdempotencyRejection::ParameterMismatch.into_response()
        }
    }
}

fn reject(idem: &Idempotency, labels: &RequestLabels, rejection: IdempotencyRejection) -> Response {
    idem.metrics.record_rejection(labels, rejection.code());
    rejection.into_response()
}

/// Persist the handler's outcome and hand the response back unchanged, or
/// answer 503 when the outcome cannot be stored.
async fn record_outcome(idem: &Idempotency, handle: &LockHandle, response: Response) -> Response {
    let service = &idem.config.service_name;
    let limit = idem.config.max_response_size;

    if response.status().is_server_error() {
        mark_failed(idem, handle).await;
        return response;
    }

    let (parts, body) = response.into_parts();
    let (stored, body) = match capture_body(body, limit).await {
        Ok(Captured::Whole(bytes)) => {
            let captured = CachedResponse {
                status_code: parts.status.as_u16(),
                headers: capture_headers(&parts.headers),
                body: bytes.to_vec(),
            };
            (StoredResponse::capture(captured, limit), Body::from(bytes))
        }
        Ok(Captured::Overflow { body_size, body }) => {
            tracing::warn!(
                service = %service,
                key = %handle.key,
                body_size,
                limit,
                "response too large to cache; replays will report it as not cached"
            );
            let stored = StoredResponse::Truncated {
                status_code: parts.status.as_u16(),
                body_size,
            };
            (stored, body)
        }
        Err(e) => {
            tracing::error!(service = %service, key = %handle.key, error = %e, "handler response body could not be read");
            mark_failed(idem, handle).await;
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let mut attempt = 1;
    loop {
        match idem.coordinator.complete(handle, &stored).await {
            Ok(true) => {
                tracing::debug!(service = %service, key = %handle.key, status = stored.status_code(), "idempotent response stored");
                break;
            }
            Ok(false) => break,
            Err(e) if attempt < COMPLETE_ATTEMPTS => {
                tracing::warn!(service = %service, key = %handle.key, attempt, error = %e, "storing idempotent response failed; retrying");
                tokio::time::sleep(COMPLETE_RETRY_DELAY * attempt).await;
                attempt += 1;
            }
            Err(e) => {
                // The handler ran but its outcome is unrecorded. The record
                // stays in progress until the lock times out.
                idem.metrics.record_storage_error(service, "complete");
                tracing::error!(service = %service, key = %handle.key, attempts = attempt, error = %e, "failed to store idempotent response");
                return IdempotencyRejection::StorageUnavailable.into_response();
            }
        }
    }
    Response::from_parts(parts, body)
}

enum Captured {
    Whole(Bytes),
    /// Over the cap: the buffered prefix and the unread remainder, chained
    /// back into one body for the caller.
    Overflow { body_size: usize, body: Body },
}

/// Buffer at most `limit` bytes of `body`. `body_size` of an overflow is
/// exact when the body announced its length, otherwise the bytes seen when
/// the cap was crossed.
async fn capture_body(body: Body, limit: usize) -> Result<Captured, axum::Error> {
    let exact = HttpBody::size_hint(&body).exact();
    let mut data = body.into_data_stream();
    let mut buf: Vec<u8> = Vec::new();
    while let Some(chunk) = data.next().await {
        let chunk = chunk?;
        if buf.len() + chunk.len() > limit {
            let seen = buf.len() + chunk.len();
            let head = stream::iter([Ok::<_, axum::Error>(Bytes::from(buf)), Ok(chunk)]);
            return Ok(Captured::Overflow {
                body_size: exact.map(|n| n as usize).unwrap_or(seen),
                body: Body::from_stream(head.chain(data)),
            });
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(Captured::Whole(Bytes::from(buf)))
}

async fn mark_failed(idem: &Idempotency, handle: &LockHandle) {
    if let Err(e) = idem.coordinator.fail(handle).await {
        idem.metrics
            .record_storage_error(&idem.config.service_name, "fail");
        tracing::error!(service = %handle.service_id, key = %handle.key, error = %e, "failed to mark idempotent request failed");
    }
}

fn capture_headers(headers: &axum::http::HeaderMap) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for (name, value) in headers {
        if UNCACHED_HEADERS.contains(&name.as_str()) {
            continue;
        }
        if let Ok(v) = value.to_str() {
            out.entry(name.as_str().to_string())
                .or_insert_with(|| v.to_string());
        }
    }
    out
}

fn replay(stored: StoredResponse) -> Response {
    match stored {
        StoredResponse::Cached(cached) => {
            let status = StatusCode::from_u16(cached.status_code).unwrap_or(StatusCode::OK);
            let mut resp = Response::new(Body::from(cached.body));
            *resp.status_mut() = status;
            for (name, value) in &cached.headers {
                if let (Ok(n), Ok(v)) = (
                    HeaderName::from_bytes(name.as_bytes()),
                    HeaderValue::from_str(value),
                ) {
                    resp.headers_mut().insert(n, v);
                }
            }
            resp
        }
        StoredResponse::Truncated {
            status_code,
            body_size,
        } => {
            let status = StatusCode::from_u16(status_code).unwrap_or(StatusCode::OK);
            let body = serde_json::json!({
                "code": codes::RESPONSE_NOT_CACHED,
                "message": "request completed but its response was too large to cache",
                "body_size": body_size,
            });
            let mut resp = (status, Json(body)).into_response();
            resp.headers_mut().insert(
                HeaderName::from_static(HEADER_RESPONSE_TRUNCATED),
                HeaderValue::from_static("true"),
            );
            resp
        }
    }
}

/// Marks the record `Failed` if the handler future is dropped or unwinds
/// before its outcome is recorded.
struct FailOnDrop {
    armed: Option<(LockCoordinator, LockHandle)>,
}

impl FailOnDrop {
    fn arm(coordinator: LockCoordinator, handle: LockHandle) -> Self {
        Self {
            armed: Some((coordinator, handle)),
        }
    }

    fn disarm(mut self) {
        self.armed = None;
    }
}

impl Drop for FailOnDrop {
    fn drop(&mut self) {
        let Some((coordinator, handle)) = self.armed.take() else {
            return;
        };
        tracing::warn!(
            service = %handle.service_id,
            key = %handle.key,
            "idempotent handler cancelled before completion; marking failed"
        );
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                rt.spawn(async move {
                    if let Err(e) = coordinator.fail(&handle).await {
                        tracing::error!(key = %handle.key, error = %e, "could not mark cancelled request failed");
                    }
                });
            }
            Err(_) => {
                tracing::error!(key = %handle.key, "no runtime to mark cancelled request failed; lock will time out");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_codes_and_statuses() {
        let cases = [
            (IdempotencyRejection::KeyRequired, 400, codes::KEY_REQUIRED),
            (IdempotencyRejection::KeyInvalid(KeyError::InvalidCharacter('@')), 400, codes::KEY_INVALID),
            (IdempotencyRejection::ConcurrentRequest, 409, codes::CONCURRENT_REQUEST),
            (IdempotencyRejection::ParameterMismatch, 422, codes::PARAMETER_MISMATCH),
            (IdempotencyRejection::StorageUnavailable, 503, codes::STORAGE_UNAVAILABLE),
            (IdempotencyRejection::RequestBodyTooLarge { limit: 10 }, 413, codes::REQUEST_BODY_TOO_LARGE),
        ];
        for (rejection, status, code) in cases {
            assert_eq!(rejection.status().as_u16(), status);
            assert_eq!(rejection.code(), code);
        }
    }

    #[test]
    fn retryable_rejections_carry_retry_after() {
        let resp = IdempotencyRejection::ConcurrentRequest.into_response();
        assert_eq!(resp.headers()[header::RETRY_AFTER], "1");
        let resp = IdempotencyRejection::StorageUnavailable.into_response();
        assert_eq!(resp.headers()[header::RETRY_AFTER], "5");
        let resp = IdempotencyRejection::ParameterMismatch.into_response();
        assert!(resp.headers().get(header::RETRY_AFTER).is_none());
    }

    #[test]
    fn only_state_changing_verbs_are_mutating() {
        for m in [Method::POST, Method::PUT, Method::PATCH, Method::DELETE] {
            assert!(is_mutating(&m));
        }
        for m in [Method::GET, Method::HEAD, Method::OPTIONS] {
            assert!(!is_mutating(&m));
        }
    }

    #[test]
    fn captured_headers_skip_framing_and_keep_first_value() {
        let mut headers = axum::http::HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("19"));
        headers.insert(header::DATE, HeaderValue::from_static("Sun, 18 Oct 2026 10:00:00 GMT"));
        headers.append("x-warehouse", HeaderValue::from_static("WH-1"));
        headers.append("x-warehouse", HeaderValue::from_static("WH-2"));

        let captured = capture_headers(&headers);
        assert_eq!(captured.len(), 2);
        assert_eq!(captured["content-type"], "application/json");
        assert_eq!(captured["x-warehouse"], "WH-1");
    }

    #[tokio::test]
    async fn every_outcome_is_counted() {
        use crate::metrics::testing::CountingMetrics;
        use crate::store::MemoryKeyStore;
        use axum::routing::post;
        use tower::ServiceExt;

        let store = MemoryKeyStore::new();
        let metrics = Arc::new(CountingMetrics::default());
        let idem = Idempotency::new(IdempotencyConfig::new("order-service"), Arc::new(store.clone()))
            .with_metrics(metrics.clone());
        let app = axum::Router::new()
            .route("/v1/orders", post(|| async { StatusCode::CREATED }))
            .layer(axum::middleware::from_fn_with_state(idem, idempotency_middleware));
        let send = |key: &'static str, body: &'static str| {
            let app = app.clone();
            async move {
                let req = axum::http::Request::post("/v1/orders")
                    .header(HEADER_IDEMPOTENCY_KEY, key)
                    .body(Body::from(body))
                    .unwrap();
                app.oneshot(req).await.unwrap().status()
            }
        };

        assert_eq!(send("k-1", "a").await, StatusCode::CREATED);
        assert_eq!(send("k-1", "a").await, StatusCode::CREATED);
        assert_eq!(send("k-1", "b").await, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(send("bad key", "a").await, StatusCode::BAD_REQUEST);
        store.set_offline(true);
        assert_eq!(send("k-2", "a").await, StatusCode::SERVICE_UNAVAILABLE);

        assert_eq!(metrics.get("miss"), 1);
        assert_eq!(metrics.get("lock_acquisition"), 1);
        assert_eq!(metrics.get("hit"), 1);
        assert_eq!(metrics.get("mismatch"), 1);
        assert_eq!(metrics.get("rejection"), 1);
        assert_eq!(metrics.get("storage_error"), 1);
    }

    #[test]
    fn truncated_replay_keeps_status_and_flags_response() {
        let resp = replay(StoredResponse::Truncated { status_code: 201, body_size: 2_000_000 });
        assert_eq!(resp.status(), StatusCode::CREATED);
        assert_eq!(resp.headers()[HEADER_RESPONSE_TRUNCATED], "true");
    }
}

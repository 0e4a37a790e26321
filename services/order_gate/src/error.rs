//! Unified API error type: every 4xx/5xx the service itself produces is JSON
//! with the same shape as the idempotency rejections.
//!
//! ```json
//! { "code": "not_found", "message": "order not found" }
//! ```

use axum::{
    http::{header::HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use wms_idempotency::middleware::codes;
use wms_idempotency::{PhaseError, StoreError};

use crate::warehouse::WarehouseError;

#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    pub retry_after_secs: Option<u64>,
    /// Extra headers to include (e.g. Retry-After).
    pub extra_headers: Vec<(String, String)>,
}

impl AppError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            retry_after_secs: None,
            extra_headers: vec![],
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", msg)
    }

    pub fn not_found(resource: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", format!("{resource} not found"))
    }

    pub fn unsupported_media_type() -> Self {
        Self::new(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "unsupported_media_type",
            "content-type must be application/json",
        )
    }

    pub fn unprocessable(code: &'static str, msg: impl Into<String>) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, code, msg)
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg)
    }

    /// Broker-style handler failure: the caller should redeliver.
    pub fn handler_failed(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "handler_failed", msg)
    }

    pub fn storage_unavailable(msg: impl Into<String>, retry_after: u64) -> Self {
        Self {
            retry_after_secs: Some(retry_after),
            extra_headers: vec![("retry-after".into(), retry_after.to_string())],
            ..Self::new(StatusCode::SERVICE_UNAVAILABLE, codes::STORAGE_UNAVAILABLE, msg)
        }
    }
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        tracing::error!(error = %e, "idempotency store failure");
        AppError::storage_unavailable(e.to_string(), 5)
    }
}

impl From<WarehouseError> for AppError {
    fn from(e: WarehouseError) -> Self {
        match e {
            WarehouseError::UnknownSku(_) | WarehouseError::InvalidQuantity(_) => {
                AppError::bad_request(e.to_string())
            }
            WarehouseError::InsufficientStock { .. } => {
                AppError::unprocessable("insufficient_stock", e.to_string())
            }
            WarehouseError::Unavailable(_) => AppError::internal(e.to_string()),
        }
    }
}

impl From<PhaseError<WarehouseError>> for AppError {
    fn from(e: PhaseError<WarehouseError>) -> Self {
        match e {
            PhaseError::Store(e) => e.into(),
            PhaseError::Step(e) => e.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ApiErrorBody {
            code: self.code,
            message: self.message,
            retry_after_secs: self.retry_after_secs,
        };
        let mut resp = (self.status, Json(body)).into_response();
        for (k, v) in &self.extra_headers {
            if let (Ok(name), Ok(val)) = (k.parse::<HeaderName>(), v.parse::<HeaderValue>()) {
                resp.headers_mut().insert(name, val);
            }
        }
        resp
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}: {}", self.status.as_u16(), self.code, self.message)
    }
}

impl std::error::Error for AppError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_body_serializes_without_optional_fields() {
        let body = ApiErrorBody {
            code: "not_found",
            message: "order not found".into(),
            retry_after_secs: None,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["code"], "not_found");
        assert_eq!(json["message"], "order not found");
        assert!(json.get("retry_after_secs").is_none());
    }

    #[test]
    fn store_errors_become_retryable_503() {
        let err: AppError = StoreError::Unavailable("connection refused".into()).into();
        assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.code, "IDEMPOTENCY_STORAGE_UNAVAILABLE");
        let resp = err.into_response();
        assert_eq!(resp.headers()["retry-after"], "5");
    }

    #[test]
    fn stock_shortage_is_unprocessable() {
        let err: AppError = WarehouseError::InsufficientStock {
            sku: "X".into(),
            requested: 5,
            available: 1,
        }
        .into();
        assert_eq!(err.status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(err.code, "insufficient_stock");
    }
}

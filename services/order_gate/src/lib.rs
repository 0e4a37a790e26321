//! Warehouse order intake behind the idempotency layer.
//!
//! `POST /v1/orders` is guarded by the idempotency middleware and runs as
//! checkpointed phases; `POST /v1/events/:topic` receives broker pushes
//! through the consumed-message dedup wrapper.

pub mod api;
pub mod error;
pub mod warehouse;

use axum::{
    extract::Request,
    http::header::{CONTENT_LENGTH, CONTENT_TYPE, TRANSFER_ENCODING},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use wms_idempotency::store::{MemoryKeyStore, MemoryMessageStore};
use wms_idempotency::{
    idempotency_middleware, Clock, ConsumerConfig, DedupHandler, Idempotency, IdempotencyConfig,
    KeyStore, MessageStore, MetricsSink, NoopMetrics, SystemClock,
};

use crate::api::InventoryReceiver;
use crate::error::AppError;
use crate::warehouse::Warehouse;

/// Idempotency keys are scoped to this service id.
pub const SERVICE_NAME: &str = "order-service";
pub const INVENTORY_TOPIC: &str = "wms.inventory";
pub const INVENTORY_CONSUMER_GROUP: &str = "order-service-inventory";

/// Caller identity recorded on new idempotency keys.
pub const HEADER_USER_ID: &str = "x-user-id";

/// Max request body size: 1 MiB
const MAX_BODY_BYTES: usize = 1_048_576;
/// Request timeout
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct AppState {
    pub warehouse: Arc<Warehouse>,
    pub idempotency: Idempotency,
    pub keys: Arc<dyn KeyStore>,
    pub messages: Arc<dyn MessageStore>,
    pub inventory_events: Arc<DedupHandler<InventoryReceiver>>,
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    /// Wire every component from explicitly constructed stores; nothing is global.
    pub fn new(
        config: IdempotencyConfig,
        keys: Arc<dyn KeyStore>,
        messages: Arc<dyn MessageStore>,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let warehouse = Arc::new(Warehouse::seeded());
        let idempotency = Idempotency::new(config, keys.clone())
            .with_metrics(metrics.clone())
            .with_clock(clock.clone())
            .with_user_id(|parts| {
                parts
                    .headers
                    .get(HEADER_USER_ID)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
            });
        let inventory_events = DedupHandler::new(
            InventoryReceiver::new(warehouse.clone()),
            ConsumerConfig::new(SERVICE_NAME, INVENTORY_TOPIC, INVENTORY_CONSUMER_GROUP),
            messages.clone(),
        )
        .with_metrics(metrics)
        .with_clock(clock.clone());
        Self {
            warehouse,
            idempotency,
            keys,
            messages,
            inventory_events: Arc::new(inventory_events),
            clock,
        }
    }

    /// Memory-backed state with default configuration and no metrics export.
    pub fn in_memory() -> Self {
        Self::new(
            IdempotencyConfig::new(SERVICE_NAME),
            Arc::new(MemoryKeyStore::new()),
            Arc::new(MemoryMessageStore::new()),
            Arc::new(SystemClock),
            Arc::new(NoopMetrics),
        )
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::in_memory()
    }
}

pub fn app() -> Router {
    app_with(AppState::default())
}

pub fn app_with(state: AppState) -> Router {
    let guarded = middleware::from_fn_with_state(state.idempotency.clone(), idempotency_middleware);
    Router::new()
        .route("/healthz", get(api::healthz))
        .route("/v1/orders", post(api::create_order).route_layer(guarded))
        .route("/v1/orders/:id", get(api::get_order))
        .route("/v1/inventory/:sku", get(api::get_inventory))
        .route("/v1/events/:topic", post(api::deliver_event))
        .route("/v1/admin/idempotency/:key", get(api::get_idempotency_record))
        .route("/v1/admin/purge", post(api::purge))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(middleware::from_fn(require_json_content_type))
        .with_state(state)
}

/// Middleware: reject POST/PUT/PATCH bodies that are not application/json.
/// Bodyless calls (e.g. `POST /v1/admin/purge`) pass.
async fn require_json_content_type(req: Request, next: Next) -> Response {
    let writes = matches!(req.method().as_str(), "POST" | "PUT" | "PATCH");
    let headers = req.headers();
    let has_body = match headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
    {
        Some(len) => len > 0,
        None => headers.contains_key(TRANSFER_ENCODING),
    };
    let is_json = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/json"));
    if writes && has_body && !is_json {
        return AppError::unsupported_media_type().into_response();
    }
    next.run(req).await
}

pub mod test {
    use super::AppState;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    /// Spawn the server on a random port. Returns the address and a
    /// JoinHandle that keeps the server alive until dropped.
    pub async fn spawn() -> (SocketAddr, tokio::task::JoinHandle<()>) {
        spawn_with(AppState::default()).await
    }

    /// Like [`spawn`], serving caller-built state so tests can reach the
    /// stores, the clock and the warehouse directly.
    pub async fn spawn_with(state: AppState) -> (SocketAddr, tokio::task::JoinHandle<()>) {
        let app = super::app_with(state);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr, handle)
    }
}

use async_trait::async_trait;
use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use wms_idempotency::{
    BoxError, ConsumeError, Delivery, IdempotencyRecord, InboundMessage,
    MessageHandler, PhaseManager, PhaseRun,
};

use crate::error::AppError;
use crate::warehouse::{OrderRequest, Warehouse};
use crate::{AppState, SERVICE_NAME};

/// Event type applied by [`InventoryReceiver`].
pub const INVENTORY_RECEIVED: &str = "wms.inventory.received";

pub async fn healthz() -> Json<serde_json::Value> {
    Json(json!({"ok": true}))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCreated {
    pub order_id: String,
}

/// `POST /v1/orders`, written as ordered phases so a retry after a partial
/// failure resumes where the failed attempt stopped.
pub async fn create_order(
    State(state): State<AppState>,
    Extension(phases): Extension<PhaseManager>,
    Json(req): Json<OrderRequest>,
) -> Result<Response, AppError> {
    let wh: &Warehouse = &state.warehouse;
    let request_ref = phases
        .key()
        .map(str::to_string)
        .unwrap_or_else(|| wh.anonymous_ref());
    let (req, rref) = (&req, request_ref.as_str());

    phases
        .run("validated", move || async move { wh.validate(req) })
        .await?;
    phases
        .run("inventory_reserved", move || async move { wh.reserve(req) })
        .await?;
    let order = match phases
        .run("order_created", move || async move { wh.create_order(rref, req) })
        .await?
    {
        PhaseRun::Ran(order) => order,
        PhaseRun::Skipped => wh
            .order_for_request(rref)
            .ok_or_else(|| AppError::internal("order checkpointed but not found"))?,
    };
    let booked = &order;
    phases
        .run("notified", move || async move { wh.notify(booked) })
        .await?;

    let location = format!("/v1/orders/{}", order.order_id);
    Ok((
        StatusCode::CREATED,
        [(header::LOCATION, location)],
        Json(OrderCreated {
            order_id: order.order_id,
        }),
    )
        .into_response())
}

pub async fn get_order(
    State(state): State<AppState>,
    Path(order_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let order = state
        .warehouse
        .order(&order_id)
        .ok_or_else(|| AppError::not_found("order"))?;
    Ok(Json(order))
}

pub async fn get_inventory(
    State(state): State<AppState>,
    Path(sku): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let level = state
        .warehouse
        .stock_level(&sku)
        .ok_or_else(|| AppError::not_found("sku"))?;
    Ok(Json(json!({
        "sku": sku,
        "onHand": level.on_hand,
        "reserved": level.reserved,
        "available": level.available(),
    })))
}

// ── Events ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct StockReceived {
    sku: String,
    qty: u64,
}

/// Applies `wms.inventory.received` events to stock levels. Other event
/// types on the topic are acknowledged and ignored.
pub struct InventoryReceiver {
    warehouse: Arc<Warehouse>,
}

impl InventoryReceiver {
    pub fn new(warehouse: Arc<Warehouse>) -> Self {
        Self { warehouse }
    }
}

#[async_trait]
impl MessageHandler for InventoryReceiver {
    async fn handle(&self, message: &InboundMessage) -> Result<(), BoxError> {
        if message.event_type != INVENTORY_RECEIVED {
            tracing::debug!(message_id = %message.id, event_type = %message.event_type, "ignoring event");
            return Ok(());
        }
        let event: StockReceived = serde_json::from_value(message.data.clone())?;
        self.warehouse.receive_stock(&event.sku, event.qty);
        Ok(())
    }
}

/// `POST /v1/events/:topic`: broker push delivery. A 2xx acknowledges the
/// message; anything else asks the broker to redeliver.
pub async fn deliver_event(
    State(state): State<AppState>,
    Path(topic): Path<String>,
    Json(message): Json<InboundMessage>,
) -> Result<impl IntoResponse, AppError> {
    let consumer = &state.inventory_events;
    if consumer.config().topic != topic {
        return Err(AppError::not_found("topic"));
    }
    let delivery = consumer.process(&message).await.map_err(|e| match e {
        ConsumeError::Store(e) => AppError::from(e),
        ConsumeError::Handler(e) => AppError::handler_failed(e.to_string()),
    })?;
    let status = match delivery {
        Delivery::Processed => "processed",
        Delivery::SkippedDuplicate => "duplicate",
    };
    Ok(Json(json!({"messageId": message.id, "status": status})))
}

// ── Admin ───────────────────────────────────────────────────────────

/// Record metadata; the cached body is never exposed here.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordView {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub status: String,
    pub request_method: String,
    pub request_path: String,
    pub request_fingerprint: String,
    pub response_status: Option<u16>,
    pub response_truncated: bool,
    pub phases: Vec<String>,
    pub lock_acquired_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
}

impl From<IdempotencyRecord> for RecordView {
    fn from(r: IdempotencyRecord) -> Self {
        Self {
            response_status: r.response.as_ref().map(|s| s.status_code()),
            response_truncated: r.response_truncated(),
            key: r.key,
            user_id: r.user_id,
            status: r.status.to_string(),
            request_method: r.request_method,
            request_path: r.request_path,
            request_fingerprint: r.request_fingerprint.as_str().to_string(),
            phases: r.phase_checkpoints.into_iter().map(|c| c.name).collect(),
            lock_acquired_at: r.lock_acquired_at,
            created_at: r.created_at,
            completed_at: r.completed_at,
            expires_at: r.expires_at,
        }
    }
}

pub async fn get_idempotency_record(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let record = state
        .keys
        .get(SERVICE_NAME, &key, state.clock.now())
        .await?
        .ok_or_else(|| AppError::not_found("idempotency key"))?;
    Ok(Json(RecordView::from(record)))
}

pub async fn purge(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let now = state.clock.now();
    let keys = state.keys.purge_expired(now).await?;
    let messages = state.messages.purge_expired(now).await?;
    tracing::info!(keys, messages, "expired records purged");
    Ok(Json(json!({"keys": keys, "messages": messages})))
}

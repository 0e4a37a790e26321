//! In-process warehouse: stock levels, order book and a notification outbox.
//!
//! None of these operations is idempotent on its own. Reserving twice holds
//! twice the stock, creating twice books two orders. Exactly-once behaviour
//! comes from the idempotency layer in front of the handlers.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WarehouseError {
    #[error("unknown sku {0:?}")]
    UnknownSku(String),

    #[error("quantity must be positive, got {0}")]
    InvalidQuantity(i64),

    #[error("insufficient stock for {sku}: requested {requested}, available {available}")]
    InsufficientStock {
        sku: String,
        requested: u64,
        available: u64,
    },

    #[error("{0} temporarily unavailable")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub sku: String,
    pub qty: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StockLevel {
    pub on_hand: u64,
    pub reserved: u64,
}

impl StockLevel {
    pub fn available(&self) -> u64 {
        self.on_hand.saturating_sub(self.reserved)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Created,
    Notified,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub order_id: String,
    pub sku: String,
    pub qty: u64,
    pub status: OrderStatus,
    /// Idempotency key (or generated reference) of the request that booked it.
    pub request_ref: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderNotification {
    pub order_id: String,
    pub sku: String,
    pub qty: u64,
}

#[derive(Default)]
pub struct Warehouse {
    stock: RwLock<HashMap<String, StockLevel>>,
    orders: RwLock<HashMap<String, Order>>,
    orders_by_request: RwLock<HashMap<String, String>>,
    outbox: RwLock<Vec<OrderNotification>>,
    next_order: AtomicU64,
    next_anonymous: AtomicU64,
    reservations: AtomicU64,
    faults: Mutex<HashSet<String>>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|p| p.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|p| p.into_inner())
}

impl Warehouse {
    /// Demo stock: `X` 100 units, `Y` 50 units.
    pub fn seeded() -> Self {
        let wh = Self::default();
        wh.receive_stock("X", 100);
        wh.receive_stock("Y", 50);
        wh
    }

    /// Reference for requests that carry no idempotency key.
    pub fn anonymous_ref(&self) -> String {
        format!("anon-{}", self.next_anonymous.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Make the next call of `step` ("reserve", "create_order" or "notify")
    /// fail with [`WarehouseError::Unavailable`].
    pub fn fail_next(&self, step: &str) {
        self.faults
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(step.to_string());
    }

    fn check_fault(&self, step: &str) -> Result<(), WarehouseError> {
        let injected = self
            .faults
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(step);
        if injected {
            tracing::warn!(step, "injected warehouse fault");
            return Err(WarehouseError::Unavailable(step.to_string()));
        }
        Ok(())
    }

    pub fn validate(&self, req: &OrderRequest) -> Result<(), WarehouseError> {
        if req.qty <= 0 {
            return Err(WarehouseError::InvalidQuantity(req.qty));
        }
        let stock = read(&self.stock);
        let level = stock
            .get(&req.sku)
            .ok_or_else(|| WarehouseError::UnknownSku(req.sku.clone()))?;
        let requested = req.qty as u64;
        if level.available() < requested {
            return Err(WarehouseError::InsufficientStock {
                sku: req.sku.clone(),
                requested,
                available: level.available(),
            });
        }
        Ok(())
    }

    /// Hold `qty` units of `sku`. Available stock is re-checked under the lock.
    pub fn reserve(&self, req: &OrderRequest) -> Result<(), WarehouseError> {
        self.check_fault("reserve")?;
        if req.qty <= 0 {
            return Err(WarehouseError::InvalidQuantity(req.qty));
        }
        let requested = req.qty as u64;
        let mut stock = write(&self.stock);
        let level = stock
            .get_mut(&req.sku)
            .ok_or_else(|| WarehouseError::UnknownSku(req.sku.clone()))?;
        if level.available() < requested {
            return Err(WarehouseError::InsufficientStock {
                sku: req.sku.clone(),
                requested,
                available: level.available(),
            });
        }
        level.reserved += requested;
        self.reservations.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(sku = %req.sku, qty = requested, "stock reserved");
        Ok(())
    }

    pub fn create_order(&self, request_ref: &str, req: &OrderRequest) -> Result<Order, WarehouseError> {
        self.check_fault("create_order")?;
        let n = self.next_order.fetch_add(1, Ordering::SeqCst) + 1;
        let order = Order {
            order_id: format!("ORD-{n}"),
            sku: req.sku.clone(),
            qty: req.qty.max(0) as u64,
            status: OrderStatus::Created,
            request_ref: request_ref.to_string(),
        };
        write(&self.orders).insert(order.order_id.clone(), order.clone());
        write(&self.orders_by_request).insert(request_ref.to_string(), order.order_id.clone());
        metrics::counter!("warehouse_orders_created_total", "sku" => order.sku.clone()).increment(1);
        tracing::info!(order_id = %order.order_id, sku = %order.sku, qty = order.qty, "order created");
        Ok(order)
    }

    /// The order booked by an earlier attempt of the same request.
    pub fn order_for_request(&self, request_ref: &str) -> Option<Order> {
        let id = read(&self.orders_by_request).get(request_ref).cloned()?;
        self.order(&id)
    }

    pub fn notify(&self, order: &Order) -> Result<(), WarehouseError> {
        self.check_fault("notify")?;
        write(&self.outbox).push(OrderNotification {
            order_id: order.order_id.clone(),
            sku: order.sku.clone(),
            qty: order.qty,
        });
        if let Some(o) = write(&self.orders).get_mut(&order.order_id) {
            o.status = OrderStatus::Notified;
        }
        Ok(())
    }

    /// Add received units; unknown SKUs are created.
    pub fn receive_stock(&self, sku: &str, qty: u64) {
        let mut stock = write(&self.stock);
        let level = stock.entry(sku.to_string()).or_default();
        level.on_hand += qty;
        tracing::debug!(sku, qty, on_hand = level.on_hand, "stock received");
    }

    pub fn stock_level(&self, sku: &str) -> Option<StockLevel> {
        read(&self.stock).get(sku).copied()
    }

    pub fn order(&self, order_id: &str) -> Option<Order> {
        read(&self.orders).get(order_id).cloned()
    }

    pub fn order_count(&self) -> usize {
        read(&self.orders).len()
    }

    /// Successful `reserve` calls so far.
    pub fn reservation_count(&self) -> u64 {
        self.reservations.load(Ordering::SeqCst)
    }

    pub fn notifications(&self) -> Vec<OrderNotification> {
        read(&self.outbox).clone()
    }
}

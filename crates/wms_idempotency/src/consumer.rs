//! Consumer-side dedup: turns at-least-once broker delivery into
//! effectively-once handling.
//!
//! The consumed-message record is written only after the wrapped handler
//! succeeds. A crash in between means the message is handled again on
//! redelivery, so wrapped handlers must themselves be idempotent (or call
//! downstream services with idempotency keys).

use crate::clock::{Clock, SystemClock};
use crate::config::ConsumerConfig;
use crate::error::{BoxError, ConsumeError};
use crate::metrics::{MetricsSink, NoopMetrics};
use crate::record::{to_chrono, ConsumedMessageRecord};
use crate::store::{MarkOutcome, MessageStore};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;

/// CloudEvent-shaped broker message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl InboundMessage {
    pub fn new(id: impl Into<String>, event_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            event_type: event_type.into(),
            source: String::new(),
            subject: None,
            correlation_id: None,
            workflow_id: None,
            data,
        }
    }
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &InboundMessage) -> Result<(), BoxError>;
}

/// Adapter turning an async closure into a [`MessageHandler`].
pub struct FnHandler<F>(F);

pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(InboundMessage) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), BoxError>> + Send,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(InboundMessage) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), BoxError>> + Send,
{
    async fn handle(&self, message: &InboundMessage) -> Result<(), BoxError> {
        (self.0)(message.clone()).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Processed,
    /// Seen before by this (service, consumer group); acknowledged untouched.
    SkippedDuplicate,
}

/// A [`MessageHandler`] wrapped with consumed-message dedup.
pub struct DedupHandler<H> {
    inner: H,
    config: ConsumerConfig,
    store: Arc<dyn MessageStore>,
    metrics: Arc<dyn MetricsSink>,
    clock: Arc<dyn Clock>,
}

impl<H: MessageHandler> DedupHandler<H> {
    pub fn new(inner: H, config: ConsumerConfig, store: Arc<dyn MessageStore>) -> Self {
        Self {
            inner,
            config,
            store,
            metrics: Arc::new(NoopMetrics),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    pub async fn process(&self, message: &InboundMessage) -> Result<Delivery, ConsumeError> {
        let cfg = &self.config;
        let now = self.clock.now();

        let seen = self
            .store
            .is_consumed(&message.id, &cfg.service_name, &cfg.consumer_group, now)
            .await
            .map_err(|e| {
                self.metrics
                    .record_message_error(&cfg.service_name, &cfg.topic, &message.event_type);
                tracing::error!(
                    error = %e,
                    message_id = %message.id,
                    topic = %cfg.topic,
                    event_type = %message.event_type,
                    service = %cfg.service_name,
                    "failed to check whether message was consumed"
                );
                e
            })?;

        if seen {
            self.metrics
                .record_message_hit(&cfg.service_name, &cfg.topic, &message.event_type);
            tracing::info!(
                message_id = %message.id,
                topic = %cfg.topic,
                event_type = %message.event_type,
                service = %cfg.service_name,
                "duplicate message skipped"
            );
            return Ok(Delivery::SkippedDuplicate);
        }

        self.metrics
            .record_message_miss(&cfg.service_name, &cfg.topic, &message.event_type);

        if let Err(e) = self.inner.handle(message).await {
            tracing::error!(
                error = %e,
                message_id = %message.id,
                topic = %cfg.topic,
                event_type = %message.event_type,
                service = %cfg.service_name,
                "message handler failed; leaving unrecorded for redelivery"
            );
            return Err(ConsumeError::Handler(e));
        }

        let done = self.clock.now();
        let record = ConsumedMessageRecord {
            message_id: message.id.clone(),
            service_name: cfg.service_name.clone(),
            topic: cfg.topic.clone(),
            consumer_group: cfg.consumer_group.clone(),
            event_type: message.event_type.clone(),
            correlation_id: message.correlation_id.clone(),
            workflow_id: message.workflow_id.clone(),
            consumed_at: done,
            expires_at: done + to_chrono(cfg.retention_period),
        };

        match self.store.mark_consumed(&record, done).await {
            Ok(MarkOutcome::Recorded) => {
                tracing::debug!(message_id = %message.id, topic = %cfg.topic, "message processed and recorded");
            }
            Ok(MarkOutcome::AlreadyRecorded) => {
                tracing::warn!(
                    message_id = %message.id,
                    topic = %cfg.topic,
                    service = %cfg.service_name,
                    "message was processed concurrently"
                );
            }
            Err(e) => {
                self.metrics
                    .record_message_error(&cfg.service_name, &cfg.topic, &message.event_type);
                tracing::error!(
                    error = %e,
                    message_id = %message.id,
                    topic = %cfg.topic,
                    service = %cfg.service_name,
                    "handled message could not be recorded; it may be reprocessed"
                );
                return Err(ConsumeError::Store(e));
            }
        }
        Ok(Delivery::Processed)
    }
}

#[async_trait]
impl<H: MessageHandler> MessageHandler for DedupHandler<H> {
    async fn handle(&self, message: &InboundMessage) -> Result<(), BoxError> {
        self.process(message).await.map(|_| ()).map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::testing::CountingMetrics;
    use crate::store::MemoryMessageStore;
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn evt42() -> InboundMessage {
        let mut m = InboundMessage::new(
            "evt-42",
            "wms.order.received",
            serde_json::json!({"orderId": "ORD-1"}),
        );
        m.correlation_id = Some("corr-7".into());
        m
    }

    fn config(group: &str) -> ConsumerConfig {
        ConsumerConfig::new("inventory-service", "wms.orders", group)
    }

    fn counting_handler(calls: Arc<AtomicU32>) -> impl MessageHandler {
        handler_fn(move |_msg| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<(), BoxError>(())
            }
        })
    }

    #[tokio::test]
    async fn redelivered_message_is_handled_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let store = MemoryMessageStore::new();
        let metrics = Arc::new(CountingMetrics::default());
        let wrapped = DedupHandler::new(counting_handler(calls.clone()), config("inventory"), Arc::new(store.clone()))
            .with_metrics(metrics.clone());

        assert_eq!(wrapped.process(&evt42()).await.unwrap(), Delivery::Processed);
        for _ in 0..4 {
            assert_eq!(wrapped.process(&evt42()).await.unwrap(), Delivery::SkippedDuplicate);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(metrics.get("message_miss"), 1);
        assert_eq!(metrics.get("message_hit"), 4);
        assert!(store
            .is_consumed("evt-42", "inventory-service", "inventory", Utc::now())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn failed_handler_leaves_message_for_redelivery() {
        let attempts = Arc::new(AtomicU32::new(0));
        let seen = attempts.clone();
        let flaky = handler_fn(move |_msg| {
            let seen = seen.clone();
            async move {
                if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err::<(), BoxError>("inventory db timeout".into());
                }
                Ok::<(), BoxError>(())
            }
        });
        let wrapped = DedupHandler::new(flaky, config("inventory"), Arc::new(MemoryMessageStore::new()));

        assert!(matches!(wrapped.process(&evt42()).await, Err(ConsumeError::Handler(_))));
        assert_eq!(wrapped.process(&evt42()).await.unwrap(), Delivery::Processed);
        assert_eq!(wrapped.process(&evt42()).await.unwrap(), Delivery::SkippedDuplicate);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn consumer_groups_are_independent() {
        let calls = Arc::new(AtomicU32::new(0));
        let store: Arc<dyn MessageStore> = Arc::new(MemoryMessageStore::new());
        let inventory = DedupHandler::new(counting_handler(calls.clone()), config("inventory"), store.clone());
        let billing = DedupHandler::new(counting_handler(calls.clone()), config("billing"), store);
        inventory.process(&evt42()).await.unwrap();
        billing.process(&evt42()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn store_outage_fails_delivery_without_running_handler() {
        let calls = Arc::new(AtomicU32::new(0));
        let store = MemoryMessageStore::new();
        store.set_offline(true);
        let wrapped = DedupHandler::new(counting_handler(calls.clone()), config("inventory"), Arc::new(store));
        assert!(matches!(wrapped.process(&evt42()).await, Err(ConsumeError::Store(_))));
        assert!(wrapped.handle(&evt42()).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn concurrent_mark_by_another_replica_counts_as_success() {
        let store = MemoryMessageStore::new();
        let other_replica = store.clone();
        // the handler races a second replica that records the message first
        let racing = handler_fn(move |msg: InboundMessage| {
            let other = other_replica.clone();
            async move {
                let now = Utc::now();
                let rec = ConsumedMessageRecord {
                    message_id: msg.id,
                    service_name: "inventory-service".into(),
                    topic: "wms.orders".into(),
                    consumer_group: "inventory".into(),
                    event_type: msg.event_type,
                    correlation_id: None,
                    workflow_id: None,
                    consumed_at: now,
                    expires_at: now + chrono::Duration::hours(1),
                };
                other
                    .mark_consumed(&rec, now)
                    .await
                    .map(|_| ())
                    .map_err(BoxError::from)
            }
        });
        let wrapped = DedupHandler::new(racing, config("inventory"), Arc::new(store));
        assert_eq!(wrapped.process(&evt42()).await.unwrap(), Delivery::Processed);
    }

    #[test]
    fn cloud_event_json_shape() {
        let m: InboundMessage = serde_json::from_value(serde_json::json!({
            "id": "evt-42",
            "type": "wms.order.received",
            "source": "/order-service",
            "correlationId": "corr-7",
            "data": {"orderId": "ORD-1"}
        }))
        .unwrap();
        assert_eq!(m.event_type, "wms.order.received");
        assert_eq!(m.correlation_id.as_deref(), Some("corr-7"));
        assert_eq!(m.workflow_id, None);
    }
}

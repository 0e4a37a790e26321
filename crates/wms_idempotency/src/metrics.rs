//! Metrics sink injected into the middleware and the consumer wrapper.
//!
//! [`RecorderMetrics`] forwards to the `metrics` facade, so whichever
//! recorder the binary installs (Prometheus in `order_gate`) receives them.
//!
//! Counters carry `_total`, histograms `_seconds`.

use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use std::time::Duration;

const HITS: &str = "idempotency_hits_total";
const MISSES: &str = "idempotency_misses_total";
const PARAMETER_MISMATCHES: &str = "idempotency_parameter_mismatches_total";
const CONCURRENT_COLLISIONS: &str = "idempotency_concurrent_collisions_total";
const REJECTIONS: &str = "idempotency_rejections_total";
const LOCK_ACQUISITION: &str = "idempotency_lock_acquisition_duration_seconds";
const STORAGE_ERRORS: &str = "idempotency_storage_errors_total";
const MESSAGE_HITS: &str = "message_deduplication_hits_total";
const MESSAGE_MISSES: &str = "message_deduplication_misses_total";
const MESSAGE_ERRORS: &str = "message_deduplication_errors_total";

/// `service, endpoint, method` labels shared by every request metric.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLabels {
    pub service: String,
    pub endpoint: String,
    pub method: String,
}

impl RequestLabels {
    pub fn new(
        service: impl Into<String>,
        endpoint: impl Into<String>,
        method: impl Into<String>,
    ) -> Self {
        Self {
            service: service.into(),
            endpoint: endpoint.into(),
            method: method.into(),
        }
    }
}

pub trait MetricsSink: Send + Sync {
    /// A completed record was replayed.
    fn record_hit(&self, labels: &RequestLabels);
    /// The lock was acquired and the handler ran.
    fn record_miss(&self, labels: &RequestLabels);
    fn record_parameter_mismatch(&self, labels: &RequestLabels);
    fn record_concurrent_collision(&self, labels: &RequestLabels);
    /// Key missing or malformed; `code` is the rejection code.
    fn record_rejection(&self, labels: &RequestLabels, code: &str);
    fn record_lock_acquisition(&self, labels: &RequestLabels, elapsed: Duration);
    fn record_storage_error(&self, service: &str, operation: &str);

    fn record_message_hit(&self, service: &str, topic: &str, event_type: &str);
    fn record_message_miss(&self, service: &str, topic: &str, event_type: &str);
    fn record_message_error(&self, service: &str, topic: &str, event_type: &str);
}

/// Sink that drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record_hit(&self, _: &RequestLabels) {}
    fn record_miss(&self, _: &RequestLabels) {}
    fn record_parameter_mismatch(&self, _: &RequestLabels) {}
    fn record_concurrent_collision(&self, _: &RequestLabels) {}
    fn record_rejection(&self, _: &RequestLabels, _: &str) {}
    fn record_lock_acquisition(&self, _: &RequestLabels, _: Duration) {}
    fn record_storage_error(&self, _: &str, _: &str) {}
    fn record_message_hit(&self, _: &str, _: &str, _: &str) {}
    fn record_message_miss(&self, _: &str, _: &str, _: &str) {}
    fn record_message_error(&self, _: &str, _: &str, _: &str) {}
}

/// Sink backed by the global `metrics` recorder.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecorderMetrics;

impl RecorderMetrics {
    /// Register help text with the installed recorder. Call once after the
    /// exporter is installed.
    pub fn describe() {
        describe_counter!(HITS, "Idempotency cache hits (cached response returned)");
        describe_counter!(MISSES, "Idempotency cache misses (new request processed)");
        describe_counter!(PARAMETER_MISMATCHES, "Same key reused with a different request");
        describe_counter!(CONCURRENT_COLLISIONS, "Requests rejected with 409 while a lock was held");
        describe_counter!(REJECTIONS, "Requests rejected for a missing or malformed key");
        describe_histogram!(LOCK_ACQUISITION, Unit::Seconds, "Time taken to acquire the idempotency lock");
        describe_counter!(STORAGE_ERRORS, "Idempotency store failures");
        describe_counter!(MESSAGE_HITS, "Duplicate messages skipped");
        describe_counter!(MESSAGE_MISSES, "New messages processed");
        describe_counter!(MESSAGE_ERRORS, "Errors during message deduplication");
    }
}

impl MetricsSink for RecorderMetrics {
    fn record_hit(&self, l: &RequestLabels) {
        counter!(HITS, "service" => l.service.clone(), "endpoint" => l.endpoint.clone(), "method" => l.method.clone())
            .increment(1);
    }

    fn record_miss(&self, l: &RequestLabels) {
        counter!(MISSES, "service" => l.service.clone(), "endpoint" => l.endpoint.clone(), "method" => l.method.clone())
            .increment(1);
    }

    fn record_parameter_mismatch(&self, l: &RequestLabels) {
        counter!(PARAMETER_MISMATCHES, "service" => l.service.clone(), "endpoint" => l.endpoint.clone(), "method" => l.method.clone())
            .increment(1);
    }

    fn record_concurrent_collision(&self, l: &RequestLabels) {
        counter!(CONCURRENT_COLLISIONS, "service" => l.service.clone(), "endpoint" => l.endpoint.clone(), "method" => l.method.clone())
            .increment(1);
    }

    fn record_rejection(&self, l: &RequestLabels, code: &str) {
        counter!(
            REJECTIONS,
            "service" => l.service.clone(),
            "endpoint" => l.endpoint.clone(),
            "method" => l.method.clone(),
            "code" => code.to_string()
        )
        .increment(1);
    }

    fn record_lock_acquisition(&self, l: &RequestLabels, elapsed: Duration) {
        histogram!(LOCK_ACQUISITION, "service" => l.service.clone(), "endpoint" => l.endpoint.clone(), "method" => l.method.clone())
            .record(elapsed.as_secs_f64());
    }

    fn record_storage_error(&self, service: &str, operation: &str) {
        counter!(STORAGE_ERRORS, "service" => service.to_string(), "operation" => operation.to_string())
            .increment(1);
    }

    fn record_message_hit(&self, service: &str, topic: &str, event_type: &str) {
        counter!(MESSAGE_HITS, "service" => service.to_string(), "topic" => topic.to_string(), "event_type" => event_type.to_string())
            .increment(1);
    }

    fn record_message_miss(&self, service: &str, topic: &str, event_type: &str) {
        counter!(MESSAGE_MISSES, "service" => service.to_string(), "topic" => topic.to_string(), "event_type" => event_type.to_string())
            .increment(1);
    }

    fn record_message_error(&self, service: &str, topic: &str, event_type: &str) {
        counter!(MESSAGE_ERRORS, "service" => service.to_string(), "topic" => topic.to_string(), "event_type" => event_type.to_string())
            .increment(1);
    }
}

/// Counting sink for assertions in unit and integration tests.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    pub struct CountingMetrics {
        counts: Mutex<HashMap<&'static str, u64>>,
    }

    impl CountingMetrics {
        pub fn get(&self, name: &str) -> u64 {
            self.counts.lock().unwrap().get(name).copied().unwrap_or(0)
        }

        fn bump(&self, name: &'static str) {
            *self.counts.lock().unwrap().entry(name).or_default() += 1;
        }
    }

    impl MetricsSink for CountingMetrics {
        fn record_hit(&self, _: &RequestLabels) {
            self.bump("hit")
        }
        fn record_miss(&self, _: &RequestLabels) {
            self.bump("miss")
        }
        fn record_parameter_mismatch(&self, _: &RequestLabels) {
            self.bump("mismatch")
        }
        fn record_concurrent_collision(&self, _: &RequestLabels) {
            self.bump("collision")
        }
        fn record_rejection(&self, _: &RequestLabels, _: &str) {
            self.bump("rejection")
        }
        fn record_lock_acquisition(&self, _: &RequestLabels, _: Duration) {
            self.bump("lock_acquisition")
        }
        fn record_storage_error(&self, _: &str, _: &str) {
            self.bump("storage_error")
        }
        fn record_message_hit(&self, _: &str, _: &str, _: &str) {
            self.bump("message_hit")
        }
        fn record_message_miss(&self, _: &str, _: &str, _: &str) {
            self.bump("message_miss")
        }
        fn record_message_error(&self, _: &str, _: &str, _: &str) {
            self.bump("message_error")
        }
    }
}

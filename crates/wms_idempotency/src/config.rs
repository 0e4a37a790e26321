//! Per-service configuration, injected at startup.

use std::time::Duration;

/// Stripe-compatible maximum key length.
pub const DEFAULT_MAX_KEY_LENGTH: usize = 255;
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_RETENTION_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);
/// 1 MiB
pub const DEFAULT_MAX_RESPONSE_SIZE: usize = 1_048_576;
/// 1 MiB
pub const DEFAULT_MAX_REQUEST_SIZE: usize = 1_048_576;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyConfig {
    /// Owning service; keys are unique per service, not globally.
    pub service_name: String,
    /// Reject mutating requests without a key instead of running them unguarded.
    pub require_key: bool,
    /// Only guard POST, PUT, PATCH and DELETE.
    pub only_mutating: bool,
    pub max_key_length: usize,
    /// Age after which an in-progress lock is considered abandoned.
    pub lock_timeout: Duration,
    pub retention_period: Duration,
    /// Larger response bodies are not cached; the record is flagged truncated.
    pub max_response_size: usize,
    /// Request bodies are buffered for fingerprinting up to this size.
    pub max_request_size: usize,
}

impl IdempotencyConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            require_key: false,
            only_mutating: true,
            max_key_length: DEFAULT_MAX_KEY_LENGTH,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            retention_period: DEFAULT_RETENTION_PERIOD,
            max_response_size: DEFAULT_MAX_RESPONSE_SIZE,
            max_request_size: DEFAULT_MAX_REQUEST_SIZE,
        }
    }

    /// Defaults overlaid with `IDEMP_*` environment variables. Values that
    /// fail to parse, or are zero, keep their default.
    pub fn from_env(service_name: impl Into<String>) -> Self {
        Self::from_lookup(service_name, |name| std::env::var(name).ok())
    }

    fn from_lookup(
        service_name: impl Into<String>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Self {
        let parsed = |name: &str| {
            let raw = lookup(name)?;
            match raw.trim().parse::<u64>() {
                Ok(v) if v > 0 => Some(v),
                _ => {
                    tracing::warn!(var = name, value = %raw, "ignoring invalid setting, keeping default");
                    None
                }
            }
        };
        let flag = |name: &str| {
            lookup(name).and_then(|v| match v.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Some(true),
                "0" | "false" | "no" | "off" => Some(false),
                _ => None,
            })
        };

        let mut cfg = Self::new(service_name);
        if let Some(v) = flag("IDEMP_REQUIRE_KEY") {
            cfg.require_key = v;
        }
        if let Some(v) = flag("IDEMP_ONLY_MUTATING") {
            cfg.only_mutating = v;
        }
        if let Some(v) = parsed("IDEMP_MAX_KEY_LENGTH") {
            cfg.max_key_length = v as usize;
        }
        if let Some(v) = parsed("IDEMP_LOCK_TIMEOUT_SECS") {
            cfg.lock_timeout = Duration::from_secs(v);
        }
        if let Some(v) = parsed("IDEMP_RETENTION_SECS") {
            cfg.retention_period = Duration::from_secs(v);
        }
        if let Some(v) = parsed("IDEMP_MAX_RESPONSE_BYTES") {
            cfg.max_response_size = v as usize;
        }
        if let Some(v) = parsed("IDEMP_MAX_REQUEST_BYTES") {
            cfg.max_request_size = v as usize;
        }
        cfg
    }

    pub fn require_key(mut self, require: bool) -> Self {
        self.require_key = require;
        self
    }

    pub fn only_mutating(mut self, only: bool) -> Self {
        self.only_mutating = only;
        self
    }

    pub fn max_key_length(mut self, max: usize) -> Self {
        self.max_key_length = max;
        self
    }

    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn retention_period(mut self, retention: Duration) -> Self {
        self.retention_period = retention;
        self
    }

    pub fn max_response_size(mut self, bytes: usize) -> Self {
        self.max_response_size = bytes;
        self
    }

    pub fn max_request_size(mut self, bytes: usize) -> Self {
        self.max_request_size = bytes;
        self
    }
}

/// Consumer-side dedup scope: records are unique per
/// (message id, service, consumer group).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    pub service_name: String,
    pub topic: String,
    pub consumer_group: String,
    pub retention_period: Duration,
}

impl ConsumerConfig {
    pub fn new(
        service_name: impl Into<String>,
        topic: impl Into<String>,
        consumer_group: impl Into<String>,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            topic: topic.into(),
            consumer_group: consumer_group.into(),
            retention_period: DEFAULT_RETENTION_PERIOD,
        }
    }

    pub fn retention_period(mut self, retention: Duration) -> Self {
        self.retention_period = retention;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = IdempotencyConfig::new("order-service");
        assert!(!cfg.require_key);
        assert!(cfg.only_mutating);
        assert_eq!(cfg.max_key_length, 255);
        assert_eq!(cfg.lock_timeout, Duration::from_secs(300));
        assert_eq!(cfg.retention_period, Duration::from_secs(86_400));
        assert_eq!(cfg.max_response_size, 1024 * 1024);
    }

    #[test]
    fn env_overrides_are_applied() {
        let cfg = IdempotencyConfig::from_lookup(
            "wave-service",
            env(&[
                ("IDEMP_REQUIRE_KEY", "true"),
                ("IDEMP_ONLY_MUTATING", "0"),
                ("IDEMP_LOCK_TIMEOUT_SECS", "30"),
                ("IDEMP_MAX_RESPONSE_BYTES", "2048"),
            ]),
        );
        assert!(cfg.require_key);
        assert!(!cfg.only_mutating);
        assert_eq!(cfg.lock_timeout, Duration::from_secs(30));
        assert_eq!(cfg.max_response_size, 2048);
        assert_eq!(cfg.retention_period, DEFAULT_RETENTION_PERIOD);
    }

    #[test]
    fn unparsable_env_values_keep_defaults() {
        let cfg = IdempotencyConfig::from_lookup(
            "pick-service",
            env(&[("IDEMP_REQUIRE_KEY", "maybe"), ("IDEMP_MAX_KEY_LENGTH", "-4")]),
        );
        assert!(!cfg.require_key);
        assert_eq!(cfg.max_key_length, DEFAULT_MAX_KEY_LENGTH);
    }

    #[test]
    fn zero_values_keep_defaults() {
        let cfg = IdempotencyConfig::from_lookup(
            "order-service",
            env(&[
                ("IDEMP_LOCK_TIMEOUT_SECS", "0"),
                ("IDEMP_RETENTION_SECS", "0"),
                ("IDEMP_MAX_KEY_LENGTH", " 0 "),
            ]),
        );
        assert_eq!(cfg.lock_timeout, DEFAULT_LOCK_TIMEOUT);
        assert_eq!(cfg.retention_period, DEFAULT_RETENTION_PERIOD);
        assert_eq!(cfg.max_key_length, DEFAULT_MAX_KEY_LENGTH);
    }

    #[test]
    fn consumer_config_uses_default_retention() {
        let cfg = ConsumerConfig::new("inventory-service", "wms.orders", "inventory-consumers");
        assert_eq!(cfg.retention_period, DEFAULT_RETENTION_PERIOD);
    }
}

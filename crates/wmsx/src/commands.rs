use colored::Colorize;
use reqwest::blocking::Response;
use reqwest::header::RETRY_AFTER;
use serde_json::{json, Value};
use std::fs;
use std::io::{self, Read};
use std::thread;
use std::time::Duration;
use thiserror::Error;
use wms_idempotency::middleware::codes;
use wms_idempotency::middleware::HEADER_RESPONSE_TRUNCATED;
use wms_idempotency::{fingerprint as compute_fingerprint, normalize_key, validate_key, HEADER_IDEMPOTENCY_KEY};

/// Longest wait between order retries, whatever the backoff or Retry-After says.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum CliError {
    #[error("{0}")]
    Input(String),

    #[error("request failed: {0}")]
    Transport(String),

    /// Non-2xx answer. `code` is the `code` field of the JSON error body.
    #[error("HTTP {status} {}: {message}", .code.as_deref().unwrap_or("-"))]
    Http {
        status: u16,
        code: Option<String>,
        message: String,
    },
}

impl CliError {
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Http { code, .. } => code.as_deref(),
            _ => None,
        }
    }
}

pub struct Client {
    base: String,
    http: reqwest::blocking::Client,
}

impl Client {
    pub fn new(base: &str) -> Self {
        Self {
            base: base.trim_end_matches('/').to_string(),
            http: reqwest::blocking::Client::new(),
        }
    }

    fn get(&self, path: &str) -> Result<Response, CliError> {
        let url = format!("{}{}", self.base, path);
        self.http
            .get(&url)
            .send()
            .map_err(|e| CliError::Transport(e.to_string()))
    }

    fn post(&self, path: &str, body: Option<&Value>, key: Option<&str>) -> Result<Response, CliError> {
        let url = format!("{}{}", self.base, path);
        let mut req = self.http.post(&url);
        if let Some(body) = body {
            req = req.json(body);
        }
        if let Some(key) = key {
            req = req.header(HEADER_IDEMPOTENCY_KEY, key);
        }
        req.send().map_err(|e| CliError::Transport(e.to_string()))
    }
}

/// Turn a non-2xx response into [`CliError::Http`], keeping the body's `code`.
fn check(resp: Response) -> Result<Value, CliError> {
    let status = resp.status();
    let json: Value = resp.json().unwrap_or(Value::Null);
    if status.is_success() {
        return Ok(json);
    }
    Err(http_error(status.as_u16(), &json))
}

fn http_error(status: u16, body: &Value) -> CliError {
    CliError::Http {
        status,
        code: body.get("code").and_then(|c| c.as_str()).map(str::to_string),
        message: body
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("unknown error")
            .to_string(),
    }
}

fn read_input(file: &str) -> Result<String, CliError> {
    if file == "-" {
        let mut buf = String::new();
        io::stdin()
            .read_to_string(&mut buf)
            .map_err(|e| CliError::Input(format!("read stdin: {e}")))?;
        Ok(buf)
    } else {
        fs::read_to_string(file).map_err(|e| CliError::Input(format!("read {file}: {e}")))
    }
}

// ── order ───────────────────────────────────────────────────────

pub struct RetryPolicy {
    pub retries: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    /// Exponential backoff, never shorter than the server's Retry-After.
    pub fn delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let exp = self.backoff.saturating_mul(1u32 << attempt.min(16));
        exp.max(retry_after.unwrap_or_default()).min(MAX_RETRY_DELAY)
    }
}

/// 409 and 503 are transient: the same key is resent.
fn is_retryable(status: u16, code: Option<&str>) -> bool {
    matches!(
        (status, code),
        (409, Some(codes::CONCURRENT_REQUEST)) | (503, _)
    )
}

fn retry_after(resp: &Response) -> Option<Duration> {
    resp.headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

pub fn order(
    client: &Client,
    sku: &str,
    qty: i64,
    key: Option<String>,
    policy: &RetryPolicy,
) -> Result<(), CliError> {
    let key = match key {
        Some(k) => {
            let k = normalize_key(&k).to_string();
            validate_key(&k, wms_idempotency::config::DEFAULT_MAX_KEY_LENGTH).map_err(|e| {
                CliError::Http {
                    status: 400,
                    code: Some(codes::KEY_INVALID.to_string()),
                    message: format!("refusing to send: {e}"),
                }
            })?;
            k
        }
        None => uuid::Uuid::new_v4().to_string(),
    };
    let body = json!({"sku": sku, "qty": qty});
    println!("{} {}", "Key:    ".dimmed(), key.cyan());

    let mut attempt = 0;
    loop {
        let resp = client.post("/v1/orders", Some(&body), Some(&key))?;
        let status = resp.status().as_u16();
        let truncated = resp.headers().contains_key(HEADER_RESPONSE_TRUNCATED);
        let wait = retry_after(&resp);
        let json: Value = resp.json().unwrap_or(Value::Null);

        if (200..300).contains(&status) {
            if truncated {
                println!("{}", "completed earlier; response was too large to cache".yellow());
            } else {
                let id = json.get("orderId").and_then(|o| o.as_str()).unwrap_or("?");
                println!("{} {}", "Order:  ".dimmed(), id.green().bold());
            }
            return Ok(());
        }

        let err = http_error(status, &json);
        if !is_retryable(status, err.code()) || attempt >= policy.retries {
            return Err(err);
        }
        let delay = policy.delay(attempt, wait);
        attempt += 1;
        eprintln!(
            "{} {} (attempt {}/{}), retrying in {} ms with the same key",
            "retry:".yellow(),
            err,
            attempt,
            policy.retries,
            delay.as_millis()
        );
        thread::sleep(delay);
    }
}

// ── inspect ─────────────────────────────────────────────────────

pub fn inspect(client: &Client, key: &str) -> Result<(), CliError> {
    let rec = check(client.get(&format!("/v1/admin/idempotency/{key}"))?)?;
    let field = |name: &str| rec.get(name).map(value_text).unwrap_or_else(|| "-".into());

    let status = field("status");
    let badge = match status.as_str() {
        "completed" => status.green().bold(),
        "failed" => status.red().bold(),
        _ => status.yellow().bold(),
    };
    println!("{} {}", "Key:        ".dimmed(), key.cyan());
    println!("{} {}", "Status:     ".dimmed(), badge);
    println!(
        "{} {} {}",
        "Request:    ".dimmed(),
        field("requestMethod"),
        field("requestPath")
    );
    println!("{} {}", "Fingerprint:".dimmed(), field("requestFingerprint").dimmed());
    println!("{} {}", "Response:   ".dimmed(), field("responseStatus"));
    if rec.get("responseTruncated").and_then(|t| t.as_bool()).unwrap_or(false) {
        println!("{}", "  (body not cached)".yellow());
    }
    if let Some(phases) = rec.get("phases").and_then(|p| p.as_array()) {
        let names: Vec<&str> = phases.iter().filter_map(|p| p.as_str()).collect();
        println!("{} {}", "Phases:     ".dimmed(), names.join(" → "));
    }
    println!("{} {}", "Expires:    ".dimmed(), field("expiresAt"));
    Ok(())
}

fn value_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => "-".into(),
        other => other.to_string(),
    }
}

// ── publish ─────────────────────────────────────────────────────

pub fn publish(
    client: &Client,
    topic: &str,
    id: &str,
    event_type: &str,
    data_file: &str,
) -> Result<(), CliError> {
    let data: Value = serde_json::from_str(&read_input(data_file)?)
        .map_err(|e| CliError::Input(format!("parse event data: {e}")))?;
    let event = json!({
        "id": id,
        "type": event_type,
        "source": "wmsx",
        "data": data,
    });
    let resp = check(client.post(&format!("/v1/events/{topic}"), Some(&event), None)?)?;
    match resp.get("status").and_then(|s| s.as_str()) {
        Some("duplicate") => println!("{} {}", id.cyan(), "already consumed, skipped".yellow()),
        _ => println!("{} {}", id.cyan(), "processed".green()),
    }
    Ok(())
}

// ── purge ───────────────────────────────────────────────────────

pub fn purge(client: &Client) -> Result<(), CliError> {
    let resp = check(client.post("/v1/admin/purge", None, None)?)?;
    println!(
        "{} {} keys, {} messages",
        "Purged:".dimmed(),
        resp.get("keys").map(value_text).unwrap_or_default(),
        resp.get("messages").map(value_text).unwrap_or_default()
    );
    Ok(())
}

// ── health ──────────────────────────────────────────────────────

pub fn health(client: &Client) -> Result<(), CliError> {
    let json = check(client.get("/healthz")?)?;
    if json.get("ok").and_then(|o| o.as_bool()).unwrap_or(false) {
        println!("{}", "healthy".green().bold());
        Ok(())
    } else {
        Err(CliError::Transport(format!("unexpected health response: {json}")))
    }
}

// ── fingerprint / key (local) ───────────────────────────────────

pub fn fingerprint(method: &str, path: &str, file: &str) -> Result<(), CliError> {
    let body = read_input(file)?;
    println!("{}", compute_fingerprint(method, path, body.as_bytes()));
    Ok(())
}

pub fn check_key(key: &str, max_len: usize) -> Result<(), CliError> {
    let key = normalize_key(key);
    validate_key(key, max_len).map_err(|e| {
        let code = match e {
            wms_idempotency::KeyError::Required => codes::KEY_REQUIRED,
            _ => codes::KEY_INVALID,
        };
        CliError::Http {
            status: 400,
            code: Some(code.to_string()),
            message: e.to_string(),
        }
    })?;
    println!("{} {}", key.cyan(), "valid".green());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_and_respects_retry_after() {
        let p = RetryPolicy {
            retries: 5,
            backoff: Duration::from_millis(200),
        };
        assert_eq!(p.delay(0, None), Duration::from_millis(200));
        assert_eq!(p.delay(2, None), Duration::from_millis(800));
        assert_eq!(p.delay(0, Some(Duration::from_secs(5))), Duration::from_secs(5));
        assert_eq!(p.delay(40, None), MAX_RETRY_DELAY);
    }

    #[test]
    fn only_contention_and_outage_are_retried() {
        assert!(is_retryable(409, Some(codes::CONCURRENT_REQUEST)));
        assert!(is_retryable(503, Some(codes::STORAGE_UNAVAILABLE)));
        assert!(!is_retryable(422, Some(codes::PARAMETER_MISMATCH)));
        assert!(!is_retryable(400, Some(codes::KEY_INVALID)));
        assert!(!is_retryable(500, Some("internal_error")));
    }

    #[test]
    fn http_error_keeps_body_code() {
        let err = http_error(
            422,
            &json!({"code": "IDEMPOTENCY_PARAMETER_MISMATCH", "message": "different body"}),
        );
        assert_eq!(err.code(), Some("IDEMPOTENCY_PARAMETER_MISMATCH"));
        assert_eq!(
            err.to_string(),
            "HTTP 422 IDEMPOTENCY_PARAMETER_MISMATCH: different body"
        );
    }

    #[test]
    fn check_key_classifies_failures() {
        assert!(check_key("  abc-123 ", 255).is_ok());
        assert_eq!(
            check_key("   ", 255).unwrap_err().code(),
            Some(codes::KEY_REQUIRED)
        );
        assert_eq!(
            check_key("a b", 255).unwrap_err().code(),
            Some(codes::KEY_INVALID)
        );
    }
}

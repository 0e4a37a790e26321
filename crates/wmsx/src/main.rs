use clap::{Parser, Subcommand};
use colored::Colorize;
use std::process;
use std::time::Duration;
use wms_idempotency::middleware::codes;

mod commands;

use commands::CliError;

/// Exit codes. Every idempotency error code gets its own, so scripts can
/// branch without parsing output.
const EXIT_OTHER: i32 = 1;
const EXIT_INPUT: i32 = 2;
const EXIT_KEY_REQUIRED: i32 = 10;
const EXIT_KEY_INVALID: i32 = 11;
const EXIT_CONCURRENT: i32 = 12;
const EXIT_MISMATCH: i32 = 13;
const EXIT_STORAGE: i32 = 14;
const EXIT_BODY_TOO_LARGE: i32 = 15;
const EXIT_UNREACHABLE: i32 = 20;

#[derive(Parser)]
#[command(name = "wmsx", version, about = "WMS CLI: idempotent orders, key inspection, events")]
struct Cli {
    /// Gate server URL (default: http://localhost:3000)
    #[arg(long, env = "WMS_GATE_URL", default_value = "http://localhost:3000")]
    gate: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check gate server health
    Health,
    /// Place an order, retrying 409/503 with the same idempotency key
    Order {
        #[arg(long)]
        sku: String,
        #[arg(long)]
        qty: i64,
        /// Idempotency key (a random UUID when omitted)
        #[arg(long)]
        key: Option<String>,
        /// Retries after a 409 or 503
        #[arg(long, default_value_t = 5)]
        retries: u32,
        /// Base backoff, doubled on every retry
        #[arg(long, default_value_t = 250)]
        backoff_ms: u64,
    },
    /// Show the stored record for an idempotency key
    Inspect {
        key: String,
    },
    /// Push a CloudEvent-shaped message to a topic
    Publish {
        /// Message id; redelivering the same id is a no-op
        id: String,
        #[arg(long = "type", default_value = "wms.inventory.received")]
        event_type: String,
        #[arg(long, default_value = "wms.inventory")]
        topic: String,
        /// Path to event data JSON file (or - for stdin)
        #[arg(default_value = "-")]
        data: String,
    },
    /// Delete expired keys and consumed-message records
    Purge,
    /// Compute a request fingerprint locally
    Fingerprint {
        #[arg(long, default_value = "POST")]
        method: String,
        #[arg(long)]
        path: String,
        /// Path to body file (or - for stdin)
        #[arg(default_value = "-")]
        body: String,
    },
    /// Validate an idempotency key locally
    Key {
        key: String,
        #[arg(long, default_value_t = 255)]
        max_length: usize,
    },
}

fn exit_code_for(err: &CliError) -> i32 {
    match err {
        CliError::Input(_) => EXIT_INPUT,
        CliError::Transport(_) => EXIT_UNREACHABLE,
        CliError::Http { code, .. } => match code.as_deref() {
            Some(codes::KEY_REQUIRED) => EXIT_KEY_REQUIRED,
            Some(codes::KEY_INVALID) => EXIT_KEY_INVALID,
            Some(codes::CONCURRENT_REQUEST) => EXIT_CONCURRENT,
            Some(codes::PARAMETER_MISMATCH) => EXIT_MISMATCH,
            Some(codes::STORAGE_UNAVAILABLE) => EXIT_STORAGE,
            Some(codes::REQUEST_BODY_TOO_LARGE) => EXIT_BODY_TOO_LARGE,
            _ => EXIT_OTHER,
        },
    }
}

fn main() {
    let cli = Cli::parse();
    let client = commands::Client::new(&cli.gate);

    let result = match cli.command {
        Commands::Health => commands::health(&client),
        Commands::Order {
            sku,
            qty,
            key,
            retries,
            backoff_ms,
        } => {
            let policy = commands::RetryPolicy {
                retries,
                backoff: Duration::from_millis(backoff_ms),
            };
            commands::order(&client, &sku, qty, key, &policy)
        }
        Commands::Inspect { key } => commands::inspect(&client, &key),
        Commands::Publish {
            id,
            event_type,
            topic,
            data,
        } => commands::publish(&client, &topic, &id, &event_type, &data),
        Commands::Purge => commands::purge(&client),
        Commands::Fingerprint { method, path, body } => commands::fingerprint(&method, &path, &body),
        Commands::Key { key, max_length } => commands::check_key(&key, max_length),
    };

    if let Err(e) = result {
        eprintln!("{} {}", "error:".red().bold(), e);
        process::exit(exit_code_for(&e));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn http(code: &str) -> CliError {
        CliError::Http {
            status: 400,
            code: Some(code.to_string()),
            message: String::new(),
        }
    }

    #[test]
    fn every_idempotency_code_has_its_own_exit_code() {
        let all = [
            codes::KEY_REQUIRED,
            codes::KEY_INVALID,
            codes::CONCURRENT_REQUEST,
            codes::PARAMETER_MISMATCH,
            codes::STORAGE_UNAVAILABLE,
            codes::REQUEST_BODY_TOO_LARGE,
        ];
        let mut exits: Vec<i32> = all.iter().map(|c| exit_code_for(&http(c))).collect();
        assert!(exits.iter().all(|&e| e != EXIT_OTHER));
        exits.sort_unstable();
        exits.dedup();
        assert_eq!(exits.len(), all.len());
    }

    #[test]
    fn unknown_codes_and_local_errors() {
        assert_eq!(exit_code_for(&http("not_found")), EXIT_OTHER);
        assert_eq!(exit_code_for(&CliError::Input("read x".into())), EXIT_INPUT);
        assert_eq!(exit_code_for(&CliError::Transport("refused".into())), EXIT_UNREACHABLE);
    }

    #[test]
    fn cli_parses_order_flags() {
        let cli = Cli::try_parse_from([
            "wmsx", "--gate", "http://gate:3000", "order", "--sku", "X", "--qty", "2", "--key", "abc-123",
            "--retries", "3",
        ])
        .unwrap();
        assert_eq!(cli.gate, "http://gate:3000");
        match cli.command {
            Commands::Order { sku, qty, key, retries, backoff_ms } => {
                assert_eq!((sku.as_str(), qty, retries, backoff_ms), ("X", 2, 3, 250));
                assert_eq!(key.as_deref(), Some("abc-123"));
            }
            _ => panic!("expected order command"),
        }
    }
}

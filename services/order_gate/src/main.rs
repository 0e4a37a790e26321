use metrics_exporter_prometheus::PrometheusBuilder;
use order_gate::{AppState, SERVICE_NAME};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, Level};
use wms_idempotency::store::{MemoryKeyStore, MemoryMessageStore, SqliteStore};
use wms_idempotency::{
    spawn_purge_task, Clock, IdempotencyConfig, KeyStore, MessageStore, RecorderMetrics,
    SystemClock,
};

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into()),
        )
        .with_target(false)
        .compact()
        .init();

    let metrics_addr: SocketAddr = env_or("METRICS_ADDR", "0.0.0.0:9000").parse()?;
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()?;
    RecorderMetrics::describe();
    info!(%metrics_addr, "prometheus exporter started");

    let (keys, messages): (Arc<dyn KeyStore>, Arc<dyn MessageStore>) =
        match std::env::var("IDEMP_DB") {
            Ok(path) => {
                let db = SqliteStore::open(&path)?;
                info!(%path, "idempotency store: sqlite");
                (Arc::new(db.clone()), Arc::new(db))
            }
            Err(_) => {
                info!("idempotency store: in-memory");
                (Arc::new(MemoryKeyStore::new()), Arc::new(MemoryMessageStore::new()))
            }
        };
    keys.ensure_indexes().await?;
    messages.ensure_indexes().await?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let config = IdempotencyConfig::from_env(SERVICE_NAME);
    info!(
        lock_timeout_secs = config.lock_timeout.as_secs(),
        retention_secs = config.retention_period.as_secs(),
        require_key = config.require_key,
        "idempotency configured"
    );

    let purge_every = std::env::var("IDEMP_PURGE_INTERVAL_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|&s| s > 0)
        .unwrap_or(60);
    spawn_purge_task(
        keys.clone(),
        messages.clone(),
        clock.clone(),
        Duration::from_secs(purge_every),
    );

    let state = AppState::new(config, keys, messages, clock, Arc::new(RecorderMetrics));
    let app = order_gate::app_with(state);
    let listener = TcpListener::bind(env_or("GATE_ADDR", "0.0.0.0:3000")).await?;
    info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}

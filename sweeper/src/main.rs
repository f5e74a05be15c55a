//! TTL Session Sweeper
//!
//! Background process for a Redis session store shared by many web nodes.
//!
//! This binary:
//! - Connects to Redis and enables key-event notifications
//! - Runs the periodic expiration sweep
//! - Turns created / deleted / expired notifications into session events
//!   and logs them
//! - Exposes Prometheus metrics
//!
//! # Usage
//!
//! ```bash
//! REDIS_URL=redis://127.0.0.1:6379 \
//! SESSION_EXPIRATION_INDEX=sorted \
//! METRICS_ADDR=0.0.0.0:9000 \
//! cargo run --bin ttl-session-sweeper
//! ```
//!
//! Repository settings come from the `SESSION_*` variables understood by
//! `RepositoryConfig::from_env`. A `.env` file is honored.

use anyhow::Context;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use ttl_session_core::{BroadcastEventPublisher, SessionEvent};
use ttl_session_redis::{
    BucketedExpirationIndex, ExpirationIndex, IndexedSessionRepository, RedisKeyValueStore,
    RepositoryConfig, SessionTasks, SortedSetExpirationIndex, register_metrics,
};

const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";
const DEFAULT_METRICS_ADDR: &str = "0.0.0.0:9000";
const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,ttl_session_redis=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = RepositoryConfig::from_env().context("Invalid session configuration")?;
    let redis_url = std::env::var("REDIS_URL").unwrap_or_else(|_| DEFAULT_REDIS_URL.to_string());
    let index = std::env::var("SESSION_EXPIRATION_INDEX").unwrap_or_else(|_| "sorted".to_string());
    let metrics_addr: SocketAddr = std::env::var("METRICS_ADDR")
        .unwrap_or_else(|_| DEFAULT_METRICS_ADDR.to_string())
        .parse()
        .context("METRICS_ADDR is not a socket address")?;

    tracing::info!(
        namespace = %config.namespace,
        database = config.database,
        index = %index,
        "Configuration loaded"
    );

    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .context("Failed to install Prometheus exporter")?;
    register_metrics();
    tracing::info!(%metrics_addr, "Prometheus metrics available");

    let store = RedisKeyValueStore::new(&redis_url).await?;
    if let Err(e) = store.configure_keyspace_notifications().await {
        tracing::warn!(
            error = %e,
            "Could not enable keyspace notifications, expecting them to be configured already"
        );
    }

    let publisher = Arc::new(BroadcastEventPublisher::new(EVENT_CHANNEL_CAPACITY));
    tokio::spawn(log_events(publisher.subscribe()));

    match index.as_str() {
        "sorted" => run::<SortedSetExpirationIndex<_>>(store, config, publisher).await,
        "bucketed" => run::<BucketedExpirationIndex<_>>(store, config, publisher).await,
        other => anyhow::bail!(
            "Unknown SESSION_EXPIRATION_INDEX {other:?}, expected \"sorted\" or \"bucketed\""
        ),
    }
}

async fn run<X>(
    store: RedisKeyValueStore,
    config: RepositoryConfig,
    publisher: Arc<BroadcastEventPublisher>,
) -> anyhow::Result<()>
where
    X: ExpirationIndex<RedisKeyValueStore>,
{
    let repository = IndexedSessionRepository::<_, X>::new(store, config)?
        .with_event_publisher(publisher);
    let tasks = SessionTasks::new(Arc::new(repository));
    tasks.start().await?;

    tracing::info!("Session sweeper is running, press Ctrl+C to shutdown");
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down gracefully...");
    tasks.stop().await;
    Ok(())
}

async fn log_events(mut events: broadcast::Receiver<SessionEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => {
                tracing::info!(
                    session_id = %event.session_id(),
                    kind = %event.kind,
                    "Session event"
                );
            }
            Err(RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "Event log fell behind, events skipped");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

mod api;
mod cache;
mod config;
mod engine;
mod error;
mod messenger;
mod provider;
mod router;
mod scheduler;
mod stability;
mod store;
mod types;
mod worker;

use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::api::health::HealthState;
use crate::api::latency::ScanLatency;
use crate::api::routes::{router as api_router, ApiState};
use crate::cache::Cache;
use crate::config::{Config, DB_ACQUIRE_TIMEOUT_SECS};
use crate::error::Result;
use crate::messenger::telegram::TelegramMessenger;
use crate::messenger::Messenger;
use crate::provider::polygon::PolygonProvider;
use crate::provider::ChainProvider;
use crate::router::{CallbackListener, NotificationRouter};
use crate::scheduler::Scheduler;
use crate::stability::StabilityTracker;
use crate::store::{Registry, SignalStore};
use crate::types::Tier;
use crate::worker::ScanWorker;

#[tokio::main]
async fn main() {
    let cfg = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config error: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cfg.log_level))
        .init();

    if let Err(e) = run(cfg).await {
        error!("Fatal error: {e}");
        std::process::exit(1);
    }
}

async fn run(cfg: Config) -> Result<()> {
    // --- Durable store ---
    let pool = PgPoolOptions::new()
        .max_connections(16)
        .acquire_timeout(Duration::from_secs(DB_ACQUIRE_TIMEOUT_SECS))
        .connect(&cfg.database_url)
        .await?;
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("database ready");

    // --- Shared cache ---
    let cache = Cache::connect(&cfg.redis_url).await?;
    cache.ping().await?;
    info!("cache ready");

    let store = SignalStore::new(pool.clone());
    let registry = Registry::new(pool.clone(), cfg.clone());
    let tracker = StabilityTracker::new(cache.clone());
    let provider: Arc<dyn ChainProvider> =
        Arc::new(PolygonProvider::new(cfg.polygon_api_key.clone())?);
    let messenger: Arc<dyn Messenger> =
        Arc::new(TelegramMessenger::new(cfg.telegram_bot_token.clone())?);
    let health = Arc::new(HealthState::new());
    let latency = Arc::new(ScanLatency::new());

    // Flipped once on ctrl-c; every loop finishes its in-flight work and drains.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut handles = Vec::new();

    // --- Tiered scheduler ---
    let scheduler = Scheduler::new(
        cfg.clone(),
        cache.clone(),
        registry.clone(),
        shutdown_rx.clone(),
    );
    handles.push(tokio::spawn(scheduler.run()));

    // --- Scan worker pool ---
    for id in 0..cfg.worker_count {
        let scan_worker = ScanWorker::new(
            id,
            cache.clone(),
            Arc::clone(&provider),
            store.clone(),
            registry.clone(),
            tracker.clone(),
            Arc::clone(&health),
            Arc::clone(&latency),
            shutdown_rx.clone(),
        );
        handles.push(tokio::spawn(scan_worker.run()));
    }

    // --- Notification router + decision callbacks ---
    let notification_router = NotificationRouter::new(
        cache.clone(),
        store.clone(),
        registry.clone(),
        Arc::clone(&messenger),
        Arc::clone(&health),
        shutdown_rx.clone(),
    );
    handles.push(tokio::spawn(notification_router.run()));

    let callbacks = CallbackListener::new(Arc::clone(&messenger), store.clone(), shutdown_rx);
    handles.push(tokio::spawn(callbacks.run()));

    // --- HTTP API ---
    let api_state = ApiState {
        pool: pool.clone(),
        cache: cache.clone(),
        store: store.clone(),
        health: Arc::clone(&health),
        latency: Arc::clone(&latency),
        ready_window_secs: cfg.cadence_secs(Tier::High),
    };
    let app = api_router(api_state);
    let bind_addr = format!("0.0.0.0:{}", cfg.api_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("HTTP API listening on {bind_addr}");

    let shutdown_signal = async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received, draining");
        let _ = shutdown_tx.send(true);
    };
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    for handle in handles {
        let _ = handle.await;
    }
    info!("all components drained");
    Ok(())
}

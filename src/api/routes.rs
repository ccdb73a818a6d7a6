use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::health::HealthState;
use crate::api::latency::ScanLatency;
use crate::cache::Cache;
use crate::error::AppError;
use crate::store::models::DecisionExtras;
use crate::store::{DecisionRow, SignalRow, SignalStore};

#[derive(Clone)]
pub struct ApiState {
    pub pool: sqlx::PgPool,
    pub cache: Cache,
    pub store: SignalStore,
    pub health: Arc<HealthState>,
    pub latency: Arc<ScanLatency>,
    /// Worker READY heartbeats older than this mean the pool is stalled.
    pub ready_window_secs: i64,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/signals/recent", get(get_recent_signals))
        .route("/users/:user_id/history", get(get_user_history))
        .route("/decisions", post(post_decision))
        .route("/stats/latency", get(get_stats_latency))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Query param structs
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct RecentSignalsQuery {
    pub user_id: String,
    pub ticker: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<i64>,
}

#[derive(Deserialize)]
pub struct DecisionBody {
    pub signal_id: Uuid,
    pub user_id: String,
    pub kind: String,
    #[serde(flatten)]
    pub extras: DecisionExtras,
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub cache_ok: bool,
    pub db_ok: bool,
    pub worker_ready: bool,
    pub scans_completed: u64,
    pub scans_aborted: u64,
    pub notifications_sent: u64,
    pub notifications_dropped: u64,
}

#[derive(Serialize)]
pub struct SignalResponse {
    pub id: Uuid,
    pub ticker: String,
    pub as_of_ts: chrono::DateTime<Utc>,
    pub front_expiry: chrono::NaiveDate,
    pub back_expiry: chrono::NaiveDate,
    pub front_dte: i32,
    pub back_dte: i32,
    pub front_iv: f64,
    pub back_iv: f64,
    pub sigma_fwd: f64,
    pub ff_value: f64,
    pub vol_point: String,
    pub quality_score: f64,
    pub reason_codes: Vec<String>,
    pub underlying_price: Option<f64>,
}

impl From<SignalRow> for SignalResponse {
    fn from(row: SignalRow) -> Self {
        Self {
            id: row.id,
            ticker: row.ticker,
            as_of_ts: row.as_of_ts,
            front_expiry: row.front_expiry,
            back_expiry: row.back_expiry,
            front_dte: row.front_dte,
            back_dte: row.back_dte,
            front_iv: row.front_iv,
            back_iv: row.back_iv,
            sigma_fwd: row.sigma_fwd,
            ff_value: row.ff_value,
            vol_point: row.vol_point,
            quality_score: row.quality_score,
            reason_codes: row.reason_codes.0,
            underlying_price: row.underlying_price,
        }
    }
}

#[derive(Serialize)]
pub struct HistoryEntry {
    pub signal: SignalResponse,
    pub decision: Option<DecisionRow>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Healthy iff the cache answers, the DB answers, and at least one worker
/// heartbeated READY within the last high-tier cadence window.
async fn get_health(State(state): State<ApiState>) -> (StatusCode, Json<HealthResponse>) {
    let cache_ok = state.cache.ping().await.is_ok();
    let db_ok = sqlx::query_scalar::<_, i32>("SELECT 1")
        .fetch_one(&state.pool)
        .await
        .is_ok();
    let worker_ready = state
        .health
        .worker_ready_within(state.ready_window_secs, Utc::now().timestamp());

    let healthy = cache_ok && db_ok && worker_ready;
    let response = HealthResponse {
        status: if healthy { "ok" } else { "degraded" },
        cache_ok,
        db_ok,
        worker_ready,
        scans_completed: state.health.scans_completed(),
        scans_aborted: state.health.scans_aborted(),
        notifications_sent: state.health.notifications_sent(),
        notifications_dropped: state.health.notifications_dropped(),
    };
    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(response))
}

async fn get_recent_signals(
    State(state): State<ApiState>,
    Query(params): Query<RecentSignalsQuery>,
) -> Result<Json<Vec<SignalResponse>>, AppError> {
    let limit = params.limit.unwrap_or(50).clamp(1, 500);
    let rows = state
        .store
        .recent_signals(&params.user_id, params.ticker.as_deref(), limit)
        .await?;
    Ok(Json(rows.into_iter().map(SignalResponse::from).collect()))
}

async fn get_user_history(
    State(state): State<ApiState>,
    Path(user_id): Path<String>,
    Query(params): Query<HistoryQuery>,
) -> Result<Json<Vec<HistoryEntry>>, AppError> {
    let limit = params.limit.unwrap_or(20).clamp(1, 200);
    let rows = state.store.history(&user_id, limit).await?;
    Ok(Json(
        rows.into_iter()
            .map(|(signal, decision)| HistoryEntry {
                signal: SignalResponse::from(signal),
                decision,
            })
            .collect(),
    ))
}

async fn post_decision(
    State(state): State<ApiState>,
    Json(body): Json<DecisionBody>,
) -> Result<Json<DecisionRow>, AppError> {
    let decision = state
        .store
        .record_decision_str(body.signal_id, &body.user_id, &body.kind, &body.extras)
        .await?;
    Ok(Json(decision))
}

async fn get_stats_latency(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let (p50, p95, p99) = state.latency.percentiles();
    Json(serde_json::json!({
        "samples": state.latency.samples(),
        "p50_ms": p50,
        "p95_ms": p95,
        "p99_ms": p99,
    }))
}

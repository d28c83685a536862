//! Loopback HTTP surface: ingestion, queries, config and health.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::config::{Config, RuntimeSettings};
use crate::error::MonitorError;
use crate::health::HealthMetrics;
use crate::ingest::{ActiveTabReport, DomainIngest};
use crate::query::{ListParams, Period, QueryEngine, TimelineRequest};
use crate::store::settings::SettingsRepository;
use crate::store::Database;

/// Shared state handed to every handler. This replaces any process-wide
/// daemon global: the supervisor builds one and the router borrows it.
pub struct ServerState {
    pub db: Database,
    pub query: QueryEngine,
    pub ingest: DomainIngest,
    pub health: Arc<HealthMetrics>,
    pub settings: Arc<RuntimeSettings>,
    pub clock: Arc<dyn Clock>,
    pub config_file: PathBuf,
}

/// Error envelope returned to HTTP callers. Validation and not-found
/// errors carry their message; everything else is reduced to a category
/// plus a correlation id, with the detail kept in the server log.
struct ApiError(MonitorError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = self.0;
        let correlation_id = uuid::Uuid::new_v4().to_string();

        let (status, message) = match &err {
            MonitorError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            MonitorError::NotFound { .. } => (StatusCode::NOT_FOUND, err.to_string()),
            MonitorError::TransientIo(detail) => {
                tracing::warn!(correlation_id = %correlation_id, detail = %detail, "transient error on API path");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "temporarily unavailable, retry".to_string(),
                )
            }
            MonitorError::Invariant(detail) => {
                tracing::error!(correlation_id = %correlation_id, detail = %detail, "invariant violation on API path");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
            MonitorError::Fatal(detail) => {
                tracing::error!(correlation_id = %correlation_id, detail = %detail, "fatal error on API path");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };

        let body = json!({
            "error": {
                "category": err.category(),
                "message": message,
                "retryable": err.retryable(),
                "correlationId": correlation_id,
            }
        });

        (status, Json(body)).into_response()
    }
}

impl From<MonitorError> for ApiError {
    fn from(err: MonitorError) -> Self {
        Self(err)
    }
}

pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/api/browser/active-tab", post(active_tab))
        .route("/api/stats/summary", get(stats_summary))
        .route("/api/stats/timeline", get(stats_timeline))
        .route("/api/stats/bandwidth", get(stats_bandwidth))
        .route("/api/applications", get(apps_list))
        .route("/api/applications/{app_id}", get(app_get))
        .route("/api/applications/{app_id}/timeline", get(app_timeline))
        .route("/api/domains", get(domains_list))
        .route("/api/domains/{domain_id}", get(domain_get))
        .route("/api/domains/top/{n}", get(domains_top))
        .route("/api/config", get(config_get))
        .route("/api/config/reload", post(config_reload))
        .with_state(state)
}

/// Binds loopback and serves until the token cancels. Returns the bound
/// address so tests can use an ephemeral port.
pub async fn serve(
    state: Arc<ServerState>,
    port: u16,
    cancel: CancellationToken,
) -> Result<SocketAddr> {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("listening on {addr}"))?;
    let local_addr = listener.local_addr().context("getting local address")?;

    let app = router(state);
    tokio::spawn(async move {
        tracing::info!(addr = %local_addr, "http server started");
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "http server error");
        }
    });

    Ok(local_addr)
}

// --- Handlers ---

async fn healthz(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let status = if state.health.is_degraded() {
        "degraded"
    } else {
        "ok"
    };
    Json(json!({
        "status": status,
        "samplingIntervalSeconds": state.settings.snapshot().daemon.sampling_interval_seconds,
    }))
}

async fn metrics(State(state): State<Arc<ServerState>>) -> Response {
    match state.health.encode() {
        Ok(text) => (StatusCode::OK, text).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "encoding metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "encoding error").into_response()
        }
    }
}

async fn active_tab(
    State(state): State<Arc<ServerState>>,
    Json(report): Json<ActiveTabReport>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let now = state.clock.now_secs();
    match state.ingest.record(&report, now).await {
        Ok(outcome) => {
            state.health.ingest_reports.inc();
            Ok(Json(json!({
                "status": "ok",
                "domainId": outcome.domain_id,
            })))
        }
        Err(err) => {
            if matches!(err, MonitorError::Validation(_)) {
                state.health.ingest_rejected.inc();
            }
            Err(err.into())
        }
    }
}

#[derive(Debug, Deserialize)]
struct SummaryQuery {
    since: Option<i64>,
    until: Option<i64>,
}

async fn stats_summary(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<SummaryQuery>,
) -> Result<Json<crate::query::Summary>, ApiError> {
    let now = state.clock.now_secs();
    let window = query.since.map(|since| (since, query.until));
    Ok(Json(state.query.summary(window, now).await?))
}

#[derive(Debug, Deserialize)]
struct TimelineQuery {
    period: Option<String>,
    since: Option<i64>,
    until: Option<i64>,
    buckets: Option<u32>,
}

impl From<TimelineQuery> for TimelineRequest {
    fn from(q: TimelineQuery) -> Self {
        TimelineRequest {
            period: q.period,
            since: q.since,
            until: q.until,
            buckets: q.buckets,
        }
    }
}

async fn stats_timeline(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<TimelineQuery>,
) -> Result<Json<Vec<crate::store::models::TimelinePoint>>, ApiError> {
    let now = state.clock.now_secs();
    let request = TimelineRequest::from(query);
    Ok(Json(state.query.timeline(&request, now).await?))
}

async fn stats_bandwidth(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<crate::query::Bandwidth>, ApiError> {
    let now = state.clock.now_secs();
    Ok(Json(state.query.bandwidth(now).await?))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    limit: Option<u32>,
    since: Option<i64>,
    sort_by: Option<String>,
    order: Option<String>,
    #[serde(default)]
    parent_only: bool,
}

impl ListQuery {
    fn params(&self) -> ListParams {
        ListParams {
            limit: self.limit,
            since: self.since,
            sort_by: self.sort_by.clone(),
            order: self.order.clone(),
        }
    }
}

async fn apps_list(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let now = state.clock.now_secs();
    let apps = state.query.apps_list(&query.params(), now).await?;
    Ok(Json(json!({ "count": apps.len(), "applications": apps })))
}

async fn app_get(
    State(state): State<Arc<ServerState>>,
    Path(app_id): Path<i64>,
) -> Result<Json<crate::query::AppDetail>, ApiError> {
    Ok(Json(state.query.app_get(app_id).await?))
}

async fn app_timeline(
    State(state): State<Arc<ServerState>>,
    Path(app_id): Path<i64>,
    Query(query): Query<TimelineQuery>,
) -> Result<Json<Vec<crate::store::models::TimelinePoint>>, ApiError> {
    let now = state.clock.now_secs();
    let request = TimelineRequest::from(query);
    Ok(Json(state.query.app_timeline(app_id, &request, now).await?))
}

async fn domains_list(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let now = state.clock.now_secs();
    let domains = state
        .query
        .domains_list(&query.params(), query.parent_only, now)
        .await?;
    Ok(Json(json!({
        "count": domains.len(),
        "parentOnly": query.parent_only,
        "domains": domains,
    })))
}

async fn domain_get(
    State(state): State<Arc<ServerState>>,
    Path(domain_id): Path<i64>,
) -> Result<Json<crate::query::DomainDetail>, ApiError> {
    Ok(Json(state.query.domain_get(domain_id).await?))
}

#[derive(Debug, Deserialize)]
struct TopQuery {
    period: Option<String>,
}

async fn domains_top(
    State(state): State<Arc<ServerState>>,
    Path(n): Path<u32>,
    Query(query): Query<TopQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let now = state.clock.now_secs();
    let period = match query.period.as_deref() {
        None => Period::Day,
        Some(raw) => Period::parse(raw)?,
    };
    let domains = state.query.domains_top(n, period, now).await?;
    Ok(Json(json!({ "count": domains.len(), "topDomains": domains })))
}

async fn config_get(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let values: serde_json::Map<String, serde_json::Value> = state
        .settings
        .snapshot()
        .flat_values()
        .into_iter()
        .map(|(k, v)| (k, serde_json::Value::String(v)))
        .collect();
    Ok(Json(json!({ "config": values })))
}

/// Re-reads the config file and the settings-table overrides, then swaps
/// the merged result into the shared runtime view. TTL changes take
/// effect on the next retention tick.
async fn config_reload(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let current = state.settings.snapshot();
    let mut fresh = Config::load(&state.config_file)
        .map_err(|e| MonitorError::validation(format!("config reload failed: {e}")))?;
    // The data directory cannot move while running.
    fresh.data_dir = current.data_dir;

    let overrides = state
        .db
        .execute(|conn| SettingsRepository::new(conn).all())
        .await
        .map_err(|e| MonitorError::TransientIo(e.to_string()))?;
    fresh.apply_overrides(&overrides);

    state.settings.replace(fresh.clone());
    tracing::info!("configuration reloaded");

    let values: serde_json::Map<String, serde_json::Value> = fresh
        .flat_values()
        .into_iter()
        .map(|(k, v)| (k, serde_json::Value::String(v)))
        .collect();
    Ok(Json(json!({ "status": "ok", "config": values })))
}

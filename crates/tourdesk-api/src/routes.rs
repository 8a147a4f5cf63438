use std::sync::Arc;

use axum::extract::{Query, Request, State};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tourdesk_core::db::{Database, SyncLogRepository};
use tourdesk_core::queue::WriteBackQueue;
use tourdesk_core::sheets::{
    LocalRateLimiter, RateLimitMetricsSnapshot, RateLimiter, SheetsApi, SheetsWriter,
};
use tourdesk_core::sync::{status_report, SyncOrchestrator, SyncStatusReport, SyncSummary};
use tourdesk_core::TaskId;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth::{Authenticator, Caller};
use crate::config::AppConfig;
use crate::error::AppError;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    authenticator: Arc<Authenticator>,
    orchestrator: Arc<SyncOrchestrator>,
    queue: WriteBackQueue,
    logs: SyncLogRepository,
    limiter: Arc<dyn RateLimiter>,
    _db: Arc<Database>,
}

impl AppState {
    pub fn new(config: Arc<AppConfig>, db: Arc<Database>, api: Arc<dyn SheetsApi>) -> Self {
        let settings = config.engine.sync.clone();
        let limiter: Arc<dyn RateLimiter> =
            Arc::new(LocalRateLimiter::per_minute(settings.rate_limit_per_minute));
        let writer = SheetsWriter::new(api, limiter.clone(), &settings);
        let conn = db.connection().clone();
        let orchestrator =
            SyncOrchestrator::new(&conn, writer, config.sheets.target(), settings);

        Self {
            authenticator: Arc::new(Authenticator::from_config(&config)),
            orchestrator: Arc::new(orchestrator),
            queue: WriteBackQueue::new(conn.clone()),
            logs: SyncLogRepository::new(conn),
            limiter,
            _db: db,
            config,
        }
    }
}

pub fn app_router(state: AppState) -> Router {
    let protected_routes = Router::new()
        .route("/trigger", get(trigger_sync).post(trigger_sync))
        .route("/status", get(sync_status))
        .route("/retry-failed", post(retry_failed))
        .route("/cleanup", post(cleanup))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/healthz", get(healthz))
        .nest("/api/sync", protected_routes)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers(Any)
                .allow_methods(Any),
        )
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: i64,
    rate_limit: RateLimitMetricsSnapshot,
}

async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now().timestamp(),
        rate_limit: state.limiter.metrics_snapshot(),
    })
}

async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let caller = state.authenticator.authenticate(request.headers())?;
    request.extensions_mut().insert(caller);
    Ok(next.run(request).await)
}

#[derive(Debug, Serialize)]
struct TriggerResponse {
    success: bool,
    result: SyncSummary,
}

#[derive(Debug, Serialize)]
struct DataResponse<T> {
    success: bool,
    data: T,
}

impl<T> DataResponse<T> {
    const fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data,
        })
    }
}

async fn trigger_sync(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
) -> Result<Json<TriggerResponse>, AppError> {
    caller.require_admin_or_cron()?;

    let result = state.orchestrator.run().await?;
    tracing::info!(
        endpoint = "sync_trigger",
        caller = caller.kind(),
        user = caller.fingerprint(),
        processed = result.processed,
        succeeded = result.succeeded,
        failed = result.failed,
        "Sync run finished"
    );
    Ok(Json(TriggerResponse {
        success: true,
        result,
    }))
}

async fn sync_status(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
) -> Result<Json<DataResponse<SyncStatusReport>>, AppError> {
    let report = status_report(&state.queue, &state.logs, caller.is_admin()).await?;
    Ok(DataResponse::ok(report))
}

#[derive(Debug, Default, Deserialize)]
struct RetryQuery {
    task_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct RetryResult {
    retried: u64,
}

async fn retry_failed(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Query(query): Query<RetryQuery>,
) -> Result<Json<DataResponse<RetryResult>>, AppError> {
    caller.require_admin()?;

    let retried = match query.task_id.as_deref().map(str::trim) {
        Some(raw) if !raw.is_empty() => {
            let id = raw
                .parse::<TaskId>()
                .map_err(|_| AppError::bad_request("task_id must be a UUID"))?;
            if state.queue.get(&id).await?.is_none() {
                return Err(AppError::not_found(format!("sync task {id}")));
            }
            u64::from(state.queue.retry_failed(&id).await?)
        }
        _ => state.queue.retry_all_failed().await?,
    };

    tracing::info!(
        endpoint = "sync_retry_failed",
        user = caller.fingerprint(),
        retried,
        "Requeued failed tasks"
    );
    Ok(DataResponse::ok(RetryResult { retried }))
}

#[derive(Debug, Default, Deserialize)]
struct CleanupQuery {
    retention_days: Option<u32>,
}

#[derive(Debug, Serialize)]
struct CleanupResult {
    deleted: u64,
    retention_days: u32,
}

async fn cleanup(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Query(query): Query<CleanupQuery>,
) -> Result<Json<DataResponse<CleanupResult>>, AppError> {
    caller.require_admin_or_cron()?;

    let retention_days = query
        .retention_days
        .unwrap_or(state.config.engine.sync.retention_days);
    if !(1..=365).contains(&retention_days) {
        return Err(AppError::bad_request("retention_days must be in [1, 365]"));
    }

    let deleted = state.queue.cleanup_completed(retention_days).await?;
    tracing::info!(
        endpoint = "sync_cleanup",
        caller = caller.kind(),
        deleted,
        retention_days,
        "Removed completed tasks"
    );
    Ok(DataResponse::ok(CleanupResult {
        deleted,
        retention_days,
    }))
}

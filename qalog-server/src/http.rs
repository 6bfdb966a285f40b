//! qalog HTTP API
//!
//! Axum server carrying the ingestion hooks, the dashboard status poll and the
//! read/remark/archive endpoints. Runs alongside the Unix socket IPC server on
//! port 8766 (configurable).
//!
//! Each endpoint has a thin axum handler that delegates to an inner function
//! returning `(StatusCode, Value)`, so the behavior is testable without
//! dispatching through the router.
//!
//! Endpoints:
//! - POST /log/frontend     : browser hook (identity from `user_id`)
//! - POST /log/backend      : backend hook (identity from device / peer IP)
//! - GET  /status           : live iteration tail for a program
//! - GET  /programs, /sessions, /iterations, /logs, /errors
//! - GET  /remarks, PUT /remarks, POST /remarks/resolve
//! - POST /archive          : move one year of logs to `qa_logs_{year}`
//! - GET  /health, /version

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::body::Bytes;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{FixedOffset, Utc};
use qalog_core::ipc::Channel;
use qalog_core::models::LogEntry;
use qalog_ingest::{IngestError, IngestOutcome};
use serde::Deserialize;
use serde_json::{json, Value};
use sqlx::PgPool;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use crate::app::AppState;
use crate::subsystems::archive::{self, MAX_ARCHIVE_YEAR, MIN_ARCHIVE_YEAR};
use crate::subsystems::remarks::{self, RemarkResolve, RemarkUpsert};
use crate::subsystems::{query, status};

/// Build the Axum router with all endpoints
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/log/frontend", post(frontend_log_handler))
        .route("/log/backend", post(backend_log_handler))
        .route("/status", get(status_handler))
        .route("/programs", get(programs_handler))
        .route("/sessions", get(sessions_handler))
        .route("/iterations", get(iterations_handler))
        .route("/logs", get(logs_handler))
        .route("/errors", get(errors_handler))
        .route("/remarks", get(list_remarks_handler).put(put_remark_handler))
        .route("/remarks/resolve", post(resolve_remark_handler))
        .route("/archive", post(archive_handler))
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        .with_state(state)
}

/// Start the HTTP server on the configured address.
/// Gracefully shuts down when the broadcast shutdown signal fires.
pub async fn start_http_server(
    state: Arc<AppState>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let addr = format!("{}:{}", state.config.http.host, state.config.http.port);

    let app = build_router(state);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("qalog HTTP API listening on http://{}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = shutdown.recv().await;
        tracing::info!("HTTP server shutting down...");
    })
    .await?;

    Ok(())
}

// ============================================================================
// Request DTOs
// ============================================================================

/// Query string shared by the read endpoints; each endpoint checks the
/// parameters it needs.
#[derive(Debug, Deserialize, Default)]
pub struct ListQuery {
    pub program: Option<String>,
    pub session: Option<String>,
    pub iteration: Option<i32>,
}

#[derive(Debug, Deserialize)]
pub struct ArchiveRequest {
    pub year: i32,
}

fn error_body(msg: impl Into<String>) -> Value {
    json!({
        "error": msg.into(),
        "status": "error",
    })
}

fn required<'a>(value: &'a Option<String>, name: &str) -> std::result::Result<&'a str, (StatusCode, Value)> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err((
            StatusCode::BAD_REQUEST,
            error_body(format!("query parameter '{}' is required", name)),
        )),
    }
}

fn to_json<T: serde::Serialize>(rows: T) -> (StatusCode, Value) {
    match serde_json::to_value(rows) {
        Ok(v) => (StatusCode::OK, v),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, error_body(e.to_string())),
    }
}

fn internal(context: &str, e: impl std::fmt::Display) -> (StatusCode, Value) {
    tracing::error!(error = %e, "{} failed", context);
    (StatusCode::INTERNAL_SERVER_ERROR, error_body(e.to_string()))
}

// ============================================================================
// Inner (directly testable) business logic functions
// ============================================================================

/// Inner ingest. Accepted events, including silently dropped ones, answer
/// 204; the outcome is still returned for logging and tests.
pub async fn ingest_inner(
    state: &AppState,
    channel: Channel,
    body: &[u8],
    peer: Option<String>,
) -> (StatusCode, Value) {
    let payload: Value = match serde_json::from_slice(body) {
        Ok(v) => v,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                error_body(format!("Body is not JSON: {}", e)),
            )
        }
    };

    match state.pipeline.ingest(channel, payload, peer.as_deref()).await {
        Ok(outcome) => {
            if let IngestOutcome::Dropped { reason } = &outcome {
                tracing::debug!(?channel, ?reason, "Event dropped");
            }
            let body = serde_json::to_value(&outcome).unwrap_or(Value::Null);
            (StatusCode::NO_CONTENT, body)
        }
        Err(IngestError::Malformed(msg)) => (StatusCode::BAD_REQUEST, error_body(msg)),
        Err(IngestError::IdentityUnresolved) => (
            StatusCode::FORBIDDEN,
            error_body(IngestError::IdentityUnresolved.to_string()),
        ),
        Err(e @ IngestError::Store(_)) => internal("Ingest", e),
    }
}

pub async fn status_inner(state: &AppState, q: &ListQuery) -> (StatusCode, Value) {
    let program = match required(&q.program, "program") {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    match status::program_status(state.store.as_ref(), program, &state.config.status, Utc::now()).await {
        Ok(s) => to_json(s),
        Err(e) => internal("Status", e),
    }
}

pub async fn programs_inner(pool: &PgPool) -> (StatusCode, Value) {
    match query::list_programs(pool).await {
        Ok(rows) => to_json(rows),
        Err(e) => internal("List programs", e),
    }
}

pub async fn sessions_inner(pool: &PgPool, q: &ListQuery) -> (StatusCode, Value) {
    let program = match required(&q.program, "program") {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    match query::list_sessions(pool, program).await {
        Ok(rows) => to_json(rows),
        Err(e) => internal("List sessions", e),
    }
}

pub async fn iterations_inner(pool: &PgPool, q: &ListQuery) -> (StatusCode, Value) {
    let (program, session) = match (required(&q.program, "program"), required(&q.session, "session")) {
        (Ok(p), Ok(s)) => (p, s),
        (Err(resp), _) | (_, Err(resp)) => return resp,
    };
    match query::list_iterations(pool, program, session).await {
        Ok(rows) => to_json(rows),
        Err(e) => internal("List iterations", e),
    }
}

/// Log rows with bodies decoded back into JSON where they were stored as JSON.
pub fn log_view(entry: &LogEntry) -> Value {
    json!({
        "id": entry.id,
        "user_id": entry.user_id,
        "session_id": entry.session_id,
        "iteration": entry.iteration,
        "type": entry.event_type,
        "endpoint": entry.endpoint,
        "method": entry.method,
        "request": entry.request(),
        "response": entry.response(),
        "status": entry.status,
        "created_at": entry.created_at,
    })
}

pub async fn logs_inner(pool: &PgPool, q: &ListQuery) -> (StatusCode, Value) {
    let (program, session) = match (required(&q.program, "program"), required(&q.session, "session")) {
        (Ok(p), Ok(s)) => (p, s),
        (Err(resp), _) | (_, Err(resp)) => return resp,
    };
    let Some(iteration) = q.iteration else {
        return (
            StatusCode::BAD_REQUEST,
            error_body("query parameter 'iteration' is required"),
        );
    };
    match query::list_logs(pool, program, session, iteration).await {
        Ok(rows) => (
            StatusCode::OK,
            Value::Array(rows.iter().map(log_view).collect()),
        ),
        Err(e) => internal("List logs", e),
    }
}

pub async fn errors_inner(pool: &PgPool, q: &ListQuery) -> (StatusCode, Value) {
    let (program, session) = match (required(&q.program, "program"), required(&q.session, "session")) {
        (Ok(p), Ok(s)) => (p, s),
        (Err(resp), _) | (_, Err(resp)) => return resp,
    };
    match query::grouped_errors(pool, program, session).await {
        Ok(groups) => to_json(groups),
        Err(e) => internal("Group errors", e),
    }
}

pub async fn list_remarks_inner(pool: &PgPool, q: &ListQuery) -> (StatusCode, Value) {
    let program = match required(&q.program, "program") {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    let session = q.session.as_deref().map(str::trim).filter(|s| !s.is_empty());
    match remarks::list_remarks(pool, program, session).await {
        Ok(rows) => to_json(rows),
        Err(e) => internal("List remarks", e),
    }
}

pub async fn put_remark_inner(pool: &PgPool, req: RemarkUpsert) -> (StatusCode, Value) {
    if let Err(msg) = req.validate() {
        return (StatusCode::BAD_REQUEST, error_body(msg));
    }
    match remarks::upsert_remark(pool, &req).await {
        Ok(row) => to_json(row),
        Err(e) => internal("Save remark", e),
    }
}

pub async fn resolve_remark_inner(pool: &PgPool, req: RemarkResolve) -> (StatusCode, Value) {
    if req.resolved_by.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, error_body("resolved_by is required"));
    }
    match remarks::resolve_remark(pool, &req).await {
        Ok(Some(row)) => to_json(row),
        Ok(None) => (StatusCode::NOT_FOUND, error_body("remark not found")),
        Err(e) => internal("Resolve remark", e),
    }
}

pub async fn archive_inner(pool: &PgPool, offset: &FixedOffset, req: ArchiveRequest) -> (StatusCode, Value) {
    if !(MIN_ARCHIVE_YEAR..=MAX_ARCHIVE_YEAR).contains(&req.year) {
        return (
            StatusCode::BAD_REQUEST,
            error_body(format!(
                "year must be between {} and {}",
                MIN_ARCHIVE_YEAR, MAX_ARCHIVE_YEAR
            )),
        );
    }
    match archive::archive_year(pool, req.year, offset).await {
        Ok(report) => to_json(report),
        Err(e) => internal("Archive", e),
    }
}

/// Inner health check: queries DB and returns (status_code, json_body).
pub async fn health_inner(pool: &PgPool, socket_path: &str) -> (StatusCode, Value) {
    match qalog_core::db::health_check(pool).await {
        Ok(pg_ver) => (
            StatusCode::OK,
            json!({
                "status": "healthy",
                "version": env!("CARGO_PKG_VERSION"),
                "postgresql": pg_ver,
                "socket": socket_path,
            }),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            json!({
                "status": "unhealthy",
                "error": e.to_string(),
            }),
        ),
    }
}

/// Inner version: returns version info (pure, no IO).
pub fn version_inner() -> Value {
    json!({
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": "qalog/1",
    })
}

// ============================================================================
// Axum handler wrappers (thin: delegate to inner functions)
// ============================================================================

/// 204 carries no body on the wire.
fn reply(status: StatusCode, body: Value) -> Response {
    if status == StatusCode::NO_CONTENT {
        status.into_response()
    } else {
        (status, Json(body)).into_response()
    }
}

/// Caller address: first `X-Forwarded-For` hop when behind a proxy, else the
/// socket peer.
pub fn client_ip(headers: &HeaderMap, connect: Option<SocketAddr>) -> Option<String> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    match forwarded {
        Some(ip) => Some(ip.to_string()),
        None => connect.map(|addr| addr.ip().to_string()),
    }
}

pub async fn frontend_log_handler(
    State(state): State<Arc<AppState>>,
    connect: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let peer = client_ip(&headers, connect.map(|c| c.0));
    let (status, body) = ingest_inner(&state, Channel::Frontend, &body, peer).await;
    reply(status, body)
}

pub async fn backend_log_handler(
    State(state): State<Arc<AppState>>,
    connect: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let peer = client_ip(&headers, connect.map(|c| c.0));
    let (status, body) = ingest_inner(&state, Channel::Backend, &body, peer).await;
    reply(status, body)
}

pub async fn status_handler(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ListQuery>,
) -> Response {
    let (status, body) = status_inner(&state, &q).await;
    reply(status, body)
}

pub async fn programs_handler(State(state): State<Arc<AppState>>) -> Response {
    let (status, body) = programs_inner(&state.pool).await;
    reply(status, body)
}

pub async fn sessions_handler(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ListQuery>,
) -> Response {
    let (status, body) = sessions_inner(&state.pool, &q).await;
    reply(status, body)
}

pub async fn iterations_handler(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ListQuery>,
) -> Response {
    let (status, body) = iterations_inner(&state.pool, &q).await;
    reply(status, body)
}

pub async fn logs_handler(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ListQuery>,
) -> Response {
    let (status, body) = logs_inner(&state.pool, &q).await;
    reply(status, body)
}

pub async fn errors_handler(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ListQuery>,
) -> Response {
    let (status, body) = errors_inner(&state.pool, &q).await;
    reply(status, body)
}

pub async fn list_remarks_handler(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ListQuery>,
) -> Response {
    let (status, body) = list_remarks_inner(&state.pool, &q).await;
    reply(status, body)
}

pub async fn put_remark_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RemarkUpsert>,
) -> Response {
    let (status, body) = put_remark_inner(&state.pool, req).await;
    reply(status, body)
}

pub async fn resolve_remark_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RemarkResolve>,
) -> Response {
    let (status, body) = resolve_remark_inner(&state.pool, req).await;
    reply(status, body)
}

pub async fn archive_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ArchiveRequest>,
) -> Response {
    let offset = state.pipeline.engine().policy().local_offset;
    let (status, body) = archive_inner(&state.pool, &offset, req).await;
    reply(status, body)
}

pub async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    let (status, body) = health_inner(&state.pool, &state.config.service.socket_path).await;
    reply(status, body)
}

pub async fn version_handler() -> Response {
    reply(StatusCode::OK, version_inner())
}

// ============================================================================
// Unit Tests: call inner functions directly
// ============================================================================

//! Admin HTTP surface.
//!
//! Thin query/command layer over the manager and the interval log, consumed
//! by the operations dashboard: fleet overview, manual health checks,
//! forced status transitions, session list and timeline queries.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::manager::ClientManager;
use crate::state_log::StateLog;
use crate::types::ClientStatus;

/// Shared state for all admin handlers.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<ClientManager>,
    /// Absent when state logging is disabled; timeline endpoints degrade to
    /// empty payloads instead of failing.
    pub state_log: Option<Arc<StateLog>>,
}

/// Build the admin router with tracing and permissive CORS, mirroring the
/// dashboard's needs (it polls from a separate origin).
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/overview", get(get_overview))
        .route("/api/clients/:name/check", post(trigger_check))
        .route("/api/clients/:name/status", post(update_client_status))
        .route("/api/runs", get(get_runs))
        .route("/api/timeline", get(get_timeline))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(
                    CorsLayer::new()
                        .allow_origin(Any)
                        .allow_methods(Any)
                        .allow_headers(Any),
                ),
        )
        .with_state(state)
}

/// Liveness probe for load balancers and uptime monitors.
async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

/// Fleet summary plus per-client detail rows.
async fn get_overview(State(state): State<AppState>) -> Json<Value> {
    Json(state.manager.get_client_stats())
}

/// Fire an asynchronous health check; 202 because the probe includes
/// network I/O and runs in the background.
async fn trigger_check(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<(StatusCode, Json<Value>), StatusCode> {
    if !state.manager.trigger_manual_check(&name) {
        return Err(StatusCode::NOT_FOUND);
    }
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({"message": format!("Health check triggered for {name}")})),
    ))
}

#[derive(Debug, Deserialize)]
struct StatusBody {
    status: String,
}

/// Forced status transition: 404 for unknown clients, 400 for a status
/// string outside the enum.
async fn update_client_status(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<StatusBody>,
) -> Result<Json<Value>, StatusCode> {
    // Strict parse here: the admin API should reject typos instead of
    // folding them into `error` like the lenient FromStr does.
    let status: ClientStatus =
        serde_json::from_value(Value::String(body.status.to_ascii_lowercase()))
            .map_err(|_| StatusCode::BAD_REQUEST)?;

    if !state.manager.set_client_status(&name, status) {
        return Err(StatusCode::NOT_FOUND);
    }
    Ok(Json(json!({"message": format!("Status updated to {status}")})))
}

/// Recent sessions for the timeline selector.
async fn get_runs(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    let Some(log) = &state.state_log else {
        return Ok(Json(json!({"runs": [], "warning": "state log is not enabled"})));
    };
    let runs = log
        .get_run_list(50)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(json!({"runs": runs})))
}

#[derive(Debug, Deserialize)]
struct TimelineQuery {
    run_id: Option<String>,
    from: Option<f64>,
    to: Option<f64>,
    client: Option<String>,
}

/// Clipped state intervals for one run, plus the legend and client list.
async fn get_timeline(
    State(state): State<AppState>,
    Query(query): Query<TimelineQuery>,
) -> Result<Json<Value>, StatusCode> {
    let Some(log) = &state.state_log else {
        return Ok(Json(json!({"items": [], "warning": "state log is not enabled"})));
    };

    let run_id = query
        .run_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .ok_or(StatusCode::BAD_REQUEST)?;
    let from = query.from.unwrap_or(0.0);
    let to = query.to.unwrap_or_else(crate::types::now_ts);
    let client = query.client.as_deref().map(str::trim).filter(|c| !c.is_empty());

    let timeline = log
        .query_timeline(run_id, from, to, client)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(serde_json::to_value(timeline).unwrap_or_default()))
}

//! HTTP trigger surface: run a cycle, run tag reconciliation, health.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Query, State},
    http::{HeaderMap, StatusCode, header::AUTHORIZATION},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::autopilot::{PollCycleDriver, RunMode, auto_enable_tagged};
use crate::provider::ProviderClient;
use crate::store::Database;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub driver: Arc<PollCycleDriver>,
    pub store: Arc<dyn Database>,
    pub provider: Arc<dyn ProviderClient>,
    /// Bearer token required on trigger routes. Open when `None`.
    pub trigger_secret: Option<SecretString>,
    /// Default tag for reconciliation.
    pub auto_enable_tag: Option<String>,
}

/// Build the Axum router with the autopilot routes.
pub fn autopilot_routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/autopilot/cycle", post(run_cycle))
        .route("/api/autopilot/reconcile", post(reconcile))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "autopilot"
    }))
}

// ── Auth ────────────────────────────────────────────────────────────────

fn check_bearer(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    let Some(secret) = &state.trigger_secret else {
        return Ok(());
    };
    let presented = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    if presented == Some(secret.expose_secret()) {
        Ok(())
    } else {
        warn!("Rejected trigger request with missing or wrong bearer token");
        Err((
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({"error": "Invalid or missing bearer token"})),
        )
            .into_response())
    }
}

// ── Cycle ───────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
struct CycleParams {
    #[serde(default)]
    dry_run: bool,
}

async fn run_cycle(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<CycleParams>,
) -> Response {
    if let Err(rejection) = check_bearer(&state, &headers) {
        return rejection;
    }
    let mode = if params.dry_run {
        RunMode::DryRun
    } else {
        RunMode::Live
    };
    info!(dry_run = params.dry_run, "Cycle triggered over HTTP");
    let report = state.driver.run_cycle(mode).await;
    (StatusCode::OK, Json(report)).into_response()
}

// ── Reconcile ───────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
struct ReconcileParams {
    tag: Option<String>,
}

async fn reconcile(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<ReconcileParams>,
) -> Response {
    if let Err(rejection) = check_bearer(&state, &headers) {
        return rejection;
    }
    let Some(tag) = params.tag.or_else(|| state.auto_enable_tag.clone()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "No auto-enable tag configured"})),
        )
            .into_response();
    };

    match auto_enable_tagged(state.store.as_ref(), state.provider.as_ref(), &tag).await {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(e) => {
            warn!(tag, error = %e, "Tag reconciliation failed");
            (
                StatusCode::BAD_GATEWAY,
                Json(serde_json::json!({"error": e.to_string()})),
            )
                .into_response()
        }
    }
}

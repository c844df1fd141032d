//! HTTP surface: submission, completion webhook, read API, admin controls,
//! and the event subscription channel.

pub mod admin;
pub mod submit;
pub mod webhook;
pub mod ws;

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, patch, post},
};
use tower_http::cors::CorsLayer;

use crate::config::ConfigCell;
use crate::errors::StoreError;
use crate::scheduler::AdmissionController;
use crate::store::PhaseStore;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub store: PhaseStore,
    pub admission: Arc<AdmissionController>,
    pub config: ConfigCell,
    pub webhook_secret: String,
    pub admin_token: String,
}

pub type SharedState = Arc<AppState>;

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    BadRequest(String),
    Unauthorized,
    NotFound(String),
    Conflict(String),
    Unavailable(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            // Deliberately generic; auth failures never explain themselves.
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized".to_string()),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::PhaseNotFound { phase_id } => {
                ApiError::NotFound(format!("Phase {} not found", phase_id))
            }
            StoreError::FeatureNotFound { feature_id } => {
                ApiError::NotFound(format!("Feature {} not found", feature_id))
            }
            StoreError::Transient(msg) => ApiError::Unavailable(msg),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/submit", post(submit::submit_feature))
        .route("/phase-complete", post(webhook::phase_complete))
        .route("/events", get(ws::events_handler))
        .route("/phases/{id}", get(get_phase))
        .route("/phases/{id}/cancel", post(cancel_phase))
        .route("/features/{id}", get(get_feature))
        .route("/queue", get(get_queue))
        .route("/admin/pause", post(admin::pause))
        .route("/admin/resume", post(admin::resume))
        .route("/admin/config", patch(admin::update_config))
        .route("/admin/state", get(admin::state))
        .route("/admin/phases/{id}/unblock", post(admin::unblock_phase))
        .route("/health", get(health_check))
}

/// Build the full application router.
pub fn build_router(state: SharedState, dev_mode: bool) -> Router {
    let mut app = api_router().with_state(state);
    if dev_mode {
        app = app.layer(CorsLayer::permissive());
    }
    app
}

// ── Read handlers ─────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn get_phase(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let phase = state.store.get_phase(&id).await?;
    Ok(Json(phase))
}

async fn get_feature(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let feature = state.store.get_feature(id).await?;
    let phases = state.store.list_phases(id).await?;
    Ok(Json(serde_json::json!({
        "feature": feature,
        "phases": phases,
    })))
}

/// Running and ready phases in admission order.
async fn get_queue(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let counts = state.store.queue_counts().await?;
    let active = state.store.active_phases().await?;
    Ok(Json(serde_json::json!({
        "counts": counts,
        "active": active,
    })))
}

/// Advisory: sets the marker workers poll; never terminates a worker.
async fn cancel_phase(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    match state.store.request_cancel(&id).await? {
        Some(phase) => Ok(Json(phase)),
        None => {
            // Distinguish unknown phase from one already terminal.
            match state.store.get_phase_opt(&id).await? {
                Some(phase) => Err(ApiError::Conflict(format!(
                    "Phase {} is {} and cannot be cancelled",
                    id,
                    phase.status.as_str()
                ))),
                None => Err(ApiError::NotFound(format!("Phase {} not found", id))),
            }
        }
    }
}

//! Operator controls.
//!
//! All endpoints require the admin bearer token — a separate credential
//! from the webhook secret. Mutations persist to the coordinator config row
//! first, then update the live cell, so restarts keep operator overrides.

use axum::{
    Json,
    extract::{Path, State},
    http::HeaderMap,
    response::IntoResponse,
};
use serde::Deserialize;

use super::{ApiError, SharedState};

fn require_admin(state: &SharedState, headers: &HeaderMap) -> Result<(), ApiError> {
    let provided = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or_default();
    if provided.is_empty() || provided != state.admin_token {
        return Err(ApiError::Unauthorized);
    }
    Ok(())
}

async fn persist_config(state: &SharedState) -> Result<(), ApiError> {
    state.store.save_config(state.config.get()).await?;
    Ok(())
}

fn announce_status(state: &SharedState) {
    let state = state.clone();
    tokio::spawn(async move {
        if let Ok(counts) = state.store.queue_counts().await {
            let config = state.config.get();
            state
                .store
                .events()
                .system_status(config.paused, config.max_concurrent, counts);
        }
    });
}

/// Pause admission. In-flight workers run to completion; the running count
/// only decreases until resume.
pub async fn pause(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;
    state.config.set_paused(true);
    persist_config(&state).await?;
    tracing::info!("admission paused");
    announce_status(&state);
    Ok(Json(serde_json::json!({"paused": true})))
}

pub async fn resume(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;
    state.config.set_paused(false);
    persist_config(&state).await?;
    tracing::info!("admission resumed");
    announce_status(&state);

    let admission = state.admission.clone();
    tokio::spawn(async move {
        if let Err(e) = admission.run().await {
            tracing::error!(error = %e, "admission after resume failed");
        }
    });
    Ok(Json(serde_json::json!({"paused": false})))
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigPatch {
    pub max_concurrent: Option<i64>,
    pub dedup_window_seconds: Option<i64>,
}

pub async fn update_config(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(patch): Json<ConfigPatch>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;

    if let Some(max) = patch.max_concurrent
        && max < 1
    {
        return Err(ApiError::BadRequest("max_concurrent must be >= 1".into()));
    }
    if let Some(window) = patch.dedup_window_seconds
        && window < 1
    {
        return Err(ApiError::BadRequest(
            "dedup_window_seconds must be >= 1".into(),
        ));
    }

    let previous_cap = state.config.max_concurrent();
    let updated = state
        .config
        .update(patch.max_concurrent, patch.dedup_window_seconds);
    persist_config(&state).await?;
    announce_status(&state);

    // Raising the cap frees admission slots immediately; lowering it never
    // terminates in-flight workers.
    if updated.max_concurrent > previous_cap {
        let admission = state.admission.clone();
        tokio::spawn(async move {
            if let Err(e) = admission.run().await {
                tracing::error!(error = %e, "admission after cap raise failed");
            }
        });
    }

    Ok(Json(updated))
}

pub async fn state(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;
    let config = state.config.get();
    let counts = state.store.queue_counts().await?;
    Ok(Json(serde_json::json!({
        "paused": config.paused,
        "max_concurrent": config.max_concurrent,
        "running_count": counts.running,
        "ready_count": counts.ready,
        "queued_count": counts.queued,
    })))
}

/// Operator intervention: return a blocked phase to the queue so the
/// resolver can re-evaluate it once its failed predecessor is dealt with.
pub async fn unblock_phase(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;
    match state.store.unblock(&id).await? {
        Some(phase) => Ok(Json(phase)),
        None => match state.store.get_phase_opt(&id).await? {
            Some(phase) => Err(ApiError::Conflict(format!(
                "Phase {} is {}, not blocked",
                id,
                phase.status.as_str()
            ))),
            None => Err(ApiError::NotFound(format!("Phase {} not found", id))),
        },
    }
}

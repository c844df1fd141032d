//! Feature submission.
//!
//! Validates the phase graph (cycles, references, priority bounds) before
//! anything touches the store; a rejected submission persists nothing.

use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Deserialize;

use super::{ApiError, SharedState};
use crate::graph::{self, PRIORITY_DEFAULT};
use crate::store::models::NewPhase;

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubmitRequest {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub priority: Option<i64>,
    pub phases: Vec<SubmitPhase>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubmitPhase {
    pub phase_number: i64,
    pub title: String,
    pub prompt: String,
    #[serde(default)]
    pub depends_on: Vec<i64>,
}

pub async fn submit_feature(
    State(state): State<SharedState>,
    Json(req): Json<SubmitRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.title.trim().is_empty() {
        return Err(ApiError::BadRequest("title must not be empty".into()));
    }

    let priority = req.priority.unwrap_or(PRIORITY_DEFAULT);
    let phases: Vec<NewPhase> = req
        .phases
        .into_iter()
        .map(|p| NewPhase {
            phase_number: p.phase_number,
            title: p.title,
            prompt: p.prompt,
            depends_on: p.depends_on,
        })
        .collect();

    graph::validate_submission(&phases, priority)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let (feature, inserted) = state
        .store
        .submit_feature(req.title, req.description, priority, phases)
        .await?;

    // Zero-dependency phases are born ready; let admission consider them
    // without blocking this request.
    let admission = state.admission.clone();
    tokio::spawn(async move {
        if let Err(e) = admission.run().await {
            tracing::error!(error = %e, "admission after submit failed");
        }
    });

    let phase_ids: Vec<&str> = inserted.iter().map(|p| p.phase_id.as_str()).collect();
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({
            "feature_id": feature.feature_id,
            "phase_ids": phase_ids,
        })),
    ))
}

#[cfg(test)]
mod tests {
    use crate::api::test_support::test_router;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn submit_body(phases: serde_json::Value) -> Body {
        Body::from(
            serde_json::json!({
                "title": "Add search",
                "description": "Full text search",
                "phases": phases,
            })
            .to_string(),
        )
    }

    async fn post_submit(body: Body) -> (StatusCode, serde_json::Value) {
        let app = test_router();
        let req = Request::builder()
            .method("POST")
            .uri("/submit")
            .header("content-type", "application/json")
            .body(body)
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn valid_submission_returns_feature_and_phase_ids() {
        let (status, body) = post_submit(submit_body(serde_json::json!([
            {"phase_number": 1, "title": "plan", "prompt": "plan it", "depends_on": []},
            {"phase_number": 2, "title": "build", "prompt": "build it", "depends_on": [1]},
        ])))
        .await;

        assert_eq!(status, StatusCode::CREATED);
        assert!(body["feature_id"].as_i64().unwrap() > 0);
        assert_eq!(body["phase_ids"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn cycle_is_rejected_with_400() {
        let (status, body) = post_submit(submit_body(serde_json::json!([
            {"phase_number": 1, "title": "a", "prompt": "", "depends_on": [2]},
            {"phase_number": 2, "title": "b", "prompt": "", "depends_on": [1]},
        ])))
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("cycle"));
    }

    #[tokio::test]
    async fn unknown_dependency_is_rejected_with_400() {
        let (status, _) = post_submit(submit_body(serde_json::json!([
            {"phase_number": 1, "title": "a", "prompt": "", "depends_on": [99]},
        ])))
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn empty_phase_list_is_rejected() {
        let (status, _) = post_submit(submit_body(serde_json::json!([]))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_fields_are_rejected() {
        let body = Body::from(
            serde_json::json!({
                "title": "x",
                "phases": [{"phase_number": 1, "title": "a", "prompt": ""}],
                "surprise": true,
            })
            .to_string(),
        );
        let (status, _) = post_submit(body).await;
        // Schema violations surface before anything persists.
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn out_of_range_priority_is_rejected() {
        let app = test_router();
        let req = Request::builder()
            .method("POST")
            .uri("/submit")
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::json!({
                    "title": "x",
                    "priority": 5,
                    "phases": [{"phase_number": 1, "title": "a", "prompt": ""}],
                })
                .to_string(),
            ))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}

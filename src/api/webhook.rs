//! Completion ingress.
//!
//! Workers report terminal outcomes here. The pipeline is signature →
//! dedup → terminal transition → emit, giving at-most-once side effects for
//! retried deliveries: a duplicate within the dedup window is absorbed and
//! acknowledged, never re-applied.

use axum::{
    Json,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::{Digest, Sha256};

use super::{ApiError, SharedState};
use crate::store::models::{CompletionIngest, TerminalStatus};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-signature";

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompletionRequest {
    pub phase_id: String,
    pub status: TerminalStatus,
    pub worker_ref: String,
    #[serde(default)]
    pub error: Option<String>,
}

/// Constant-time MAC check over the exact request body.
pub fn verify_signature(secret: &str, body: &[u8], header_value: &str) -> bool {
    let Some(hex_digest) = header_value.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_digest) else {
        return false;
    };
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Sign a body the way workers are expected to.
pub fn sign_body(secret: &str, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Deterministic id for one observed completion: retries of the same
/// delivery hash identically, distinct outcomes do not.
pub fn completion_event_id(phase_id: &str, status: TerminalStatus, worker_ref: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(phase_id.as_bytes());
    hasher.update(b"\n");
    hasher.update(status.as_str().as_bytes());
    hasher.update(b"\n");
    hasher.update(worker_ref.as_bytes());
    hex::encode(hasher.finalize())
}

pub async fn phase_complete(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !verify_signature(&state.webhook_secret, &body, signature) {
        tracing::warn!("rejected completion signal");
        return Err(ApiError::Unauthorized);
    }

    let req: CompletionRequest = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("invalid completion payload: {}", e)))?;

    let event_id = completion_event_id(&req.phase_id, req.status, &req.worker_ref);
    match state
        .store
        .ingest_completion(&event_id, &req.phase_id, req.status, req.error)
        .await?
    {
        CompletionIngest::Duplicate => Ok((
            StatusCode::OK,
            Json(serde_json::json!({"duplicate": true})),
        )),
        CompletionIngest::Applied { phase, .. } => Ok((
            StatusCode::OK,
            Json(serde_json::json!({
                "duplicate": false,
                "phase_id": phase.phase_id,
                "status": phase.status,
                "completed_at": phase.completed_at,
            })),
        )),
        // Not running: the signal is stale or misdirected. Terminal for the
        // caller — do not retry.
        CompletionIngest::Rejected { current } => Err(ApiError::Conflict(format!(
            "Phase {} is {}, not running",
            req.phase_id,
            current.as_str()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::test_support::{TEST_WEBHOOK_SECRET, test_router, test_state};
    use crate::api::build_router;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn completion_body(phase_id: &str, status: &str, worker_ref: &str) -> String {
        serde_json::json!({
            "phase_id": phase_id,
            "status": status,
            "worker_ref": worker_ref,
        })
        .to_string()
    }

    fn signed_request(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/phase-complete")
            .header("content-type", "application/json")
            .header(
                SIGNATURE_HEADER,
                sign_body(TEST_WEBHOOK_SECRET, body.as_bytes()),
            )
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[test]
    fn signature_round_trip_verifies() {
        let body = b"{\"phase_id\":\"p\"}";
        let sig = sign_body("secret", body);
        assert!(verify_signature("secret", body, &sig));
        assert!(!verify_signature("other-secret", body, &sig));
        assert!(!verify_signature("secret", b"tampered", &sig));
    }

    #[test]
    fn malformed_signatures_fail_closed() {
        assert!(!verify_signature("secret", b"x", ""));
        assert!(!verify_signature("secret", b"x", "sha256="));
        assert!(!verify_signature("secret", b"x", "sha256=zz-not-hex"));
        assert!(!verify_signature("secret", b"x", "md5=abcd"));
    }

    #[test]
    fn event_ids_distinguish_outcomes_not_retries() {
        let a = completion_event_id("p-1", TerminalStatus::Completed, "w-1");
        let retry = completion_event_id("p-1", TerminalStatus::Completed, "w-1");
        let failed = completion_event_id("p-1", TerminalStatus::Failed, "w-1");
        let other_worker = completion_event_id("p-1", TerminalStatus::Completed, "w-2");
        assert_eq!(a, retry);
        assert_ne!(a, failed);
        assert_ne!(a, other_worker);
    }

    #[tokio::test]
    async fn unsigned_request_gets_401() {
        let app = test_router();
        let body = completion_body("p-1", "completed", "w-1");
        let req = Request::builder()
            .method("POST")
            .uri("/phase-complete")
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn unknown_phase_gets_404() {
        let app = test_router();
        let body = completion_body("no-such-phase", "completed", "w-1");
        let resp = app.oneshot(signed_request(&body)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn completion_for_non_running_phase_gets_409() {
        let state = test_state();
        let (_, phases) = state
            .store
            .submit_feature(
                "f".into(),
                "".into(),
                50,
                vec![crate::store::models::NewPhase {
                    phase_number: 1,
                    title: "only".into(),
                    prompt: "".into(),
                    depends_on: vec![],
                }],
            )
            .await
            .unwrap();

        // Still ready, never claimed.
        let app = build_router(state, false);
        let body = completion_body(&phases[0].phase_id, "completed", "w-1");
        let resp = app.oneshot(signed_request(&body)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn duplicate_completion_is_absorbed() {
        let state = test_state();
        let (_, phases) = state
            .store
            .submit_feature(
                "f".into(),
                "".into(),
                50,
                vec![crate::store::models::NewPhase {
                    phase_number: 1,
                    title: "only".into(),
                    prompt: "".into(),
                    depends_on: vec![],
                }],
            )
            .await
            .unwrap();
        let phase_id = phases[0].phase_id.clone();
        state.store.try_claim(&phase_id).await.unwrap().unwrap();

        let app = build_router(state.clone(), false);
        let body = completion_body(&phase_id, "completed", "w-1");

        let resp = app.clone().oneshot(signed_request(&body)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let first: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(first["duplicate"], false);
        assert_eq!(first["status"], "completed");

        // Identical retry within the window: acknowledged, not re-applied.
        let resp = app.oneshot(signed_request(&body)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let second: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(second["duplicate"], true);

        let stored = state.store.get_phase(&phase_id).await.unwrap();
        assert_eq!(
            stored.status,
            crate::store::models::PhaseStatus::Completed
        );
    }

    #[tokio::test]
    async fn garbage_payload_with_valid_signature_gets_400() {
        let app = test_router();
        let body = "{\"not\": \"a completion\"}";
        let resp = app.oneshot(signed_request(body)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}

#![allow(dead_code)]

//! Shared harness for integration tests: a full scheduler stack (store,
//! launcher with a recording spawner, admission, coordinator) behind the
//! real router. Workers never actually run; tests play their part by
//! posting signed completion signals.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;

use foreman::api::webhook::{SIGNATURE_HEADER, sign_body};
use foreman::api::{AppState, build_router};
use foreman::config::ConfigCell;
use foreman::coordinator::{Coordinator, CoordinatorOptions};
use foreman::errors::LaunchError;
use foreman::events::EventBus;
use foreman::launcher::WorkerLauncher;
use foreman::launcher::spawner::WorkerSpawner;
use foreman::launcher::tickets::NoopTicketPoster;
use foreman::scheduler::AdmissionController;
use foreman::store::models::{CoordinatorConfig, PhaseStatus};
use foreman::store::{DbHandle, PhaseStore, SchedulerDb};

pub const WEBHOOK_SECRET: &str = "integration-webhook-secret";
pub const ADMIN_TOKEN: &str = "integration-admin-token";

/// Records spawn requests instead of starting processes.
pub struct RecordingSpawner {
    pub spawned: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl WorkerSpawner for RecordingSpawner {
    async fn spawn(&self, phase_id: &str, worker_ref: &str) -> Result<(), LaunchError> {
        self.spawned
            .lock()
            .unwrap()
            .push((phase_id.to_string(), worker_ref.to_string()));
        Ok(())
    }
}

pub struct Harness {
    pub store: PhaseStore,
    pub admission: Arc<AdmissionController>,
    pub config: ConfigCell,
    pub coordinator: Arc<Coordinator>,
    pub app: Router,
    pub spawner: Arc<RecordingSpawner>,
}

impl Harness {
    /// Full leading stack over an in-memory store.
    pub async fn start(max_concurrent: i64) -> Self {
        Self::start_with_db(SchedulerDb::new_in_memory().unwrap(), max_concurrent, 3600).await
    }

    /// Full leading stack over a file-backed store (restart tests).
    pub async fn start_at(path: &Path, max_concurrent: i64, orphan_timeout_seconds: i64) -> Self {
        Self::start_with_db(
            SchedulerDb::new(path).unwrap(),
            max_concurrent,
            orphan_timeout_seconds,
        )
        .await
    }

    async fn start_with_db(
        db: SchedulerDb,
        max_concurrent: i64,
        orphan_timeout_seconds: i64,
    ) -> Self {
        let store = PhaseStore::new(DbHandle::new(db), EventBus::new());
        let config = ConfigCell::new(CoordinatorConfig {
            paused: false,
            max_concurrent,
            dedup_window_seconds: 30,
        });
        let spawner = Arc::new(RecordingSpawner {
            spawned: Mutex::new(Vec::new()),
        });
        let launcher = WorkerLauncher::new(
            store.clone(),
            Arc::new(NoopTicketPoster),
            spawner.clone(),
        );
        let admission = AdmissionController::new(store.clone(), launcher, config.clone());
        let coordinator = Arc::new(Coordinator::new(
            store.clone(),
            admission.clone(),
            config.clone(),
            CoordinatorOptions {
                orphan_timeout_seconds,
                dedup_sweep_interval: Duration::from_secs(3600),
            },
        ));
        coordinator.start(true).await.unwrap();

        let state = Arc::new(AppState {
            store: store.clone(),
            admission: admission.clone(),
            config: config.clone(),
            webhook_secret: WEBHOOK_SECRET.into(),
            admin_token: ADMIN_TOKEN.into(),
        });
        let app = build_router(state, false);

        Self {
            store,
            admission,
            config,
            coordinator,
            app,
            spawner,
        }
    }

    pub async fn stop(&self) {
        self.coordinator.stop().await;
    }

    // ── HTTP helpers ──────────────────────────────────────────────────

    /// POST /submit and return (feature_id, phase_ids in phase_number order).
    pub async fn submit(
        &self,
        title: &str,
        priority: Option<i64>,
        phases: serde_json::Value,
    ) -> (i64, Vec<String>) {
        let mut body = serde_json::json!({
            "title": title,
            "description": "integration feature",
            "phases": phases,
        });
        if let Some(p) = priority {
            body["priority"] = serde_json::json!(p);
        }
        let req = Request::builder()
            .method("POST")
            .uri("/submit")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let resp = self.app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);

        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        let feature_id = value["feature_id"].as_i64().unwrap();
        let phase_ids = value["phase_ids"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap().to_string())
            .collect();
        (feature_id, phase_ids)
    }

    /// POST a signed completion signal the way a worker would.
    pub async fn post_completion(
        &self,
        phase_id: &str,
        status: &str,
        worker_ref: &str,
    ) -> (StatusCode, serde_json::Value) {
        let body = serde_json::json!({
            "phase_id": phase_id,
            "status": status,
            "worker_ref": worker_ref,
        })
        .to_string();
        let req = Request::builder()
            .method("POST")
            .uri("/phase-complete")
            .header("content-type", "application/json")
            .header(SIGNATURE_HEADER, sign_body(WEBHOOK_SECRET, body.as_bytes()))
            .body(Body::from(body))
            .unwrap();
        let resp = self.app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    pub async fn admin(
        &self,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("authorization", format!("Bearer {}", ADMIN_TOKEN));
        let req = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let resp = self.app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    // ── Polling assertions ────────────────────────────────────────────
    //
    // Admission and launch run on background tasks, so observable state is
    // polled with a bounded deadline.

    pub async fn wait_for_status(&self, phase_id: &str, status: PhaseStatus) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let phase = self.store.get_phase(phase_id).await.unwrap();
            if phase.status == status {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "phase {} stuck at {:?}, wanted {:?}",
                phase_id,
                phase.status,
                status
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub async fn wait_for_running_count(&self, expected: i64) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let running = self.store.count_running().await.unwrap();
            if running == expected {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "running count stuck at {}, wanted {}",
                running,
                expected
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Settle window: give background admission a chance to (wrongly) act,
    /// then assert nothing changed.
    pub async fn assert_running_stays(&self, expected: i64) {
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(self.store.count_running().await.unwrap(), expected);
    }
}

//! End-to-end scheduling flows: chains, fan-out under the concurrency cap,
//! diamond joins, and cross-feature priority.

mod common;

use common::Harness;
use foreman::store::models::{FeatureStatus, PhaseStatus};

fn chain_phases() -> serde_json::Value {
    serde_json::json!([
        {"phase_number": 1, "title": "plan", "prompt": "plan it", "depends_on": []},
        {"phase_number": 2, "title": "build", "prompt": "build it", "depends_on": [1]},
        {"phase_number": 3, "title": "test", "prompt": "test it", "depends_on": [2]},
    ])
}

#[tokio::test]
async fn sequential_chain_runs_one_phase_at_a_time() {
    let h = Harness::start(3).await;
    let (feature_id, ids) = h.submit("chain", None, chain_phases()).await;

    // Only the root is admitted; its dependents wait.
    h.wait_for_status(&ids[0], PhaseStatus::Running).await;
    assert_eq!(
        h.store.get_phase(&ids[1]).await.unwrap().status,
        PhaseStatus::Queued
    );
    assert_eq!(
        h.store.get_phase(&ids[2]).await.unwrap().status,
        PhaseStatus::Queued
    );

    h.post_completion(&ids[0], "completed", "w-1").await;
    h.wait_for_status(&ids[1], PhaseStatus::Running).await;
    assert_eq!(
        h.store.get_phase(&ids[2]).await.unwrap().status,
        PhaseStatus::Queued
    );

    h.post_completion(&ids[1], "completed", "w-2").await;
    h.wait_for_status(&ids[2], PhaseStatus::Running).await;

    h.post_completion(&ids[2], "completed", "w-3").await;
    h.wait_for_status(&ids[2], PhaseStatus::Completed).await;

    let feature = h.store.get_feature(feature_id).await.unwrap();
    assert_eq!(feature.status, FeatureStatus::Completed);

    // One admission per phase, no relaunches.
    assert_eq!(h.spawner.spawned.lock().unwrap().len(), 3);
    h.stop().await;
}

#[tokio::test]
async fn fan_out_respects_the_concurrency_cap() {
    let h = Harness::start(3).await;
    let (_, ids) = h
        .submit(
            "fan-out",
            None,
            serde_json::json!([
                {"phase_number": 1, "title": "root", "prompt": "", "depends_on": []},
                {"phase_number": 2, "title": "a", "prompt": "", "depends_on": [1]},
                {"phase_number": 3, "title": "b", "prompt": "", "depends_on": [1]},
                {"phase_number": 4, "title": "c", "prompt": "", "depends_on": [1]},
                {"phase_number": 5, "title": "d", "prompt": "", "depends_on": [1]},
            ]),
        )
        .await;

    h.wait_for_status(&ids[0], PhaseStatus::Running).await;
    h.post_completion(&ids[0], "completed", "w-root").await;

    // Exactly three of the four children run; the fourth stays ready.
    h.wait_for_running_count(3).await;
    h.assert_running_stays(3).await;
    let counts = h.store.queue_counts().await.unwrap();
    assert_eq!(counts.ready, 1);

    // Each completion frees a slot for the waiting peer.
    let running_ids: Vec<String> = {
        let mut out = Vec::new();
        for id in &ids[1..] {
            if h.store.get_phase(id).await.unwrap().status == PhaseStatus::Running {
                out.push(id.clone());
            }
        }
        out
    };
    h.post_completion(&running_ids[0], "completed", "w-a").await;
    h.wait_for_running_count(3).await;

    h.stop().await;
}

#[tokio::test]
async fn diamond_join_waits_for_both_branches() {
    let h = Harness::start(3).await;
    let (feature_id, ids) = h
        .submit(
            "diamond",
            None,
            serde_json::json!([
                {"phase_number": 1, "title": "root", "prompt": "", "depends_on": []},
                {"phase_number": 2, "title": "left", "prompt": "", "depends_on": [1]},
                {"phase_number": 3, "title": "right", "prompt": "", "depends_on": [1]},
                {"phase_number": 4, "title": "join", "prompt": "", "depends_on": [2, 3]},
            ]),
        )
        .await;

    h.wait_for_status(&ids[0], PhaseStatus::Running).await;
    h.post_completion(&ids[0], "completed", "w-1").await;

    // Both branches run in parallel under the cap.
    h.wait_for_status(&ids[1], PhaseStatus::Running).await;
    h.wait_for_status(&ids[2], PhaseStatus::Running).await;
    assert_eq!(
        h.store.get_phase(&ids[3]).await.unwrap().status,
        PhaseStatus::Queued
    );

    h.post_completion(&ids[1], "completed", "w-2").await;
    // Join still waits on the right branch.
    h.assert_running_stays(1).await;
    assert_eq!(
        h.store.get_phase(&ids[3]).await.unwrap().status,
        PhaseStatus::Queued
    );

    h.post_completion(&ids[2], "completed", "w-3").await;
    h.wait_for_status(&ids[3], PhaseStatus::Running).await;

    h.post_completion(&ids[3], "completed", "w-4").await;
    h.wait_for_status(&ids[3], PhaseStatus::Completed).await;
    assert_eq!(
        h.store.get_feature(feature_id).await.unwrap().status,
        FeatureStatus::Completed
    );
    h.stop().await;
}

#[tokio::test]
async fn urgent_feature_preempts_admission_order() {
    let h = Harness::start(1).await;

    // Hold admission while both features queue up.
    let (status, _) = h.admin("POST", "/admin/pause", None).await;
    assert!(status.is_success());

    let (_, older) = h
        .submit(
            "older",
            Some(50),
            serde_json::json!([
                {"phase_number": 1, "title": "only", "prompt": "", "depends_on": []},
            ]),
        )
        .await;
    let (_, urgent) = h
        .submit(
            "urgent",
            Some(10),
            serde_json::json!([
                {"phase_number": 1, "title": "only", "prompt": "", "depends_on": []},
            ]),
        )
        .await;

    let (status, _) = h.admin("POST", "/admin/resume", None).await;
    assert!(status.is_success());

    // Lower priority number wins despite the older queue position.
    h.wait_for_status(&urgent[0], PhaseStatus::Running).await;
    assert_eq!(
        h.store.get_phase(&older[0]).await.unwrap().status,
        PhaseStatus::Ready
    );

    h.post_completion(&urgent[0], "completed", "w-u").await;
    h.wait_for_status(&older[0], PhaseStatus::Running).await;
    h.stop().await;
}

#[tokio::test]
async fn cap_of_one_reduces_to_strict_serial_execution() {
    let h = Harness::start(1).await;
    let (_, ids) = h
        .submit(
            "serial",
            None,
            serde_json::json!([
                {"phase_number": 1, "title": "a", "prompt": "", "depends_on": []},
                {"phase_number": 2, "title": "b", "prompt": "", "depends_on": []},
                {"phase_number": 3, "title": "c", "prompt": "", "depends_on": []},
            ]),
        )
        .await;

    // Independent phases still run one at a time, in queue order.
    h.wait_for_status(&ids[0], PhaseStatus::Running).await;
    h.assert_running_stays(1).await;

    h.post_completion(&ids[0], "completed", "w-1").await;
    h.wait_for_status(&ids[1], PhaseStatus::Running).await;
    h.assert_running_stays(1).await;

    h.post_completion(&ids[1], "completed", "w-2").await;
    h.wait_for_status(&ids[2], PhaseStatus::Running).await;
    h.stop().await;
}

#[tokio::test]
async fn failure_blocks_dependents_and_fails_the_feature() {
    let h = Harness::start(3).await;
    let (feature_id, ids) = h.submit("doomed", None, chain_phases()).await;

    h.wait_for_status(&ids[0], PhaseStatus::Running).await;
    let (status, _) = h.post_completion(&ids[0], "failed", "w-1").await;
    assert!(status.is_success());

    h.wait_for_status(&ids[1], PhaseStatus::Blocked).await;
    h.wait_for_status(&ids[2], PhaseStatus::Blocked).await;
    assert_eq!(
        h.store.get_feature(feature_id).await.unwrap().status,
        FeatureStatus::Failed
    );

    // Operator clears the block; the phase re-enters the queue but stays
    // unresolvable until its predecessor chain is repaired.
    let (status, body) = h
        .admin(
            "POST",
            &format!("/admin/phases/{}/unblock", ids[1]),
            None,
        )
        .await;
    assert!(status.is_success());
    assert_eq!(body["status"], "queued");
    h.stop().await;
}

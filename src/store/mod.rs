//! Durable phase store.
//!
//! [`SchedulerDb`] holds the SQL; [`DbHandle`] moves it onto the blocking
//! pool; [`PhaseStore`] is the facade the rest of the system talks to. Every
//! mutating operation here emits its change notification after the commit
//! returns, so subscribers always observe durable state.

pub mod db;
pub mod handle;
pub mod models;

pub use db::{SchedulerDb, StoreResult};
pub use handle::DbHandle;

use crate::errors::StoreError;
use crate::events::EventBus;
use models::*;

#[derive(Clone)]
pub struct PhaseStore {
    db: DbHandle,
    events: EventBus,
}

impl PhaseStore {
    pub fn new(db: DbHandle, events: EventBus) -> Self {
        Self { db, events }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn db(&self) -> &DbHandle {
        &self.db
    }

    // ── Writes (emit after commit) ────────────────────────────────────

    /// Insert a validated feature and its phases in one transaction, then
    /// announce every inserted phase and the new feature.
    pub async fn submit_feature(
        &self,
        title: String,
        description: String,
        priority: i64,
        phases: Vec<NewPhase>,
    ) -> StoreResult<(Feature, Vec<Phase>)> {
        let (feature, inserted) = self
            .db
            .call(move |db| {
                db.insert_feature_with_phases(&title, &description, priority, &phases)
            })
            .await?;

        for phase in &inserted {
            self.events.phase_changed(phase).await;
        }
        self.events.feature_changed(&feature);
        Ok((feature, inserted))
    }

    /// Atomic `ready → running` claim. Returns the claimed phase, or None
    /// if a racing peer won.
    pub async fn try_claim(&self, phase_id: &str) -> StoreResult<Option<Phase>> {
        let id = phase_id.to_string();
        let claimed = self
            .db
            .call(move |db| {
                if db.try_claim(&id)? {
                    db.get_phase(&id)
                } else {
                    Ok(None)
                }
            })
            .await?;

        if let Some(phase) = &claimed {
            self.events.phase_changed(phase).await;
        }
        Ok(claimed)
    }

    /// Apply a terminal transition; the feature rollup commits in the same
    /// transaction. Rejections carry the phase's current status.
    pub async fn mark_terminal(
        &self,
        phase_id: &str,
        terminal: TerminalStatus,
        error: Option<String>,
    ) -> StoreResult<TerminalOutcome> {
        let id = phase_id.to_string();
        let (outcome, feature) = self
            .db
            .call(move |db| {
                let outcome = db.mark_terminal(&id, terminal, error.as_deref())?;
                let feature = match &outcome {
                    TerminalOutcome::Applied {
                        feature_change: Some((feature_id, _)),
                        ..
                    } => db.get_feature(*feature_id)?,
                    _ => None,
                };
                Ok((outcome, feature))
            })
            .await?;

        if let TerminalOutcome::Applied { phase, .. } = &outcome {
            self.events.phase_changed(phase).await;
        }
        if let Some(feature) = &feature {
            self.events.feature_changed(feature);
        }
        Ok(outcome)
    }

    /// Promote every queued sibling of a completed phase whose predecessors
    /// are now all completed. The conditional transition makes promotion
    /// exactly-once even when two parents finish nearly simultaneously.
    pub async fn promote_newly_ready(
        &self,
        feature_id: i64,
        completed_phase_number: i64,
    ) -> StoreResult<Vec<Phase>> {
        let promoted = self
            .db
            .call(move |db| {
                let candidates = db.find_newly_ready(feature_id, completed_phase_number)?;
                let mut promoted = Vec::new();
                for phase_id in candidates {
                    if db.mark_ready(&phase_id)?
                        && let Some(phase) = db.get_phase(&phase_id)?
                    {
                        promoted.push(phase);
                    }
                }
                Ok(promoted)
            })
            .await?;

        for phase in &promoted {
            self.events.phase_changed(phase).await;
        }
        Ok(promoted)
    }

    /// Block all transitive dependents of a failed phase and fail the
    /// feature, in one transaction.
    pub async fn block_dependents(
        &self,
        feature_id: i64,
        failed_phase_number: i64,
    ) -> StoreResult<Vec<Phase>> {
        let (blocked, feature) = self
            .db
            .call(move |db| {
                let blocked = db.block_dependents(feature_id, failed_phase_number)?;
                let feature = db.get_feature(feature_id)?;
                Ok((blocked, feature))
            })
            .await?;

        for phase in &blocked {
            self.events.phase_changed(phase).await;
        }
        if let Some(feature) = &feature {
            self.events.feature_changed(feature);
        }
        Ok(blocked)
    }

    /// Operator intervention: return a blocked phase to the queue.
    pub async fn unblock(&self, phase_id: &str) -> StoreResult<Option<Phase>> {
        let id = phase_id.to_string();
        let phase = self
            .db
            .call(move |db| {
                if db.unblock(&id)? {
                    db.get_phase(&id)
                } else {
                    Ok(None)
                }
            })
            .await?;
        if let Some(phase) = &phase {
            self.events.phase_changed(phase).await;
        }
        Ok(phase)
    }

    /// Record ticket and worker refs on a running phase (one update). The
    /// status does not change, so only clients are notified.
    pub async fn attach_launch_refs(
        &self,
        phase_id: &str,
        ticket_ref: &str,
        worker_ref: &str,
    ) -> StoreResult<bool> {
        let id = phase_id.to_string();
        let ticket = ticket_ref.to_string();
        let worker = worker_ref.to_string();
        let phase = self
            .db
            .call(move |db| {
                if db.attach_launch_refs(&id, &ticket, &worker)? {
                    db.get_phase(&id)
                } else {
                    Ok(None)
                }
            })
            .await?;
        match phase {
            Some(phase) => {
                self.events.phase_touched(&phase);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn request_cancel(&self, phase_id: &str) -> StoreResult<Option<Phase>> {
        let id = phase_id.to_string();
        let phase = self
            .db
            .call(move |db| {
                if db.request_cancel(&id)? {
                    db.get_phase(&id)
                } else {
                    Ok(None)
                }
            })
            .await?;
        if let Some(phase) = &phase {
            self.events.phase_touched(phase);
        }
        Ok(phase)
    }

    /// Dedup record + terminal transition in one transaction; announces
    /// the transition (and any feature rollup) only when it applied.
    pub async fn ingest_completion(
        &self,
        event_id: &str,
        phase_id: &str,
        terminal: TerminalStatus,
        error: Option<String>,
    ) -> StoreResult<CompletionIngest> {
        let event = event_id.to_string();
        let id = phase_id.to_string();
        let (ingest, feature) = self
            .db
            .call(move |db| {
                let ingest = db.ingest_completion(&event, &id, terminal, error.as_deref())?;
                let feature = match &ingest {
                    CompletionIngest::Applied {
                        feature_change: Some((feature_id, _)),
                        ..
                    } => db.get_feature(*feature_id)?,
                    _ => None,
                };
                Ok((ingest, feature))
            })
            .await?;

        if let CompletionIngest::Applied { phase, .. } = &ingest {
            self.events.phase_changed(phase).await;
        }
        if let Some(feature) = &feature {
            self.events.feature_changed(feature);
        }
        Ok(ingest)
    }

    // ── Dedup ─────────────────────────────────────────────────────────

    pub async fn try_record_completion(&self, event_id: &str) -> StoreResult<bool> {
        let id = event_id.to_string();
        self.db.call(move |db| db.try_record_completion(&id)).await
    }

    pub async fn sweep_completion_events(&self, retention_seconds: i64) -> StoreResult<usize> {
        self.db
            .call(move |db| db.sweep_completion_events(retention_seconds))
            .await
    }

    // ── Reads ─────────────────────────────────────────────────────────

    pub async fn get_phase(&self, phase_id: &str) -> StoreResult<Phase> {
        let id = phase_id.to_string();
        self.db
            .call(move |db| db.get_phase(&id))
            .await?
            .ok_or_else(|| StoreError::PhaseNotFound {
                phase_id: phase_id.to_string(),
            })
    }

    pub async fn get_phase_opt(&self, phase_id: &str) -> StoreResult<Option<Phase>> {
        let id = phase_id.to_string();
        self.db.call(move |db| db.get_phase(&id)).await
    }

    pub async fn get_feature(&self, feature_id: i64) -> StoreResult<Feature> {
        self.db
            .call(move |db| db.get_feature(feature_id))
            .await?
            .ok_or(StoreError::FeatureNotFound { feature_id })
    }

    pub async fn list_phases(&self, feature_id: i64) -> StoreResult<Vec<Phase>> {
        self.db
            .call(move |db| db.list_phases_by_feature(feature_id))
            .await
    }

    pub async fn find_next_ready(&self) -> StoreResult<Option<String>> {
        self.db.call(|db| db.find_next_ready()).await
    }

    pub async fn next_ready(&self, limit: usize) -> StoreResult<Vec<String>> {
        self.db.call(move |db| db.next_ready(limit)).await
    }

    pub async fn count_running(&self) -> StoreResult<i64> {
        self.db.call(|db| db.count_running()).await
    }

    pub async fn queue_counts(&self) -> StoreResult<QueueCounts> {
        self.db.call(|db| db.queue_counts()).await
    }

    pub async fn active_phases(&self) -> StoreResult<Vec<Phase>> {
        self.db.call(|db| db.active_phases()).await
    }

    pub async fn stale_running_phases(&self, older_than_seconds: i64) -> StoreResult<Vec<Phase>> {
        self.db
            .call(move |db| db.stale_running_phases(older_than_seconds))
            .await
    }

    // ── Coordinator config ────────────────────────────────────────────

    pub async fn load_config(&self) -> StoreResult<Option<CoordinatorConfig>> {
        self.db.call(|db| db.load_config()).await
    }

    pub async fn save_config(&self, config: CoordinatorConfig) -> StoreResult<()> {
        self.db.call(move |db| db.save_config(&config)).await
    }
}

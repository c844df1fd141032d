//! Dependency resolution on terminal transitions.
//!
//! Completion promotes queued siblings whose predecessors are all done;
//! failure blocks every transitive dependent and fails the feature. Phases
//! born without dependencies never pass through here — they start `ready`.

use crate::events::PhaseChange;
use crate::store::models::PhaseStatus;
use crate::store::{PhaseStore, StoreResult};

#[derive(Clone)]
pub struct DependencyResolver {
    store: PhaseStore,
}

impl DependencyResolver {
    pub fn new(store: PhaseStore) -> Self {
        Self { store }
    }

    /// React to one change notification. Notifications carry only the id
    /// and status, so the phase is re-read for its graph coordinates.
    pub async fn handle(&self, change: &PhaseChange) -> StoreResult<()> {
        if !change.status.is_terminal() {
            return Ok(());
        }

        let Some(phase) = self.store.get_phase_opt(&change.phase_id).await? else {
            // Deleted under us (feature cascade); nothing to resolve.
            return Ok(());
        };

        match change.status {
            PhaseStatus::Completed => {
                let promoted = self
                    .store
                    .promote_newly_ready(phase.feature_id, phase.phase_number)
                    .await?;
                if !promoted.is_empty() {
                    tracing::debug!(
                        feature_id = phase.feature_id,
                        completed = phase.phase_number,
                        promoted = promoted.len(),
                        "promoted dependents to ready"
                    );
                }
            }
            PhaseStatus::Failed => {
                let blocked = self
                    .store
                    .block_dependents(phase.feature_id, phase.phase_number)
                    .await?;
                tracing::warn!(
                    feature_id = phase.feature_id,
                    failed = phase.phase_number,
                    blocked = blocked.len(),
                    "phase failed, dependents blocked"
                );
            }
            _ => {}
        }
        Ok(())
    }
}

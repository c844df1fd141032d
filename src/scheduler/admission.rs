//! Admission control.
//!
//! One serialized loop decides which ready phases launch now. Selection
//! order is total — priority, then queue position, then feature id — so two
//! runs over the same persisted state admit identically. The conditional
//! claim is the safety net if a second coordinator ever runs by accident:
//! at most one claimant wins per phase.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Mutex;

use crate::config::ConfigCell;
use crate::launcher::WorkerLauncher;
use crate::store::{PhaseStore, StoreResult};

pub struct AdmissionController {
    store: PhaseStore,
    launcher: WorkerLauncher,
    config: ConfigCell,
    /// Serializes the admission loop; invocations from any task queue here.
    gate: Mutex<()>,
    /// Cleared on non-leading (hot spare) instances.
    enabled: AtomicBool,
}

impl AdmissionController {
    pub fn new(store: PhaseStore, launcher: WorkerLauncher, config: ConfigCell) -> Arc<Self> {
        Arc::new(Self {
            store,
            launcher,
            config,
            gate: Mutex::new(()),
            enabled: AtomicBool::new(false),
        })
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Run the admission loop to quiescence. Returns how many phases were
    /// admitted. Safe to call from any task; runs are serialized.
    pub async fn run(&self) -> StoreResult<u32> {
        let _guard = self.gate.lock().await;
        let mut admitted = 0u32;

        loop {
            if !self.is_enabled() || self.config.paused() {
                return Ok(admitted);
            }

            let running = self.store.count_running().await?;
            if running >= self.config.max_concurrent() {
                return Ok(admitted);
            }

            let Some(next) = self.store.find_next_ready().await? else {
                return Ok(admitted);
            };

            match self.store.try_claim(&next).await? {
                Some(phase) => {
                    tracing::info!(
                        phase_id = %phase.phase_id,
                        feature_id = phase.feature_id,
                        phase_number = phase.phase_number,
                        "admitted phase"
                    );
                    self.launcher.launch(phase);
                    admitted += 1;
                }
                // A racing peer won the claim; pick again.
                None => continue,
            }
        }
    }
}

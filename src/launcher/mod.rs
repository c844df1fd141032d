//! Worker launch pipeline for admitted phases.
//!
//! For a phase freshly claimed to `running`: create its external ticket,
//! record the ticket and worker refs in one update, then spawn the detached
//! worker. All of it happens on a launch task behind a bounded pool so the
//! admission loop never blocks on ticket I/O. Any failure transitions the
//! phase `running → failed`, which re-enters the normal event flow and lets
//! the resolver block dependents.

pub mod spawner;
pub mod tickets;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::errors::LaunchError;
use crate::store::PhaseStore;
use crate::store::models::{Phase, TerminalStatus};
use spawner::WorkerSpawner;
use tickets::{TicketPoster, TicketRequest};

/// Bounded retry for ticket creation before the phase is failed.
const TICKET_ATTEMPTS: u32 = 3;
const TICKET_BACKOFF: Duration = Duration::from_millis(500);
/// Concurrent launch tasks (each may block on ticket I/O).
const LAUNCH_POOL_SIZE: usize = 8;

#[derive(Clone)]
pub struct WorkerLauncher {
    store: PhaseStore,
    tickets: Arc<dyn TicketPoster>,
    spawner: Arc<dyn WorkerSpawner>,
    pool: Arc<Semaphore>,
}

impl WorkerLauncher {
    pub fn new(
        store: PhaseStore,
        tickets: Arc<dyn TicketPoster>,
        spawner: Arc<dyn WorkerSpawner>,
    ) -> Self {
        Self {
            store,
            tickets,
            spawner,
            pool: Arc::new(Semaphore::new(LAUNCH_POOL_SIZE)),
        }
    }

    /// Hand an admitted phase to a launch task and return immediately.
    pub fn launch(&self, phase: Phase) {
        let launcher = self.clone();
        tokio::spawn(async move {
            let _permit = launcher
                .pool
                .clone()
                .acquire_owned()
                .await
                .expect("launch pool closed");
            let phase_id = phase.phase_id.clone();
            if let Err(err) = launcher.run_launch(phase).await {
                tracing::warn!(phase_id, error = %err, "launch failed");
                launcher.fail_phase(&phase_id, &err).await;
            }
        });
    }

    async fn run_launch(&self, phase: Phase) -> Result<(), LaunchError> {
        // Idempotent on retry: a phase that already carries a ticket ref
        // reuses it instead of filing a second ticket.
        let ticket_ref = match &phase.external_ticket_ref {
            Some(existing) => existing.clone(),
            None => self.create_ticket_with_retry(&phase).await?,
        };

        let worker_ref = format!("w-{}", Uuid::new_v4().simple());
        let attached = self
            .store
            .attach_launch_refs(&phase.phase_id, &ticket_ref, &worker_ref)
            .await?;
        if !attached {
            // The phase left `running` while we were filing the ticket
            // (e.g. reconciliation failed it). Do not start a worker.
            tracing::warn!(phase_id = %phase.phase_id, "phase no longer running, skipping spawn");
            return Ok(());
        }

        self.spawner.spawn(&phase.phase_id, &worker_ref).await
    }

    async fn create_ticket_with_retry(&self, phase: &Phase) -> Result<String, LaunchError> {
        let total_phases = self
            .store
            .get_feature(phase.feature_id)
            .await
            .map(|f| f.total_phases)
            .unwrap_or(phase.phase_number);
        let request = TicketRequest::for_phase(phase, total_phases);

        let mut last_error = String::new();
        for attempt in 1..=TICKET_ATTEMPTS {
            match self.tickets.create_ticket(&request).await {
                Ok(ticket_ref) => return Ok(ticket_ref),
                Err(err) => {
                    last_error = err.to_string();
                    tracing::warn!(
                        phase_id = %phase.phase_id,
                        attempt,
                        error = %last_error,
                        "ticket creation failed"
                    );
                    if attempt < TICKET_ATTEMPTS {
                        tokio::time::sleep(TICKET_BACKOFF * attempt).await;
                    }
                }
            }
        }
        Err(LaunchError::TicketService {
            attempts: TICKET_ATTEMPTS,
            message: last_error,
        })
    }

    /// `running → failed` with a diagnostic; the emitted change lets the
    /// resolver propagate blocking to dependents.
    async fn fail_phase(&self, phase_id: &str, err: &LaunchError) {
        let reason = match err {
            LaunchError::SpawnFailed(_) => format!("worker_spawn: {}", err),
            LaunchError::TicketService { .. } => format!("ticket_service: {}", err),
            LaunchError::Store(_) => format!("store: {}", err),
        };
        if let Err(store_err) = self
            .store
            .mark_terminal(phase_id, TerminalStatus::Failed, Some(reason))
            .await
        {
            tracing::error!(phase_id, error = %store_err, "failed to record launch failure");
        }
    }
}

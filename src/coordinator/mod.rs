//! Long-running supervisor.
//!
//! Owns the wiring between the change queue, the dependency resolver, and
//! the admission controller; performs startup reconciliation; and enforces
//! the single-writer discipline through an exclusive file lock next to the
//! database. An instance that cannot take the lock serves the read API as a
//! hot spare with admission disabled.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use fs2::FileExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::ConfigCell;
use crate::events::EventBus;
use crate::scheduler::{AdmissionController, DependencyResolver};
use crate::store::models::{PhaseStatus, TerminalOutcome, TerminalStatus};
use crate::store::{PhaseStore, StoreResult};

/// Floor for dedup retention; retaining longer than the window is harmless.
const MIN_SWEEP_RETENTION_SECONDS: i64 = 300;

// ── Leadership ────────────────────────────────────────────────────────

/// Exclusive advisory lock held for the process lifetime. At most one
/// holder performs admission per deployment.
pub struct LeaderLock {
    file: std::fs::File,
    path: PathBuf,
}

impl LeaderLock {
    /// Try to become the leader. `None` means another instance holds the
    /// lock and this process should run as a read-only hot spare.
    pub fn try_acquire(db_path: &Path) -> Result<Option<Self>> {
        let path = db_path.with_extension("leader.lock");
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .with_context(|| format!("Failed to open leader lock at {}", path.display()))?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self { file, path })),
            Err(_) => Ok(None),
        }
    }

    /// Release on shutdown. An error here means leadership state is
    /// uncertain during the shutdown grace period.
    pub fn release(self) -> Result<()> {
        fs2::FileExt::unlock(&self.file)
            .with_context(|| format!("Failed to release leader lock at {}", self.path.display()))
    }
}

// ── Coordinator ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Starting,
    Reconciling,
    Leading,
    HotSpare,
    Stopping,
}

pub struct CoordinatorOptions {
    pub orphan_timeout_seconds: i64,
    pub dedup_sweep_interval: Duration,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            orphan_timeout_seconds: 3600,
            dedup_sweep_interval: Duration::from_secs(300),
        }
    }
}

pub struct Coordinator {
    store: PhaseStore,
    events: EventBus,
    resolver: DependencyResolver,
    admission: Arc<AdmissionController>,
    config: ConfigCell,
    options: CoordinatorOptions,
    state: Mutex<CoordinatorState>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Coordinator {
    pub fn new(
        store: PhaseStore,
        admission: Arc<AdmissionController>,
        config: ConfigCell,
        options: CoordinatorOptions,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let events = store.events().clone();
        let resolver = DependencyResolver::new(store.clone());
        Self {
            store,
            events,
            resolver,
            admission,
            config,
            options,
            state: Mutex::new(CoordinatorState::Starting),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> CoordinatorState {
        *self.state.lock().expect("coordinator state poisoned")
    }

    fn set_state(&self, state: CoordinatorState) {
        *self.state.lock().expect("coordinator state poisoned") = state;
        tracing::info!(state = ?state, "coordinator state");
    }

    /// Start supervision. A leading instance reconciles and begins
    /// admission; a hot spare only watches for shutdown.
    pub async fn start(&self, leading: bool) -> StoreResult<()> {
        if !leading {
            self.admission.set_enabled(false);
            self.set_state(CoordinatorState::HotSpare);
            return Ok(());
        }

        self.spawn_event_loop();
        self.spawn_sweeper();

        self.set_state(CoordinatorState::Reconciling);
        self.reconcile().await?;

        self.admission.set_enabled(true);
        self.admission.run().await?;
        self.set_state(CoordinatorState::Leading);
        Ok(())
    }

    /// Crash recovery: fail orphaned running phases, cascade blocking to
    /// their dependents, sweep stale dedup rows, then re-enter admission.
    /// This is the only place polling-style scanning is permitted.
    async fn reconcile(&self) -> StoreResult<()> {
        let stale = self
            .store
            .stale_running_phases(self.options.orphan_timeout_seconds)
            .await?;
        for phase in stale {
            tracing::warn!(
                phase_id = %phase.phase_id,
                started_at = phase.started_at.as_deref().unwrap_or(""),
                "marking orphaned phase failed"
            );
            let outcome = self
                .store
                .mark_terminal(&phase.phase_id, TerminalStatus::Failed, Some("orphaned".into()))
                .await?;
            if matches!(outcome, TerminalOutcome::Rejected { .. }) {
                // A completion raced reconciliation; the normal flow won.
                tracing::info!(phase_id = %phase.phase_id, "orphan candidate already terminal");
            }
        }

        let retention = self
            .config
            .dedup_window_seconds()
            .max(MIN_SWEEP_RETENTION_SECONDS);
        let swept = self.store.sweep_completion_events(retention).await?;
        if swept > 0 {
            tracing::info!(swept, "swept stale completion events");
        }
        Ok(())
    }

    /// The single consumer of the change queue: each committed transition
    /// drives the resolver, then lets admission fill freed capacity.
    fn spawn_event_loop(&self) {
        let events = self.events.clone();
        let resolver = self.resolver.clone();
        let admission = self.admission.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    change = events.changes().recv() => {
                        if let Err(e) = resolver.handle(&change).await {
                            tracing::error!(
                                phase_id = %change.phase_id,
                                error = %e,
                                "resolver failed"
                            );
                        }
                        // Completions free slots; inserts and promotions add
                        // ready work. Either way admission re-evaluates.
                        if matches!(
                            change.status,
                            PhaseStatus::Ready | PhaseStatus::Completed | PhaseStatus::Failed
                        ) && let Err(e) = admission.run().await
                        {
                            tracing::error!(error = %e, "admission failed");
                        }
                    }
                }
            }
        });
        self.tasks.lock().expect("task list poisoned").push(handle);
    }

    /// Periodic dedup retention sweep; a safety net, not a scheduler.
    fn spawn_sweeper(&self) {
        let store = self.store.clone();
        let config = self.config.clone();
        let interval = self.options.dedup_sweep_interval;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {
                        let retention = config
                            .dedup_window_seconds()
                            .max(MIN_SWEEP_RETENTION_SECONDS);
                        match store.sweep_completion_events(retention).await {
                            Ok(swept) if swept > 0 => {
                                tracing::debug!(swept, "swept completion events");
                            }
                            Ok(_) => {}
                            Err(e) => tracing::warn!(error = %e, "dedup sweep failed"),
                        }
                    }
                }
            }
        });
        self.tasks.lock().expect("task list poisoned").push(handle);
    }

    /// Stop supervision tasks. In-flight workers are not touched.
    pub async fn stop(&self) {
        self.set_state(CoordinatorState::Stopping);
        self.admission.set_enabled(false);
        let _ = self.shutdown_tx.send(true);
        let handles: Vec<_> = self
            .tasks
            .lock()
            .expect("task list poisoned")
            .drain(..)
            .collect();
        for handle in handles {
            let _ = handle.await;
        }
    }
}

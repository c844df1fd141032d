//! Typed error hierarchy for the scheduler.
//!
//! Three top-level enums cover the three subsystems:
//! - `StoreError` — phase store and dedup store failures
//! - `SubmitError` — feature submission validation failures
//! - `LaunchError` — worker launch and ticket-service failures

use thiserror::Error;

/// Errors from the phase store.
///
/// Conditional transitions that lose a race (`try_claim`, `mark_terminal`
/// against a non-running phase) are not errors — those operations return
/// `false` / a rejection value instead.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Phase {phase_id} not found")]
    PhaseNotFound { phase_id: String },

    #[error("Feature {feature_id} not found")]
    FeatureNotFound { feature_id: i64 },

    /// Transient failure (busy/locked connection). Callers retry with
    /// bounded backoff before surfacing.
    #[error("Transient store error: {0}")]
    Transient(String),

    /// Constraint violation or corrupt row — indicates a real bug.
    #[error("Store error: {0}")]
    Terminal(#[source] anyhow::Error),

    #[error("Store lock poisoned")]
    LockPoisoned,
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Errors from validating a feature submission. Nothing is persisted when
/// any of these fire.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("Submission contains no phases")]
    EmptyPhases,

    #[error("Duplicate phase_number {number}")]
    DuplicatePhaseNumber { number: i64 },

    #[error("Phase {phase} depends on unknown phase {dependency}")]
    UnknownDependency { phase: i64, dependency: i64 },

    #[error("Phase {phase} depends on itself")]
    SelfDependency { phase: i64 },

    #[error("Dependency cycle involving phases {members:?}")]
    CycleDetected { members: Vec<i64> },

    #[error("Priority {priority} outside allowed range 10-90")]
    PriorityOutOfRange { priority: i64 },
}

/// Errors from launching a worker for an admitted phase.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("Ticket service error after {attempts} attempts: {message}")]
    TicketService { attempts: u32, message: String },

    #[error("Failed to spawn worker process: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_phase_not_found_carries_id() {
        let err = StoreError::PhaseNotFound {
            phase_id: "abc-123".into(),
        };
        match &err {
            StoreError::PhaseNotFound { phase_id } => assert_eq!(phase_id, "abc-123"),
            _ => panic!("Expected PhaseNotFound"),
        }
        assert!(err.to_string().contains("abc-123"));
    }

    #[test]
    fn store_error_transient_is_flagged() {
        let err = StoreError::Transient("database is locked".into());
        assert!(err.is_transient());
        let err = StoreError::Terminal(anyhow::anyhow!("constraint violated"));
        assert!(!err.is_transient());
    }

    #[test]
    fn submit_error_cycle_carries_members() {
        let err = SubmitError::CycleDetected {
            members: vec![2, 3, 4],
        };
        match &err {
            SubmitError::CycleDetected { members } => assert_eq!(members, &vec![2, 3, 4]),
            _ => panic!("Expected CycleDetected"),
        }
    }

    #[test]
    fn launch_error_converts_from_store_error() {
        let inner = StoreError::PhaseNotFound {
            phase_id: "p".into(),
        };
        let launch: LaunchError = inner.into();
        assert!(matches!(launch, LaunchError::Store(_)));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&StoreError::LockPoisoned);
        assert_std_error(&SubmitError::EmptyPhases);
        assert_std_error(&LaunchError::SpawnFailed(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "worker binary missing",
        )));
    }
}

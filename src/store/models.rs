use serde::{Deserialize, Serialize};

// ── Status enums ──────────────────────────────────────────────────────

/// Lifecycle of a single phase.
///
/// Allowed transitions: `queued → ready`, `queued → blocked`,
/// `ready → running`, `running → completed|failed`, `blocked → queued`
/// (operator intervention only). Everything else is rejected by the store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Queued,
    Ready,
    Running,
    Completed,
    Failed,
    Blocked,
}

impl PhaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "queued" => Ok(Self::Queued),
            "ready" => Ok(Self::Ready),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "blocked" => Ok(Self::Blocked),
            _ => Err(format!("Invalid phase status: {}", s)),
        }
    }

    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Lifecycle of a feature (a user-submitted bundle of phases).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FeatureStatus {
    Planning,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl FeatureStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "planning" => Ok(Self::Planning),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid feature status: {}", s)),
        }
    }
}

/// Terminal outcome a worker reports for a phase.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TerminalStatus {
    Completed,
    Failed,
}

impl TerminalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn as_phase_status(&self) -> PhaseStatus {
        match self {
            Self::Completed => PhaseStatus::Completed,
            Self::Failed => PhaseStatus::Failed,
        }
    }
}

// ── Entities ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feature {
    pub feature_id: i64,
    pub title: String,
    pub description: String,
    pub total_phases: i64,
    pub status: FeatureStatus,
    pub created_at: String,
    pub updated_at: String,
}

/// The scheduler's smallest addressable entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Phase {
    pub phase_id: String,
    pub feature_id: i64,
    pub phase_number: i64,
    pub title: String,
    /// Opaque payload handed to the worker; the scheduler never interprets it.
    pub prompt: String,
    /// Sibling phase_numbers this phase waits on. Empty means born ready.
    pub depends_on: Vec<i64>,
    pub status: PhaseStatus,
    /// 10-90, lower is more urgent. Default 50.
    pub priority: i64,
    /// Globally monotonic insert order; FIFO tiebreaker within a priority.
    pub queue_position: i64,
    pub external_ticket_ref: Option<String>,
    pub worker_ref: Option<String>,
    pub error_message: Option<String>,
    pub cancel_requested: bool,
    pub created_at: String,
    pub updated_at: String,
    pub ready_at: Option<String>,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

/// Input for one phase of a submission, before IDs exist.
#[derive(Debug, Clone, Deserialize)]
pub struct NewPhase {
    pub phase_number: i64,
    pub title: String,
    pub prompt: String,
    #[serde(default)]
    pub depends_on: Vec<i64>,
}

/// Process-wide coordinator state persisted in the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CoordinatorConfig {
    pub paused: bool,
    pub max_concurrent: i64,
    pub dedup_window_seconds: i64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            paused: false,
            max_concurrent: 3,
            dedup_window_seconds: 30,
        }
    }
}

/// Counts surfaced by `/admin/state` and the system_status event.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct QueueCounts {
    pub running: i64,
    pub ready: i64,
    pub queued: i64,
}

/// Outcome of ingesting an externally-observed completion event.
#[derive(Debug, Clone)]
pub enum CompletionIngest {
    /// Same event_id already recorded within the dedup window.
    Duplicate,
    Applied {
        phase: Phase,
        feature_change: Option<(i64, FeatureStatus)>,
    },
    Rejected { current: PhaseStatus },
}

/// Outcome of a conditional `running → completed|failed` transition.
#[derive(Debug, Clone)]
pub enum TerminalOutcome {
    /// The transition committed. Carries the new feature status when the
    /// completion also rolled the owning feature over.
    Applied {
        phase: Phase,
        feature_change: Option<(i64, FeatureStatus)>,
    },
    /// The phase was not `running`; nothing changed.
    Rejected { current: PhaseStatus },
}

// ── Tests ─────────────────────────────────────────────────────────────

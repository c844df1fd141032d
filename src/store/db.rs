use std::collections::{HashMap, HashSet};
use std::path::Path;

use anyhow::anyhow;
use rusqlite::{Connection, ErrorCode, params};
use uuid::Uuid;

use super::models::*;
use crate::errors::StoreError;

pub type StoreResult<T> = Result<T, StoreError>;

fn map_sqlite_err(e: rusqlite::Error) -> StoreError {
    if let rusqlite::Error::SqliteFailure(code, msg) = &e
        && matches!(
            code.code,
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
        )
    {
        return StoreError::Transient(msg.clone().unwrap_or_else(|| "database busy".into()));
    }
    StoreError::Terminal(anyhow!(e))
}

trait SqlExt<T> {
    fn store_err(self) -> StoreResult<T>;
}

impl<T> SqlExt<T> for Result<T, rusqlite::Error> {
    fn store_err(self) -> StoreResult<T> {
        self.map_err(map_sqlite_err)
    }
}

/// Durable record of every feature and phase, plus the dedup table and the
/// persisted coordinator configuration. Single connection; all async access
/// goes through [`super::handle::DbHandle`].
pub struct SchedulerDb {
    conn: Connection,
}

impl SchedulerDb {
    /// Open (or create) the SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(path).store_err()?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory database (for testing).
    pub fn new_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory().store_err()?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> StoreResult<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .store_err()?;
        self.run_migrations()
    }

    fn run_migrations(&self) -> StoreResult<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS features (
                    feature_id INTEGER PRIMARY KEY AUTOINCREMENT,
                    title TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    total_phases INTEGER NOT NULL,
                    status TEXT NOT NULL DEFAULT 'in_progress',
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS phases (
                    phase_id TEXT PRIMARY KEY,
                    feature_id INTEGER NOT NULL REFERENCES features(feature_id) ON DELETE CASCADE,
                    phase_number INTEGER NOT NULL,
                    title TEXT NOT NULL,
                    prompt TEXT NOT NULL DEFAULT '',
                    depends_on TEXT NOT NULL DEFAULT '[]',
                    status TEXT NOT NULL DEFAULT 'queued',
                    priority INTEGER NOT NULL DEFAULT 50,
                    queue_position INTEGER NOT NULL,
                    external_ticket_ref TEXT,
                    worker_ref TEXT,
                    error_message TEXT,
                    cancel_requested INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                    ready_at TEXT,
                    started_at TEXT,
                    completed_at TEXT,
                    UNIQUE(feature_id, phase_number)
                );

                CREATE TABLE IF NOT EXISTS completion_events (
                    event_id TEXT PRIMARY KEY,
                    received_at TEXT NOT NULL DEFAULT (datetime('now')),
                    accepted INTEGER NOT NULL DEFAULT 1
                );

                CREATE TABLE IF NOT EXISTS coordinator_config (
                    id INTEGER PRIMARY KEY CHECK (id = 1),
                    paused INTEGER NOT NULL DEFAULT 0,
                    max_concurrent INTEGER NOT NULL DEFAULT 3,
                    dedup_window_seconds INTEGER NOT NULL DEFAULT 30
                );

                CREATE INDEX IF NOT EXISTS idx_phases_admission
                    ON phases(status, priority, queue_position);
                CREATE INDEX IF NOT EXISTS idx_phases_feature
                    ON phases(feature_id, phase_number);
                CREATE INDEX IF NOT EXISTS idx_phases_ticket
                    ON phases(external_ticket_ref);
                CREATE INDEX IF NOT EXISTS idx_completion_events_received
                    ON completion_events(received_at);
                ",
            )
            .store_err()
    }

    // ── Feature + phase insertion ─────────────────────────────────────

    /// Insert a feature and all of its phases in one transaction.
    ///
    /// Each phase gets a generated `phase_id`, a `queue_position` strictly
    /// greater than any existing one, and status `ready` iff `depends_on`
    /// is empty (stamping `ready_at`), else `queued`. The phase graph must
    /// already be validated (see `crate::graph`).
    pub fn insert_feature_with_phases(
        &mut self,
        title: &str,
        description: &str,
        priority: i64,
        phases: &[NewPhase],
    ) -> StoreResult<(Feature, Vec<Phase>)> {
        let tx = self.conn.transaction().store_err()?;

        tx.execute(
            "INSERT INTO features (title, description, total_phases) VALUES (?1, ?2, ?3)",
            params![title, description, phases.len() as i64],
        )
        .store_err()?;
        let feature_id = tx.last_insert_rowid();

        let mut next_position: i64 = tx
            .query_row(
                "SELECT COALESCE(MAX(queue_position), 0) FROM phases",
                [],
                |row| row.get(0),
            )
            .store_err()?;

        let mut ordered: Vec<&NewPhase> = phases.iter().collect();
        ordered.sort_by_key(|p| p.phase_number);

        for new_phase in ordered {
            next_position += 1;
            let phase_id = Uuid::new_v4().to_string();
            let depends_on = serde_json::to_string(&new_phase.depends_on)
                .map_err(|e| StoreError::Terminal(anyhow!(e)))?;
            let born_ready = new_phase.depends_on.is_empty();
            let status = if born_ready { "ready" } else { "queued" };
            tx.execute(
                "INSERT INTO phases
                    (phase_id, feature_id, phase_number, title, prompt, depends_on,
                     status, priority, queue_position, ready_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9,
                         CASE WHEN ?10 THEN datetime('now') ELSE NULL END)",
                params![
                    phase_id,
                    feature_id,
                    new_phase.phase_number,
                    new_phase.title,
                    new_phase.prompt,
                    depends_on,
                    status,
                    priority,
                    next_position,
                    born_ready,
                ],
            )
            .store_err()?;
        }

        let feature = read_feature(&tx, feature_id)?.ok_or(StoreError::FeatureNotFound {
            feature_id,
        })?;
        let inserted = read_phases_by_feature(&tx, feature_id)?;

        tx.commit().store_err()?;
        Ok((feature, inserted))
    }

    // ── Reads ─────────────────────────────────────────────────────────

    pub fn get_phase(&self, phase_id: &str) -> StoreResult<Option<Phase>> {
        read_phase(&self.conn, phase_id)
    }

    pub fn get_feature(&self, feature_id: i64) -> StoreResult<Option<Feature>> {
        read_feature(&self.conn, feature_id)
    }

    pub fn list_phases_by_feature(&self, feature_id: i64) -> StoreResult<Vec<Phase>> {
        read_phases_by_feature(&self.conn, feature_id)
    }

    pub fn count_running(&self) -> StoreResult<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM phases WHERE status = 'running'",
                [],
                |row| row.get(0),
            )
            .store_err()
    }

    pub fn queue_counts(&self) -> StoreResult<QueueCounts> {
        self.conn
            .query_row(
                "SELECT
                    COUNT(*) FILTER (WHERE status = 'running'),
                    COUNT(*) FILTER (WHERE status = 'ready'),
                    COUNT(*) FILTER (WHERE status = 'queued')
                 FROM phases",
                [],
                |row| {
                    Ok(QueueCounts {
                        running: row.get(0)?,
                        ready: row.get(1)?,
                        queued: row.get(2)?,
                    })
                },
            )
            .store_err()
    }

    /// The admission total order: priority ASC, queue_position ASC,
    /// feature_id ASC. Pure read; identical persisted state yields an
    /// identical ordering.
    pub fn next_ready(&self, limit: usize) -> StoreResult<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT phase_id FROM phases
                 WHERE status = 'ready' AND external_ticket_ref IS NULL
                 ORDER BY priority ASC, queue_position ASC, feature_id ASC
                 LIMIT ?1",
            )
            .store_err()?;
        let rows = stmt
            .query_map(params![limit as i64], |row| row.get::<_, String>(0))
            .store_err()?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row.store_err()?);
        }
        Ok(ids)
    }

    pub fn find_next_ready(&self) -> StoreResult<Option<String>> {
        Ok(self.next_ready(1)?.into_iter().next())
    }

    /// Running and ready phases in admission order, for client snapshots.
    pub fn active_phases(&self) -> StoreResult<Vec<Phase>> {
        let sql = format!(
            "SELECT {} FROM phases WHERE status IN ('running', 'ready')
             ORDER BY priority ASC, queue_position ASC, feature_id ASC",
            PHASE_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql).store_err()?;
        let rows = stmt.query_map([], PhaseRow::from_row).store_err()?;
        let mut phases = Vec::new();
        for row in rows {
            phases.push(row.store_err()?.into_phase()?);
        }
        Ok(phases)
    }

    /// Queued siblings of a just-completed phase whose every declared
    /// predecessor is now `completed`.
    pub fn find_newly_ready(
        &self,
        feature_id: i64,
        completed_phase_number: i64,
    ) -> StoreResult<Vec<String>> {
        let siblings = read_phases_by_feature(&self.conn, feature_id)?;
        let completed: HashSet<i64> = siblings
            .iter()
            .filter(|p| p.status == PhaseStatus::Completed)
            .map(|p| p.phase_number)
            .collect();

        Ok(siblings
            .iter()
            .filter(|p| {
                p.status == PhaseStatus::Queued
                    && p.depends_on.contains(&completed_phase_number)
                    && p.depends_on.iter().all(|dep| completed.contains(dep))
            })
            .map(|p| p.phase_id.clone())
            .collect())
    }

    /// Phases still `running` whose `started_at` is older than the given
    /// horizon. Used only by startup reconciliation.
    pub fn stale_running_phases(&self, older_than_seconds: i64) -> StoreResult<Vec<Phase>> {
        let modifier = format!("-{} seconds", older_than_seconds);
        let mut stmt = self
            .conn
            .prepare(
                "SELECT phase_id FROM phases
                 WHERE status = 'running' AND started_at < datetime('now', ?1)
                 ORDER BY started_at ASC",
            )
            .store_err()?;
        let rows = stmt
            .query_map(params![modifier], |row| row.get::<_, String>(0))
            .store_err()?;
        let mut phases = Vec::new();
        for row in rows {
            let id: String = row.store_err()?;
            if let Some(phase) = read_phase(&self.conn, &id)? {
                phases.push(phase);
            }
        }
        Ok(phases)
    }

    // ── Transitions ───────────────────────────────────────────────────

    /// Atomic claim: `ready → running`. Returns true iff exactly one row
    /// was updated. This is the sole mechanism keeping one worker per phase.
    pub fn try_claim(&self, phase_id: &str) -> StoreResult<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE phases
                 SET status = 'running', started_at = datetime('now'),
                     updated_at = datetime('now')
                 WHERE phase_id = ?1 AND status = 'ready'",
                params![phase_id],
            )
            .store_err()?;
        Ok(changed == 1)
    }

    /// Conditional `queued → ready`, stamping `ready_at`. Returns true iff
    /// the transition applied; a second caller observes false.
    pub fn mark_ready(&self, phase_id: &str) -> StoreResult<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE phases
                 SET status = 'ready', ready_at = datetime('now'),
                     updated_at = datetime('now')
                 WHERE phase_id = ?1 AND status = 'queued'",
                params![phase_id],
            )
            .store_err()?;
        Ok(changed == 1)
    }

    /// Operator intervention: `blocked → queued` so a repaired predecessor
    /// chain can be re-resolved.
    pub fn unblock(&self, phase_id: &str) -> StoreResult<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE phases
                 SET status = 'queued', updated_at = datetime('now')
                 WHERE phase_id = ?1 AND status = 'blocked'",
                params![phase_id],
            )
            .store_err()?;
        Ok(changed == 1)
    }

    /// `running → completed|failed` plus the feature rollup, in one
    /// transaction. Rejects any other source status without side effects.
    pub fn mark_terminal(
        &mut self,
        phase_id: &str,
        terminal: TerminalStatus,
        error: Option<&str>,
    ) -> StoreResult<TerminalOutcome> {
        let tx = self.conn.transaction().store_err()?;
        let outcome = apply_terminal(&tx, phase_id, terminal, error)?;
        tx.commit().store_err()?;
        Ok(outcome)
    }

    /// Externally-observed completion: dedup record and terminal transition
    /// in one transaction, so a crash between them cannot strand a retried
    /// delivery behind its own dedup row.
    pub fn ingest_completion(
        &mut self,
        event_id: &str,
        phase_id: &str,
        terminal: TerminalStatus,
        error: Option<&str>,
    ) -> StoreResult<CompletionIngest> {
        let tx = self.conn.transaction().store_err()?;

        let newly_recorded = tx
            .execute(
                "INSERT OR IGNORE INTO completion_events (event_id) VALUES (?1)",
                params![event_id],
            )
            .store_err()?
            == 1;
        if !newly_recorded {
            tx.commit().store_err()?;
            return Ok(CompletionIngest::Duplicate);
        }

        let outcome = apply_terminal(&tx, phase_id, terminal, error)?;
        let accepted = matches!(outcome, TerminalOutcome::Applied { .. });
        tx.execute(
            "UPDATE completion_events SET accepted = ?1 WHERE event_id = ?2",
            params![accepted, event_id],
        )
        .store_err()?;

        tx.commit().store_err()?;
        Ok(match outcome {
            TerminalOutcome::Applied {
                phase,
                feature_change,
            } => CompletionIngest::Applied {
                phase,
                feature_change,
            },
            TerminalOutcome::Rejected { current } => CompletionIngest::Rejected { current },
        })
    }

    /// Block every transitive dependent of a failed phase (depth-first over
    /// the reverse dependency edges) and mark the feature failed, in one
    /// transaction. Returns the phases that moved to `blocked`.
    pub fn block_dependents(
        &mut self,
        feature_id: i64,
        failed_phase_number: i64,
    ) -> StoreResult<Vec<Phase>> {
        let tx = self.conn.transaction().store_err()?;

        let siblings = read_phases_by_feature(&tx, feature_id)?;
        let mut reverse: HashMap<i64, Vec<&Phase>> = HashMap::new();
        for phase in &siblings {
            for dep in &phase.depends_on {
                reverse.entry(*dep).or_default().push(phase);
            }
        }

        let mut stack = vec![failed_phase_number];
        let mut visited = HashSet::new();
        let mut blocked_ids = Vec::new();
        while let Some(number) = stack.pop() {
            if !visited.insert(number) {
                continue;
            }
            for dependent in reverse.get(&number).into_iter().flatten() {
                if matches!(dependent.status, PhaseStatus::Queued | PhaseStatus::Ready) {
                    blocked_ids.push(dependent.phase_id.clone());
                }
                stack.push(dependent.phase_number);
            }
        }

        for phase_id in &blocked_ids {
            tx.execute(
                "UPDATE phases
                 SET status = 'blocked', updated_at = datetime('now')
                 WHERE phase_id = ?1 AND status IN ('queued', 'ready')",
                params![phase_id],
            )
            .store_err()?;
        }

        tx.execute(
            "UPDATE features
             SET status = 'failed', updated_at = datetime('now')
             WHERE feature_id = ?1 AND status NOT IN ('failed', 'cancelled')",
            params![feature_id],
        )
        .store_err()?;

        let mut blocked = Vec::with_capacity(blocked_ids.len());
        for phase_id in &blocked_ids {
            if let Some(phase) = read_phase(&tx, phase_id)? {
                blocked.push(phase);
            }
        }

        tx.commit().store_err()?;
        Ok(blocked)
    }

    /// Record the launch artifacts on a running phase in one update, so a
    /// `running` phase either has both refs or (briefly) neither.
    pub fn attach_launch_refs(
        &self,
        phase_id: &str,
        ticket_ref: &str,
        worker_ref: &str,
    ) -> StoreResult<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE phases
                 SET external_ticket_ref = ?1, worker_ref = ?2,
                     updated_at = datetime('now')
                 WHERE phase_id = ?3 AND status = 'running'",
                params![ticket_ref, worker_ref, phase_id],
            )
            .store_err()?;
        Ok(changed == 1)
    }

    /// Advisory cancellation marker; workers poll it via the read API.
    pub fn request_cancel(&self, phase_id: &str) -> StoreResult<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE phases
                 SET cancel_requested = 1, updated_at = datetime('now')
                 WHERE phase_id = ?1 AND status IN ('queued', 'ready', 'running')",
                params![phase_id],
            )
            .store_err()?;
        Ok(changed == 1)
    }

    // ── Completion-event dedup ────────────────────────────────────────

    /// At-most-once insert. Returns true iff the event_id was new.
    pub fn try_record_completion(&self, event_id: &str) -> StoreResult<bool> {
        let changed = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO completion_events (event_id) VALUES (?1)",
                params![event_id],
            )
            .store_err()?;
        Ok(changed == 1)
    }

    /// Delete events older than the retention horizon. Returns the number
    /// swept.
    pub fn sweep_completion_events(&self, retention_seconds: i64) -> StoreResult<usize> {
        let modifier = format!("-{} seconds", retention_seconds);
        self.conn
            .execute(
                "DELETE FROM completion_events WHERE received_at < datetime('now', ?1)",
                params![modifier],
            )
            .store_err()
    }

    // ── Coordinator config ────────────────────────────────────────────

    pub fn load_config(&self) -> StoreResult<Option<CoordinatorConfig>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT paused, max_concurrent, dedup_window_seconds
                 FROM coordinator_config WHERE id = 1",
            )
            .store_err()?;
        let mut rows = stmt
            .query_map([], |row| {
                Ok(CoordinatorConfig {
                    paused: row.get::<_, i64>(0)? != 0,
                    max_concurrent: row.get(1)?,
                    dedup_window_seconds: row.get(2)?,
                })
            })
            .store_err()?;
        match rows.next() {
            Some(row) => Ok(Some(row.store_err()?)),
            None => Ok(None),
        }
    }

    pub fn save_config(&self, config: &CoordinatorConfig) -> StoreResult<()> {
        self.conn
            .execute(
                "INSERT INTO coordinator_config (id, paused, max_concurrent, dedup_window_seconds)
                 VALUES (1, ?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET
                    paused = ?1, max_concurrent = ?2, dedup_window_seconds = ?3",
                params![config.paused, config.max_concurrent, config.dedup_window_seconds],
            )
            .store_err()?;
        Ok(())
    }

    // Test hook for backdating timestamps.
    #[doc(hidden)]
    pub fn backdate_started_at(&self, phase_id: &str, seconds_ago: i64) -> StoreResult<()> {
        let modifier = format!("-{} seconds", seconds_ago);
        self.conn
            .execute(
                "UPDATE phases SET started_at = datetime('now', ?1) WHERE phase_id = ?2",
                params![modifier, phase_id],
            )
            .store_err()?;
        Ok(())
    }

    #[doc(hidden)]
    pub fn backdate_completion_event(&self, event_id: &str, seconds_ago: i64) -> StoreResult<()> {
        let modifier = format!("-{} seconds", seconds_ago);
        self.conn
            .execute(
                "UPDATE completion_events SET received_at = datetime('now', ?1)
                 WHERE event_id = ?2",
                params![modifier, event_id],
            )
            .store_err()?;
        Ok(())
    }
}

// ── Shared transition body ────────────────────────────────────────────

fn apply_terminal(
    tx: &rusqlite::Transaction<'_>,
    phase_id: &str,
    terminal: TerminalStatus,
    error: Option<&str>,
) -> StoreResult<TerminalOutcome> {
    let changed = tx
        .execute(
            "UPDATE phases
             SET status = ?1, error_message = ?2,
                 completed_at = datetime('now'), updated_at = datetime('now')
             WHERE phase_id = ?3 AND status = 'running'",
            params![terminal.as_str(), error, phase_id],
        )
        .store_err()?;

    if changed == 0 {
        let current = read_phase(tx, phase_id)?
            .ok_or_else(|| StoreError::PhaseNotFound {
                phase_id: phase_id.to_string(),
            })?
            .status;
        return Ok(TerminalOutcome::Rejected { current });
    }

    let phase = read_phase(tx, phase_id)?.ok_or_else(|| StoreError::PhaseNotFound {
        phase_id: phase_id.to_string(),
    })?;

    // Feature rollup: all phases completed → feature completed. Failures
    // roll the feature over in the block cascade instead, so the cascade
    // and the rollup commit together.
    let mut feature_change = None;
    if terminal == TerminalStatus::Completed {
        let (total, done): (i64, i64) = tx
            .query_row(
                "SELECT COUNT(*), COUNT(*) FILTER (WHERE status = 'completed')
                 FROM phases WHERE feature_id = ?1",
                params![phase.feature_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .store_err()?;
        if total == done {
            tx.execute(
                "UPDATE features
                 SET status = 'completed', updated_at = datetime('now')
                 WHERE feature_id = ?1 AND status != 'completed'",
                params![phase.feature_id],
            )
            .store_err()?;
            feature_change = Some((phase.feature_id, FeatureStatus::Completed));
        }
    }

    Ok(TerminalOutcome::Applied {
        phase,
        feature_change,
    })
}

// ── Internal row helpers ──────────────────────────────────────────────

/// Intermediate row for reading phases before converting the status and
/// depends_on columns into typed values.
struct PhaseRow {
    phase_id: String,
    feature_id: i64,
    phase_number: i64,
    title: String,
    prompt: String,
    depends_on: String,
    status: String,
    priority: i64,
    queue_position: i64,
    external_ticket_ref: Option<String>,
    worker_ref: Option<String>,
    error_message: Option<String>,
    cancel_requested: i64,
    created_at: String,
    updated_at: String,
    ready_at: Option<String>,
    started_at: Option<String>,
    completed_at: Option<String>,
}

impl PhaseRow {
    fn from_row(row: &rusqlite::Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            phase_id: row.get(0)?,
            feature_id: row.get(1)?,
            phase_number: row.get(2)?,
            title: row.get(3)?,
            prompt: row.get(4)?,
            depends_on: row.get(5)?,
            status: row.get(6)?,
            priority: row.get(7)?,
            queue_position: row.get(8)?,
            external_ticket_ref: row.get(9)?,
            worker_ref: row.get(10)?,
            error_message: row.get(11)?,
            cancel_requested: row.get(12)?,
            created_at: row.get(13)?,
            updated_at: row.get(14)?,
            ready_at: row.get(15)?,
            started_at: row.get(16)?,
            completed_at: row.get(17)?,
        })
    }

    fn into_phase(self) -> StoreResult<Phase> {
        let status = PhaseStatus::from_str(&self.status)
            .map_err(|e| StoreError::Terminal(anyhow!(e)))?;
        let depends_on: Vec<i64> = serde_json::from_str(&self.depends_on)
            .map_err(|e| StoreError::Terminal(anyhow!(e)))?;
        Ok(Phase {
            phase_id: self.phase_id,
            feature_id: self.feature_id,
            phase_number: self.phase_number,
            title: self.title,
            prompt: self.prompt,
            depends_on,
            status,
            priority: self.priority,
            queue_position: self.queue_position,
            external_ticket_ref: self.external_ticket_ref,
            worker_ref: self.worker_ref,
            error_message: self.error_message,
            cancel_requested: self.cancel_requested != 0,
            created_at: self.created_at,
            updated_at: self.updated_at,
            ready_at: self.ready_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
        })
    }
}

const PHASE_COLUMNS: &str = "phase_id, feature_id, phase_number, title, prompt, depends_on, \
     status, priority, queue_position, external_ticket_ref, worker_ref, error_message, \
     cancel_requested, created_at, updated_at, ready_at, started_at, completed_at";

fn read_phase(conn: &Connection, phase_id: &str) -> StoreResult<Option<Phase>> {
    let sql = format!("SELECT {} FROM phases WHERE phase_id = ?1", PHASE_COLUMNS);
    let mut stmt = conn.prepare(&sql).store_err()?;
    let mut rows = stmt
        .query_map(params![phase_id], PhaseRow::from_row)
        .store_err()?;
    match rows.next() {
        Some(row) => Ok(Some(row.store_err()?.into_phase()?)),
        None => Ok(None),
    }
}

fn read_phases_by_feature(conn: &Connection, feature_id: i64) -> StoreResult<Vec<Phase>> {
    let sql = format!(
        "SELECT {} FROM phases WHERE feature_id = ?1 ORDER BY phase_number",
        PHASE_COLUMNS
    );
    let mut stmt = conn.prepare(&sql).store_err()?;
    let rows = stmt
        .query_map(params![feature_id], PhaseRow::from_row)
        .store_err()?;
    let mut phases = Vec::new();
    for row in rows {
        phases.push(row.store_err()?.into_phase()?);
    }
    Ok(phases)
}

fn read_feature(conn: &Connection, feature_id: i64) -> StoreResult<Option<Feature>> {
    let mut stmt = conn
        .prepare(
            "SELECT feature_id, title, description, total_phases, status, created_at, updated_at
             FROM features WHERE feature_id = ?1",
        )
        .store_err()?;
    let mut rows = stmt
        .query_map(params![feature_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
            ))
        })
        .store_err()?;
    match rows.next() {
        Some(row) => {
            let (feature_id, title, description, total_phases, status, created_at, updated_at) =
                row.store_err()?;
            let status = FeatureStatus::from_str(&status)
                .map_err(|e| StoreError::Terminal(anyhow!(e)))?;
            Ok(Some(Feature {
                feature_id,
                title,
                description,
                total_phases,
                status,
                created_at,
                updated_at,
            }))
        }
        None => Ok(None),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────

//! Worker process spawning.
//!
//! Workers are detached children: the scheduler never awaits their exit.
//! A worker learns its phase from its first argument, re-reads phase state
//! over the read API, and reports its terminal outcome to the completion
//! webhook, echoing the worker ref it was handed.

use std::process::Stdio;

use async_trait::async_trait;

use crate::errors::LaunchError;

#[async_trait]
pub trait WorkerSpawner: Send + Sync {
    /// Start the worker for a phase. Must return without waiting for the
    /// child; failures surface as [`LaunchError::SpawnFailed`].
    async fn spawn(&self, phase_id: &str, worker_ref: &str) -> Result<(), LaunchError>;
}

/// Spawns the configured worker command as a detached child process with
/// the phase id as its primary argument.
pub struct ProcessSpawner {
    command: String,
}

impl ProcessSpawner {
    pub fn new(command: String) -> Self {
        Self { command }
    }
}

#[async_trait]
impl WorkerSpawner for ProcessSpawner {
    async fn spawn(&self, phase_id: &str, worker_ref: &str) -> Result<(), LaunchError> {
        let mut parts = self.command.split_whitespace();
        let program = parts.next().unwrap_or(&self.command);
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(parts)
            .arg(phase_id)
            .env("FOREMAN_WORKER_REF", worker_ref)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        // kill_on_drop stays false: the child outlives this handle.
        let child = cmd.spawn().map_err(LaunchError::SpawnFailed)?;
        tracing::info!(phase_id, worker_ref, pid = child.id(), "spawned worker");
        drop(child);
        Ok(())
    }
}

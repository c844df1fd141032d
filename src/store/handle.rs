use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::anyhow;

use super::db::{SchedulerDb, StoreResult};
use crate::errors::StoreError;

/// Bounded retry for transient store failures before they surface.
const MAX_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// Cloneable async handle over the single database connection.
///
/// Operations run on the blocking pool; the mutex serializes all access so
/// every closure observes (and extends) a linear history. Transient errors
/// (busy/locked) are retried with bounded backoff here, at the caller edge.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<Mutex<SchedulerDb>>,
}

impl DbHandle {
    pub fn new(db: SchedulerDb) -> Self {
        Self {
            inner: Arc::new(Mutex::new(db)),
        }
    }

    /// Run a store operation on the blocking pool.
    ///
    /// The closure may compose several store calls; they commit as one
    /// linearization point because the connection lock is held throughout.
    pub async fn call<T, F>(&self, op: F) -> StoreResult<T>
    where
        F: Fn(&mut SchedulerDb) -> StoreResult<T> + Send + Sync + 'static,
        T: Send + 'static,
    {
        let op = Arc::new(op);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let inner = Arc::clone(&self.inner);
            let op = Arc::clone(&op);
            let result = tokio::task::spawn_blocking(move || {
                let mut db = inner.lock().map_err(|_| StoreError::LockPoisoned)?;
                op(&mut db)
            })
            .await
            .map_err(|e| StoreError::Terminal(anyhow!("store task panicked: {e}")))?;

            match result {
                Err(err) if err.is_transient() && attempt < MAX_ATTEMPTS => {
                    tokio::time::sleep(RETRY_BACKOFF * attempt).await;
                }
                other => return other,
            }
        }
    }

    /// Synchronous access for startup paths that run before the runtime
    /// is fully wired.
    pub fn lock_sync(&self) -> StoreResult<MutexGuard<'_, SchedulerDb>> {
        self.inner.lock().map_err(|_| StoreError::LockPoisoned)
    }
}

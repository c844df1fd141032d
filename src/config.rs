//! Process configuration.
//!
//! Startup settings come from the environment (with `.env` support).
//! The mutable subset — paused flag, concurrency cap, dedup window — is
//! persisted in the store's `coordinator_config` row and cached in a
//! [`ConfigCell`] shared across the coordinator and the admin API.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, bail};

use crate::store::models::CoordinatorConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub db_path: PathBuf,
    pub max_concurrent: i64,
    pub dedup_window_seconds: i64,
    pub orphan_timeout_seconds: i64,
    pub dedup_sweep_interval_seconds: u64,
    pub webhook_secret: String,
    pub admin_token: String,
    pub ticket_service_url: Option<String>,
    pub ticket_service_token: Option<String>,
    pub worker_command: String,
    pub dev_mode: bool,
}

impl Config {
    /// Read configuration from the environment. Missing required values or
    /// unparseable numbers are configuration errors (process exit code 1).
    pub fn from_env() -> Result<Self> {
        let listen_addr: SocketAddr = env_or("LISTEN_ADDR", "127.0.0.1:8500")
            .parse()
            .context("LISTEN_ADDR is not a valid socket address")?;
        let db_path = PathBuf::from(env_or("DB_PATH", "foreman.db"));

        let max_concurrent: i64 = parse_env("MAX_CONCURRENT", 3)?;
        if max_concurrent < 1 {
            bail!("MAX_CONCURRENT must be >= 1");
        }
        let dedup_window_seconds: i64 = parse_env("DEDUP_WINDOW_SECONDS", 30)?;
        if dedup_window_seconds < 1 {
            bail!("DEDUP_WINDOW_SECONDS must be >= 1");
        }
        let orphan_timeout_seconds: i64 = parse_env("ORPHAN_TIMEOUT_SECONDS", 3600)?;
        let dedup_sweep_interval_seconds: u64 = parse_env("DEDUP_SWEEP_INTERVAL_SECONDS", 300)?;

        let webhook_secret =
            std::env::var("WEBHOOK_SECRET").context("WEBHOOK_SECRET is required")?;
        if webhook_secret.is_empty() {
            bail!("WEBHOOK_SECRET must not be empty");
        }
        let admin_token = std::env::var("ADMIN_TOKEN").context("ADMIN_TOKEN is required")?;

        let ticket_service_url = std::env::var("TICKET_SERVICE_URL").ok();
        let ticket_service_token = std::env::var("TICKET_SERVICE_TOKEN").ok();
        if ticket_service_url.is_some() && ticket_service_token.is_none() {
            bail!("TICKET_SERVICE_TOKEN is required when TICKET_SERVICE_URL is set");
        }

        Ok(Self {
            listen_addr,
            db_path,
            max_concurrent,
            dedup_window_seconds,
            orphan_timeout_seconds,
            dedup_sweep_interval_seconds,
            webhook_secret,
            admin_token,
            ticket_service_url,
            ticket_service_token,
            worker_command: env_or("WORKER_CMD", "phase-worker"),
            dev_mode: std::env::var("DEV_MODE").map(|v| v == "1" || v == "true").unwrap_or(false),
        })
    }

    /// The persisted subset, used to seed `coordinator_config` on first boot.
    pub fn coordinator_defaults(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            paused: false,
            max_concurrent: self.max_concurrent,
            dedup_window_seconds: self.dedup_window_seconds,
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(value) => value
            .parse()
            .with_context(|| format!("{} is not a valid number", key)),
        Err(_) => Ok(default),
    }
}

// ── Live runtime config ───────────────────────────────────────────────

/// Shared cell over the mutable coordinator configuration. Writers persist
/// to the store first, then update the cell.
#[derive(Clone)]
pub struct ConfigCell {
    inner: Arc<Mutex<CoordinatorConfig>>,
}

impl ConfigCell {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(config)),
        }
    }

    pub fn get(&self) -> CoordinatorConfig {
        self.inner.lock().expect("config cell poisoned").clone()
    }

    pub fn set(&self, config: CoordinatorConfig) {
        *self.inner.lock().expect("config cell poisoned") = config;
    }

    pub fn paused(&self) -> bool {
        self.get().paused
    }

    pub fn set_paused(&self, paused: bool) -> CoordinatorConfig {
        let mut guard = self.inner.lock().expect("config cell poisoned");
        guard.paused = paused;
        guard.clone()
    }

    pub fn max_concurrent(&self) -> i64 {
        self.get().max_concurrent
    }

    pub fn dedup_window_seconds(&self) -> i64 {
        self.get().dedup_window_seconds
    }

    /// Apply admin updates; `None` fields are left unchanged. Returns the
    /// new snapshot.
    pub fn update(
        &self,
        max_concurrent: Option<i64>,
        dedup_window_seconds: Option<i64>,
    ) -> CoordinatorConfig {
        let mut guard = self.inner.lock().expect("config cell poisoned");
        if let Some(max) = max_concurrent {
            guard.max_concurrent = max;
        }
        if let Some(window) = dedup_window_seconds {
            guard.dedup_window_seconds = window;
        }
        guard.clone()
    }
}

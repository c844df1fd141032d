use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use foreman::api::{self, AppState};
use foreman::config::{Config, ConfigCell};
use foreman::coordinator::{Coordinator, CoordinatorOptions, LeaderLock};
use foreman::events::EventBus;
use foreman::launcher::WorkerLauncher;
use foreman::launcher::spawner::ProcessSpawner;
use foreman::launcher::tickets::{HttpTicketPoster, NoopTicketPoster, TicketPoster};
use foreman::scheduler::AdmissionController;
use foreman::store::{DbHandle, PhaseStore, SchedulerDb};

// Exit codes: 0 clean shutdown, 1 configuration error, 2 store unavailable
// at startup, 3 lost leadership during shutdown grace.
const EXIT_CONFIG: i32 = 1;
const EXIT_STORE: i32 = 2;
const EXIT_LEADERSHIP: i32 = 3;

#[derive(Parser)]
#[command(name = "foreman")]
#[command(version, about = "Durable phase scheduler for autonomous development workflows")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler service
    Serve,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let code = match cli.command {
        Commands::Serve => serve().await,
    };
    std::process::exit(code);
}

async fn serve() -> i32 {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            return EXIT_CONFIG;
        }
    };

    if let Some(parent) = config.db_path.parent()
        && !parent.as_os_str().is_empty()
        && let Err(e) = std::fs::create_dir_all(parent)
    {
        tracing::error!(error = %e, "failed to create database directory");
        return EXIT_STORE;
    }

    let db = match SchedulerDb::new(&config.db_path) {
        Ok(db) => db,
        Err(e) => {
            tracing::error!(error = %e, "store unavailable");
            return EXIT_STORE;
        }
    };

    let leader = match LeaderLock::try_acquire(&config.db_path) {
        Ok(leader) => leader,
        Err(e) => {
            tracing::error!(error = %e, "failed to probe leader lock");
            return EXIT_STORE;
        }
    };
    let leading = leader.is_some();
    if leading {
        tracing::info!("acquired leadership");
    } else {
        tracing::warn!("another coordinator holds the lock; running as read-only hot spare");
    }

    match run_server(config, db, leading).await {
        Ok(()) => match leader.map(LeaderLock::release).transpose() {
            Ok(_) => 0,
            Err(e) => {
                tracing::error!(error = %e, "lost leadership during shutdown");
                EXIT_LEADERSHIP
            }
        },
        Err(e) => {
            tracing::error!(error = %e, "server error");
            EXIT_CONFIG
        }
    }
}

async fn run_server(config: Config, db: SchedulerDb, leading: bool) -> Result<()> {
    let events = EventBus::new();
    let store = PhaseStore::new(DbHandle::new(db), events);

    // The persisted coordinator config wins over env after first boot, so
    // operator overrides survive restarts.
    let runtime_config = match store.load_config().await? {
        Some(persisted) => persisted,
        None => {
            let defaults = config.coordinator_defaults();
            store.save_config(defaults.clone()).await?;
            defaults
        }
    };
    let config_cell = ConfigCell::new(runtime_config);

    let tickets: Arc<dyn TicketPoster> = match (&config.ticket_service_url, &config.ticket_service_token) {
        (Some(url), Some(token)) => {
            Arc::new(HttpTicketPoster::new(url.clone(), token.clone())?)
        }
        _ => {
            tracing::info!("no ticket service configured, using local ticket refs");
            Arc::new(NoopTicketPoster)
        }
    };
    let spawner = Arc::new(ProcessSpawner::new(config.worker_command.clone()));
    let launcher = WorkerLauncher::new(store.clone(), tickets, spawner);
    let admission = AdmissionController::new(store.clone(), launcher, config_cell.clone());

    let coordinator = Arc::new(Coordinator::new(
        store.clone(),
        admission.clone(),
        config_cell.clone(),
        CoordinatorOptions {
            orphan_timeout_seconds: config.orphan_timeout_seconds,
            dedup_sweep_interval: std::time::Duration::from_secs(
                config.dedup_sweep_interval_seconds,
            ),
        },
    ));
    coordinator.start(leading).await?;

    let state = Arc::new(AppState {
        store,
        admission,
        config: config_cell,
        webhook_secret: config.webhook_secret.clone(),
        admin_token: config.admin_token.clone(),
    });
    let app = api::build_router(state, config.dev_mode);

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.listen_addr))?;
    tracing::info!(addr = %listener.local_addr()?, "scheduler listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    coordinator.stop().await;
    tracing::info!("shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    tracing::info!("shutdown requested");
}

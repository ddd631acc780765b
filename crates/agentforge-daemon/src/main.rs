//! agentforge Daemon
//!
//! Owns one project directory: the feature store, the agent supervisor, the
//! orchestrator and the scheduler, and serves the HTTP control API.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use tracing::{error, info, warn};

use agentforge_core::PolicyEngine;
use agentforge_core::config::load_config;
use agentforge_daemon::claims::ClaimStore;
use agentforge_daemon::events::EventBus;
use agentforge_daemon::orchestrator::{Orchestrator, OrchestratorSettings};
use agentforge_daemon::project::{self, ProjectContext};
use agentforge_daemon::scheduler::SchedulerService;
use agentforge_daemon::server::{self, AppState};
use agentforge_daemon::storage::Database;
use agentforge_daemon::supervisor::{Supervisor, SupervisorConfig};

/// Time allowed for a run to wind down on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "agentforged")]
#[command(version, about = "agentforge daemon - autonomous multi-agent build orchestrator")]
struct Args {
    /// Project directory to orchestrate
    #[arg(long, default_value = ".", env = "AGENTFORGE_PROJECT")]
    project: PathBuf,

    /// HTTP bind address (overrides configuration)
    #[arg(long, env = "AGENTFORGE_ADDR")]
    addr: Option<SocketAddr>,

    /// Database file path (overrides `<project>/.agentforge/agentforge.db`)
    #[arg(long, env = "AGENTFORGE_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Log level filter for the daemon (e.g. "info", "debug", "warn").
    #[arg(long, env = "AGENTFORGE_LOG_LEVEL")]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "AGENTFORGE_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
#[allow(clippy::too_many_lines)]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(Some(&args.project)).context("Failed to load configuration")?;

    let log_level = args.log_level.as_deref().unwrap_or(&config.daemon.log_level);
    agentforge_core::tracing_init::init_tracing(
        &format!("agentforge_daemon={log_level},agentforged={log_level}"),
        args.log_json,
    );

    let addr: SocketAddr = match args.addr {
        Some(addr) => addr,
        None => config
            .daemon
            .addr
            .parse()
            .with_context(|| format!("Invalid daemon.addr {:?}", config.daemon.addr))?,
    };

    let ctx = Arc::new(ProjectContext::open(&args.project)?);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        project = %ctx.root().display(),
        addr = %addr,
        "Starting agentforged"
    );

    let migration = project::migrate_legacy_layout(&ctx);
    if !migration.moved.is_empty() {
        info!(moved = ?migration.moved, "Migrated legacy project files");
    }

    let db_path = args
        .db_path
        .or_else(|| config.daemon.database_path.clone())
        .unwrap_or_else(|| ctx.database_path());
    info!(path = %db_path.display(), "Opening database");
    let db = Database::open(&db_path).await?;

    match project::import_legacy_feature_list(&ctx, &db).await {
        Ok(Some(count)) => info!(count, "Imported legacy feature list"),
        Ok(None) => {}
        Err(e) => warn!(error = %e, "Legacy feature list import failed"),
    }
    let interrupted = db.fail_interrupted_runs().await?;
    if interrupted > 0 {
        warn!(interrupted, "Marked runs from a previous daemon as failed");
    }

    let events = EventBus::new();
    let claims = Arc::new(
        ClaimStore::load(
            db.clone(),
            events.clone(),
            config.orchestrator.max_feature_failures,
        )
        .await?,
    );
    let stale = claims.clear_stale_claims().await?;
    if stale > 0 {
        info!(stale, "Returned stale claims to the queue");
    }

    let policy = Arc::new(PolicyEngine::load(
        ctx.root(),
        config.policy.org_policy_path().as_deref(),
    ));
    for issue in policy.issues() {
        warn!(%issue, "Skipped policy entry");
    }

    let supervisor = Supervisor::new(
        SupervisorConfig::from_config(&config, ctx.root(), ctx.data_dir()),
        Arc::clone(&claims),
        Arc::clone(&policy),
        events.clone(),
    );
    let orchestrator = Orchestrator::new(
        Arc::clone(&ctx),
        claims,
        supervisor,
        events.clone(),
        OrchestratorSettings::from_config(&config),
    );

    let scheduler = Arc::new(SchedulerService::new(
        db,
        orchestrator.clone(),
        events,
    ));
    if let Err(e) = scheduler.log_missed_windows(Utc::now()).await {
        warn!(error = %e, "Missed-window check failed");
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let tick_interval = Duration::from_secs(config.scheduler.tick_interval_secs.max(1));
    let scheduler_handle = tokio::spawn(run_scheduler(
        Arc::clone(&scheduler),
        tick_interval,
        shutdown_rx,
    ));

    // Unset $NOTIFY_SOCKET so agent subprocesses don't notify systemd.
    #[cfg(unix)]
    if let Err(e) = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]) {
        warn!(error = %e, "sd_notify failed");
    }

    let state = AppState {
        orchestrator: orchestrator.clone(),
        scheduler,
        policy,
    };
    server::serve(addr, state, shutdown_signal()).await?;

    let _ = shutdown_tx.send(true);
    let _ = scheduler_handle.await;

    if orchestrator.status().await.state.is_active() {
        let _ = orchestrator.stop("daemon shutdown").await;
        if tokio::time::timeout(SHUTDOWN_GRACE, orchestrator.wait_idle())
            .await
            .is_err()
        {
            error!("Run did not stop in time");
        }
    }
    orchestrator.supervisor().stop().await;

    info!("Daemon stopped");
    Ok(())
}

async fn run_scheduler(
    scheduler: Arc<SchedulerService>,
    every: Duration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = scheduler.tick(Utc::now()).await {
                    error!(error = %e, "Scheduler tick failed");
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Cannot install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C shutdown signal"),
        () = sigterm => info!("Received SIGTERM shutdown signal"),
    }
}

use std::sync::Arc;

use adsync_storage::PgMetricsStore;
use adsync_sync::{connect_store, maybe_build_scheduler, ScheduleSettings, SyncConfig, SyncEngine};
use adsync_web::AppState;
use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "adsync-cli")]
#[command(about = "Ad metrics sync and alerting")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Sync every connected account of one user.
    Sync {
        #[arg(long)]
        user: Uuid,
    },
    /// Apply database migrations.
    Migrate,
    /// Run the HTTP API, plus the scheduler when enabled.
    Serve,
    /// Show a user's schedule, or update it when any option is given.
    Schedule {
        #[arg(long)]
        user: Uuid,
        #[arg(long)]
        enabled: Option<bool>,
        #[arg(long)]
        run_time: Option<String>,
        #[arg(long)]
        interval_hours: Option<i32>,
    },
    /// Evaluate alert rules for one user without syncing.
    Evaluate {
        #[arg(long)]
        user: Uuid,
    },
}

fn init_tracing() {
    let json = std::env::var("ADSYNC_LOG_JSON")
        .map(|v| matches!(v.as_str(), "1" | "true"))
        .unwrap_or(false);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "adsync=info".into()),
        )
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(tracing_subscriber::fmt::layer))
        .init();
}

/// Cancelled on ctrl-c.
fn shutdown_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping after in-flight work");
            trigger.cancel();
        }
    });
    cancel
}

async fn migrated_store(config: &SyncConfig) -> Result<PgMetricsStore> {
    let store = connect_store(config).await?;
    store.migrate().await?;
    Ok(store)
}

async fn build_engine(config: &SyncConfig) -> Result<Arc<SyncEngine>> {
    let store = migrated_store(config).await?;
    Ok(Arc::new(SyncEngine::from_config(config, Arc::new(store))?))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Sync { user } => {
            let result = adsync_sync::run_sync_once_from_env(user, &shutdown_token()).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if let Some(err) = result.error.as_ref().filter(|_| !result.success) {
                bail!("sync failed ({}): {}", err.kind.as_str(), err.message);
            }
        }
        Commands::Migrate => {
            migrated_store(&config).await?;
            println!("migrations applied");
        }
        Commands::Serve => {
            let engine = build_engine(&config).await?;
            let cancel = shutdown_token();
            let scheduler = maybe_build_scheduler(engine.clone(), &config, cancel.clone()).await?;
            if let Some(sched) = &scheduler {
                sched.start().await.context("starting scheduler")?;
                info!(cron = %config.scheduler_cron, "scheduler started");
            }
            adsync_web::serve(AppState::new(engine, cancel), config.web_port).await?;
            if let Some(mut sched) = scheduler {
                sched.shutdown().await.context("stopping scheduler")?;
            }
        }
        Commands::Schedule {
            user,
            enabled,
            run_time,
            interval_hours,
        } => {
            let engine = build_engine(&config).await?;
            let schedules = engine.schedules();
            let schedule = if enabled.is_none() && run_time.is_none() && interval_hours.is_none() {
                schedules.get_or_create(user).await?
            } else {
                let settings = ScheduleSettings {
                    enabled,
                    run_time,
                    interval_hours,
                };
                schedules.update_settings(user, settings, Utc::now()).await?
            };
            println!("{}", serde_json::to_string_pretty(&schedule)?);
        }
        Commands::Evaluate { user } => {
            let engine = build_engine(&config).await?;
            let created = engine.evaluate_user(user, Utc::now()).await?;
            println!("notifications created: {}", created.len());
            for n in &created {
                println!("  [{}] {} - {}", n.severity.as_str(), n.title, n.message);
            }
        }
    }

    Ok(())
}

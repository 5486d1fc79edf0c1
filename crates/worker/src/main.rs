use std::sync::Arc;

use taskflow::config::Config;
use taskflow::db;
use taskflow::reaper::Reaper;
use taskflow::schedules::CronScheduler;
use taskflow::tasks::{PgStore, TracingObserver};
use taskflow::worker::{FallbackJournal, WorkerPool};
use taskflow::Engine;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod handlers;
use handlers::build_registry;

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = Config::from_env()?;
    init_tracing(cfg.log_json);

    info!(
        worker_id = %cfg.worker_id,
        queues = ?cfg.queues,
        concurrency = cfg.concurrency,
        reaper_grace_secs = cfg.reaper_grace_secs,
        scheduler = cfg.scheduler_enabled,
        migrate_on_startup = cfg.migrate_on_startup,
        fallback = %cfg.fallback_path.display(),
        "taskflow worker starting"
    );

    let pool = db::make_pool(&cfg.database_url, &cfg.pool).await?;
    if cfg.migrate_on_startup {
        db::run_migrations(&pool).await?;
    }

    let store = Arc::new(PgStore::new(pool.clone(), cfg.retry.clone()));
    let engine = Engine::new(store).with_observer(Arc::new(TracingObserver));
    let registry = Arc::new(build_registry());
    let journal = Arc::new(FallbackJournal::new(cfg.fallback_path.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ---- Worker pool ----
    let mut workers = WorkerPool::new(
        engine.clone(),
        registry,
        journal,
        &cfg.worker_id,
        cfg.concurrency,
    );
    for queue in &cfg.queues {
        workers = workers.queue(cfg.worker_config(queue));
    }
    let worker_handle = tokio::spawn(workers.run(shutdown_rx.clone()));

    // ---- Reaper ----
    let reaper = Reaper::new(engine.clone(), cfg.reaper_config());
    let reaper_handle = tokio::spawn(reaper.run(shutdown_rx.clone()));

    // ---- Cron scheduler ----
    let scheduler_handle = if cfg.scheduler_enabled {
        let scheduler = CronScheduler::new(engine.clone(), cfg.scheduler_interval);
        Some(tokio::spawn(scheduler.run(shutdown_rx.clone())))
    } else {
        None
    };

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested; finishing in-flight tasks");
    let _ = shutdown_tx.send(true);

    if let Err(e) = worker_handle.await {
        warn!(error = %e, "worker pool ended abnormally");
    }
    if let Err(e) = reaper_handle.await {
        warn!(error = %e, "reaper ended abnormally");
    }
    if let Some(handle) = scheduler_handle {
        if let Err(e) = handle.await {
            warn!(error = %e, "scheduler ended abnormally");
        }
    }

    pool.close().await;
    info!("taskflow worker stopped");
    Ok(())
}

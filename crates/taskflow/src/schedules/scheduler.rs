use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::engine::Engine;
use crate::error::Result;
use crate::schedules::ScheduleFired;

/// Fires due cron entries. Any number of instances may run against the
/// same store.
pub struct CronScheduler {
    engine: Engine,
    interval: Duration,
    batch_size: i64,
}

impl CronScheduler {
    pub fn new(engine: Engine, interval: Duration) -> Self {
        Self {
            engine,
            interval,
            batch_size: 100,
        }
    }

    pub fn batch_size(mut self, n: i64) -> Self {
        self.batch_size = n.max(1);
        self
    }

    pub async fn tick(&self, now: DateTime<Utc>) -> Result<Vec<ScheduleFired>> {
        let fired = self.engine.fire_due_schedules(now, self.batch_size).await?;

        for f in &fired {
            info!(
                schedule = %f.schedule_name,
                task_id = %f.task_id,
                created = f.created,
                next_run_at = ?f.next_run_at,
                "schedule fired"
            );
        }
        Ok(fired)
    }

    /// Ticks on the store's clock until `shutdown` flips.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval.max(Duration::from_millis(10)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        while !*shutdown.borrow() {
            let stop = tokio::select! {
                _ = ticker.tick() => false,
                res = shutdown.changed() => res.is_err() || *shutdown.borrow(),
            };
            if stop {
                break;
            }

            let result = match self.engine.now().await {
                Ok(now) => self.tick(now).await.map(|_| ()),
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                warn!(error = %e, "scheduler tick failed");
            }
        }
    }
}

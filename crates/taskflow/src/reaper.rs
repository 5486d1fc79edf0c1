//! Periodic liveness pass: reclaims claims whose worker went quiet and
//! repairs workflow releases or cascades that were interrupted.

use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::engine::Engine;
use crate::error::Result;
use crate::tasks::TaskStatus;

#[derive(Debug, Clone)]
pub struct ReaperConfig {
    pub interval: Duration,
    /// Window for claims whose task has no `timeout_sec`.
    pub grace_secs: i32,
    pub batch_size: i64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            grace_secs: 3600,
            batch_size: 500,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReapReport {
    pub requeued: usize,
    pub failed: usize,
    pub released: usize,
    pub cancelled: usize,
}

pub struct Reaper {
    engine: Engine,
    cfg: ReaperConfig,
}

impl Reaper {
    pub fn new(engine: Engine, cfg: ReaperConfig) -> Self {
        Self { engine, cfg }
    }

    pub async fn tick(&self) -> Result<ReapReport> {
        let reaped = self
            .engine
            .reap_abandoned(self.cfg.grace_secs, self.cfg.batch_size)
            .await?;
        let sweep = self.engine.sweep_workflows(self.cfg.batch_size).await?;

        let failed = reaped
            .iter()
            .filter(|t| t.status == TaskStatus::Failed)
            .count();
        let report = ReapReport {
            requeued: reaped.len() - failed,
            failed,
            released: sweep.released.len(),
            cancelled: sweep.cancelled.len(),
        };

        if report != ReapReport::default() {
            info!(
                requeued = report.requeued,
                failed = report.failed,
                released = report.released,
                cancelled = report.cancelled,
                "reaper pass"
            );
        }
        Ok(report)
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.cfg.interval.max(Duration::from_millis(10)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        while !*shutdown.borrow() {
            let stop = tokio::select! {
                _ = ticker.tick() => false,
                res = shutdown.changed() => res.is_err() || *shutdown.borrow(),
            };
            if stop {
                break;
            }
            if let Err(e) = self.tick().await {
                warn!(error = %e, "reaper pass failed");
            }
        }
    }
}

pub mod executor;
pub mod fallback;
pub mod worker_loop;

pub use executor::{ExecError, Executor, ExecutorRegistry, FnExecutor, HandlerOptions};
pub use fallback::{FallbackJournal, OutcomeRecord, PendingOutcome, ReplayReport};
pub use worker_loop::{ExecOutcome, LoopStep, Reported, WorkerConfig, WorkerLoop};

use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::engine::Engine;

/// N independent loops per queue sharing one engine. Worker ids are
/// `<base>-<n>`, numbered across all queues.
pub struct WorkerPool {
    engine: Engine,
    registry: Arc<ExecutorRegistry>,
    journal: Arc<FallbackJournal>,
    worker_id_base: String,
    concurrency: usize,
    configs: Vec<WorkerConfig>,
}

impl WorkerPool {
    pub fn new(
        engine: Engine,
        registry: Arc<ExecutorRegistry>,
        journal: Arc<FallbackJournal>,
        worker_id_base: &str,
        concurrency: usize,
    ) -> Self {
        Self {
            engine,
            registry,
            journal,
            worker_id_base: worker_id_base.to_string(),
            concurrency: concurrency.max(1),
            configs: Vec::new(),
        }
    }

    pub fn queue(mut self, cfg: WorkerConfig) -> Self {
        self.configs.push(cfg);
        self
    }

    pub fn loops(&self) -> Vec<WorkerLoop> {
        let mut n = 0;
        let mut out = Vec::with_capacity(self.configs.len() * self.concurrency);
        for cfg in &self.configs {
            for _ in 0..self.concurrency {
                n += 1;
                out.push(WorkerLoop::new(
                    self.engine.clone(),
                    self.registry.clone(),
                    self.journal.clone(),
                    format!("{}-{}", self.worker_id_base, n),
                    cfg.clone(),
                ));
            }
        }
        out
    }

    /// Replays the journal, then runs every loop until `shutdown` flips.
    /// In-flight tasks finish before their loop exits.
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        match self.journal.replay(&self.engine).await {
            Ok(r) if r.kept > 0 => warn!(kept = r.kept, "fallback journal still has outcomes"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "fallback replay at startup failed"),
        }

        let mut set = JoinSet::new();
        for l in self.loops() {
            set.spawn(l.run(shutdown.clone()));
        }
        info!(
            loops = set.len(),
            queues = self.configs.len(),
            base = %self.worker_id_base,
            registered = ?self.registry.task_names(),
            "worker pool started"
        );

        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "worker loop ended abnormally");
            }
        }
    }
}

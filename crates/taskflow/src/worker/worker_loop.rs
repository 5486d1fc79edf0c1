use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::engine::Engine;
use crate::error::{EngineError, Result};
use crate::tasks::Task;
use crate::worker::executor::ExecutorRegistry;
use crate::worker::fallback::{FallbackJournal, OutcomeRecord, PendingOutcome};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub queue: String,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    /// Deadline for tasks without `timeout_sec`.
    pub default_timeout: Duration,
    /// Attempts at writing an outcome before it goes to the journal.
    pub outcome_retries: u32,
    pub outcome_retry_base: Duration,
}

impl WorkerConfig {
    pub fn new(queue: &str) -> Self {
        Self {
            queue: queue.to_string(),
            poll_interval: Duration::from_millis(500),
            heartbeat_interval: Duration::from_secs(30),
            default_timeout: Duration::from_secs(3600),
            outcome_retries: 5,
            outcome_retry_base: Duration::from_millis(200),
        }
    }
}

/// How an execution ended, before it is written to the store.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecOutcome {
    Completed(Value),
    Failed(String),
}

impl ExecOutcome {
    fn record(&self) -> OutcomeRecord {
        match self {
            ExecOutcome::Completed(v) => OutcomeRecord::Completed { result: v.clone() },
            ExecOutcome::Failed(e) => OutcomeRecord::Failed { error: e.clone() },
        }
    }
}

/// Where an outcome ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reported {
    Stored,
    /// The store refused it (claim lost to the reaper, task gone).
    Rejected,
    Journaled,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoopStep {
    Idle,
    Executed {
        task_id: Uuid,
        outcome: ExecOutcome,
        reported: Reported,
    },
}

/// One claim-execute-report loop with its own worker id.
pub struct WorkerLoop {
    engine: Engine,
    registry: Arc<ExecutorRegistry>,
    journal: Arc<FallbackJournal>,
    worker_id: String,
    cfg: WorkerConfig,
}

impl WorkerLoop {
    pub fn new(
        engine: Engine,
        registry: Arc<ExecutorRegistry>,
        journal: Arc<FallbackJournal>,
        worker_id: impl Into<String>,
        cfg: WorkerConfig,
    ) -> Self {
        Self {
            engine,
            registry,
            journal,
            worker_id: worker_id.into(),
            cfg,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Claims at most one task and sees it through. Journaled outcomes go
    /// back to the store before the claim.
    pub async fn run_once(&self) -> Result<LoopStep> {
        if self.journal.has_pending().await {
            if let Err(e) = self.journal.replay(&self.engine).await {
                warn!(worker_id = %self.worker_id, error = %e, "fallback replay failed");
            }
        }

        let Some(task) = self.engine.claim(&self.cfg.queue, &self.worker_id).await? else {
            return Ok(LoopStep::Idle);
        };

        debug!(
            worker_id = %self.worker_id,
            task_id = %task.id,
            task_name = %task.task_name,
            attempt = task.attempt,
            "claimed task"
        );

        let outcome = self.execute(&task).await;
        let reported = self.report(&task, &outcome).await?;

        Ok(LoopStep::Executed {
            task_id: task.id,
            outcome,
            reported,
        })
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(worker_id = %self.worker_id, queue = %self.cfg.queue, "worker loop started");

        while !*shutdown.borrow() {
            let idle = match self.run_once().await {
                Ok(LoopStep::Idle) => true,
                Ok(LoopStep::Executed { .. }) => false,
                Err(e) => {
                    warn!(worker_id = %self.worker_id, error = %e, "worker iteration failed");
                    true
                }
            };

            if idle {
                let sender_gone = tokio::select! {
                    _ = tokio::time::sleep(self.cfg.poll_interval) => false,
                    res = shutdown.changed() => res.is_err(),
                };
                if sender_gone {
                    break;
                }
            }
        }

        info!(worker_id = %self.worker_id, "worker loop stopped");
    }

    fn deadline(&self, task: &Task, handler_timeout: Option<Duration>) -> Duration {
        let own = task
            .timeout_sec
            .filter(|s| *s > 0)
            .map(|s| Duration::from_secs(s as u64))
            .unwrap_or(self.cfg.default_timeout);
        handler_timeout.map_or(own, |h| h.min(own))
    }

    /// Runs the executor in its own task under the deadline, heartbeating
    /// while it runs.
    async fn execute(&self, task: &Task) -> ExecOutcome {
        let Some(entry) = self.registry.handler_for(&task.task_name) else {
            return ExecOutcome::Failed(format!("unknown task_name: {}", task.task_name));
        };

        let deadline = self.deadline(task, entry.timeout());
        let task_name = task.task_name.clone();
        let params = task.params.clone();
        let mut handle = tokio::spawn(async move { entry.run(&task_name, params).await });

        let expiry = tokio::time::sleep(deadline);
        tokio::pin!(expiry);
        let mut beat =
            tokio::time::interval(self.cfg.heartbeat_interval.max(Duration::from_millis(10)));
        beat.tick().await;

        loop {
            tokio::select! {
                joined = &mut handle => {
                    return match joined {
                        Ok(Ok(value)) => ExecOutcome::Completed(value),
                        Ok(Err(e)) => ExecOutcome::Failed(e.message),
                        Err(e) if e.is_panic() => ExecOutcome::Failed("executor panicked".to_string()),
                        Err(_) => ExecOutcome::Failed("executor cancelled".to_string()),
                    };
                }
                _ = &mut expiry => {
                    handle.abort();
                    warn!(
                        worker_id = %self.worker_id,
                        task_id = %task.id,
                        deadline_secs = deadline.as_secs_f64(),
                        "executor timed out"
                    );
                    return ExecOutcome::Failed(format!(
                        "timeout: executor did not finish within {}s",
                        deadline.as_secs()
                    ));
                }
                _ = beat.tick() => {
                    match self.engine.heartbeat(task.id, &self.worker_id).await {
                        Ok(true) => {}
                        Ok(false) => warn!(
                            worker_id = %self.worker_id,
                            task_id = %task.id,
                            "heartbeat rejected; claim no longer held"
                        ),
                        Err(e) => warn!(
                            worker_id = %self.worker_id,
                            task_id = %task.id,
                            error = %e,
                            "heartbeat failed"
                        ),
                    }
                }
            }
        }
    }

    async fn write_outcome(&self, task_id: Uuid, outcome: &ExecOutcome) -> Result<()> {
        let worker = Some(self.worker_id.as_str());
        match outcome {
            ExecOutcome::Completed(v) => self
                .engine
                .complete(task_id, worker, v.clone())
                .await
                .map(|_| ()),
            ExecOutcome::Failed(e) => self.engine.fail(task_id, worker, e).await.map(|_| ()),
        }
    }

    /// Writes the outcome, retrying transient storage errors. When the
    /// store stays unreachable the outcome goes to the local journal.
    pub async fn report(&self, task: &Task, outcome: &ExecOutcome) -> Result<Reported> {
        let attempts = self.cfg.outcome_retries.max(1);
        let mut delay = self.cfg.outcome_retry_base;
        let mut last_err: Option<EngineError> = None;

        for attempt in 1..=attempts {
            match self.write_outcome(task.id, outcome).await {
                Ok(()) => return Ok(Reported::Stored),
                Err(e) if e.is_transient() => {
                    warn!(
                        worker_id = %self.worker_id,
                        task_id = %task.id,
                        attempt,
                        error = %e,
                        "outcome write failed"
                    );
                    last_err = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(delay).await;
                        delay = delay.saturating_mul(2);
                    }
                }
                Err(e) => {
                    warn!(
                        worker_id = %self.worker_id,
                        task_id = %task.id,
                        error = %e,
                        "outcome rejected by store"
                    );
                    return Ok(Reported::Rejected);
                }
            }
        }

        let record = PendingOutcome {
            task_id: task.id,
            worker_id: self.worker_id.clone(),
            outcome: outcome.record(),
            recorded_at: Utc::now(),
        };

        match self.journal.append(&record).await {
            Ok(()) => {
                error!(
                    worker_id = %self.worker_id,
                    task_id = %task.id,
                    journal = %self.journal.path().display(),
                    error = %last_err.map(|e| e.to_string()).unwrap_or_default(),
                    "store unavailable; outcome written to fallback journal"
                );
                Ok(Reported::Journaled)
            }
            Err(io) => {
                error!(
                    worker_id = %self.worker_id,
                    task_id = %task.id,
                    error = %io,
                    "store unavailable and fallback journal write failed; outcome lost"
                );
                Err(EngineError::Storage(format!(
                    "outcome for task {} could not be stored or journaled: {io}",
                    task.id
                )))
            }
        }
    }
}

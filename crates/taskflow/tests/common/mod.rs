#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use taskflow::clock::ManualClock;
use taskflow::error::{EngineError, Result};
use taskflow::schedules::{Schedule, ScheduleFired, ScheduleSpec, ScheduleUpdate};
use taskflow::tasks::{
    FailureApplied, MemoryStore, NewTask, QueueStats, RetryConfig, ScheduleStore, Spawned, Task,
    TaskFilter, TaskObserver, TaskPage, TaskStatus, TaskStore, WorkflowStore,
};
use taskflow::workflows::{
    DependencyEdge, Workflow, WorkflowCreated, WorkflowGraph, WorkflowTaskSpec,
};
use taskflow::Engine;

/// Connects to TEST_DATABASE_URL, migrates and truncates. `None` when the
/// variable is unset so the Postgres suites skip on machines without one.
pub async fn setup_db() -> Option<PgPool> {
    let _ = dotenvy::dotenv();

    let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
        eprintln!("TEST_DATABASE_URL not set; skipping Postgres test");
        return None;
    };

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .expect("failed to connect to TEST_DATABASE_URL");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("migrations failed");

    sqlx::query(
        r#"
        TRUNCATE TABLE
            task_dependencies,
            scheduled_tasks,
            queue_policies,
            tasks,
            workflows
        RESTART IDENTITY CASCADE
        "#,
    )
    .execute(&pool)
    .await
    .expect("truncate failed");

    Some(pool)
}

/// Zero jitter, 1s base, dead-lettering on.
pub fn fixed_retry() -> RetryConfig {
    RetryConfig {
        base_seconds: 1,
        max_seconds: 15,
        jitter_pct: 0.0,
        dead_letter_default: true,
    }
}

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 30).unwrap()
}

pub fn memory_store() -> (Arc<MemoryStore>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(t0()));
    let store = Arc::new(MemoryStore::with_clock(fixed_retry(), clock.clone()));
    (store, clock)
}

pub fn memory_engine() -> (Engine, Arc<ManualClock>) {
    let (store, clock) = memory_store();
    (Engine::new(store), clock)
}

pub fn task(queue: &str, name: &str) -> NewTask {
    NewTask::new(queue, name, serde_json::json!({}))
}

/// Records every transition the engine reports.
#[derive(Default)]
pub struct RecordingObserver {
    seen: Mutex<Vec<(Uuid, TaskStatus)>>,
}

impl RecordingObserver {
    pub fn seen(&self) -> Vec<(Uuid, TaskStatus)> {
        self.seen.lock().unwrap().clone()
    }

    pub fn statuses_of(&self, task_id: Uuid) -> Vec<TaskStatus> {
        self.seen()
            .into_iter()
            .filter(|(id, _)| *id == task_id)
            .map(|(_, s)| s)
            .collect()
    }
}

impl TaskObserver for RecordingObserver {
    fn on_task_status_changed(&self, task: &Task) {
        self.seen.lock().unwrap().push((task.id, task.status));
    }
}

/// Memory store whose outcome writes fail with a storage error while
/// `down` is set.
pub struct FlakyStore {
    pub inner: MemoryStore,
    down: AtomicBool,
}

impl FlakyStore {
    pub fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            down: AtomicBool::new(false),
        }
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.down.load(Ordering::SeqCst) {
            return Err(EngineError::Storage("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl TaskStore for FlakyStore {
    async fn now(&self) -> Result<DateTime<Utc>> {
        self.inner.now().await
    }

    async fn spawn(&self, task: &NewTask) -> Result<Spawned> {
        self.inner.spawn(task).await
    }

    async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>> {
        self.inner.get_task(task_id).await
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<TaskPage> {
        self.inner.list_tasks(filter).await
    }

    async fn claim(&self, queue: &str, worker_id: &str) -> Result<Option<Task>> {
        self.inner.claim(queue, worker_id).await
    }

    async fn heartbeat(&self, task_id: Uuid, worker_id: &str) -> Result<bool> {
        self.inner.heartbeat(task_id, worker_id).await
    }

    async fn complete(
        &self,
        task_id: Uuid,
        worker_id: Option<&str>,
        result: Value,
    ) -> Result<Task> {
        self.check()?;
        self.inner.complete(task_id, worker_id, result).await
    }

    async fn fail(
        &self,
        task_id: Uuid,
        worker_id: Option<&str>,
        error: &str,
    ) -> Result<FailureApplied> {
        self.check()?;
        self.inner.fail(task_id, worker_id, error).await
    }

    async fn cancel(&self, task_id: Uuid) -> Result<Task> {
        self.inner.cancel(task_id).await
    }

    async fn reap_abandoned(&self, grace_sec: i32, limit: i64) -> Result<Vec<FailureApplied>> {
        self.inner.reap_abandoned(grace_sec, limit).await
    }

    async fn replay(&self, task_id: Uuid) -> Result<Task> {
        self.inner.replay(task_id).await
    }

    async fn queue_stats(&self, queue: &str) -> Result<QueueStats> {
        self.inner.queue_stats(queue).await
    }

    async fn set_dead_letter(&self, queue: &str, enabled: bool) -> Result<()> {
        self.inner.set_dead_letter(queue, enabled).await
    }
}

#[async_trait]
impl WorkflowStore for FlakyStore {
    async fn create_workflow(
        &self,
        name: &str,
        tasks: &[WorkflowTaskSpec],
        edges: &[DependencyEdge],
    ) -> Result<WorkflowCreated> {
        self.inner.create_workflow(name, tasks, edges).await
    }

    async fn workflow_graph(&self, workflow_id: Uuid) -> Result<WorkflowGraph> {
        self.inner.workflow_graph(workflow_id).await
    }

    async fn list_workflows(&self, limit: i64) -> Result<Vec<Workflow>> {
        self.inner.list_workflows(limit).await
    }

    async fn release_ready(&self, workflow_id: Uuid, candidates: &[Uuid]) -> Result<Vec<Task>> {
        self.inner.release_ready(workflow_id, candidates).await
    }

    async fn active_workflows(&self, limit: i64) -> Result<Vec<Uuid>> {
        self.inner.active_workflows(limit).await
    }
}

#[async_trait]
impl ScheduleStore for FlakyStore {
    async fn create_schedule(&self, spec: &ScheduleSpec) -> Result<Schedule> {
        self.inner.create_schedule(spec).await
    }

    async fn update_schedule(&self, name: &str, update: &ScheduleUpdate) -> Result<Schedule> {
        self.inner.update_schedule(name, update).await
    }

    async fn delete_schedule(&self, name: &str) -> Result<bool> {
        self.inner.delete_schedule(name).await
    }

    async fn get_schedule(&self, name: &str) -> Result<Option<Schedule>> {
        self.inner.get_schedule(name).await
    }

    async fn list_schedules(&self) -> Result<Vec<Schedule>> {
        self.inner.list_schedules().await
    }

    async fn fire_due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<ScheduleFired>> {
        self.inner.fire_due(now, limit).await
    }

    async fn trigger_now(&self, name: &str) -> Result<ScheduleFired> {
        self.inner.trigger_now(name).await
    }
}

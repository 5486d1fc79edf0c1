//! Storage seams. Every method is one atomic operation against the
//! backing store; callers never combine them into read-modify-write
//! sequences of their own.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::error::Result;
use crate::schedules::{Schedule, ScheduleFired, ScheduleSpec, ScheduleUpdate};
use crate::tasks::{NewTask, QueueStats, SpawnOutcome, Task, TaskFilter, TaskPage};
use crate::workflows::{DependencyEdge, Workflow, WorkflowCreated, WorkflowGraph, WorkflowTaskSpec};

pub const ABANDONED_ERROR: &str = "abandoned: worker did not complete within timeout";

/// Row written by `spawn`, or the live row an idempotency key matched.
#[derive(Debug, Clone)]
pub struct Spawned {
    pub task: Task,
    pub created: bool,
}

impl Spawned {
    pub fn outcome(&self) -> SpawnOutcome {
        SpawnOutcome {
            task_id: self.task.id,
            status: self.task.status,
            created: self.created,
        }
    }
}

/// A failure applied to a claimed task, by a worker or by the reaper.
#[derive(Debug, Clone)]
pub struct FailureApplied {
    pub task: Task,
    /// Companion copy written to `<queue>-dlq`.
    pub dead_letter: Option<Task>,
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// The store's clock.
    async fn now(&self) -> Result<DateTime<Utc>>;

    async fn spawn(&self, task: &NewTask) -> Result<Spawned>;

    async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>>;

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<TaskPage>;

    /// Hands the next eligible task in `queue` to `worker_id`, or `None`.
    async fn claim(&self, queue: &str, worker_id: &str) -> Result<Option<Task>>;

    /// False when `worker_id` no longer holds the claim.
    async fn heartbeat(&self, task_id: Uuid, worker_id: &str) -> Result<bool>;

    async fn complete(&self, task_id: Uuid, worker_id: Option<&str>, result: Value)
        -> Result<Task>;

    async fn fail(
        &self,
        task_id: Uuid,
        worker_id: Option<&str>,
        error: &str,
    ) -> Result<FailureApplied>;

    async fn cancel(&self, task_id: Uuid) -> Result<Task>;

    /// Releases claims whose holder stopped heartbeating. Claims without a
    /// `timeout_sec` use `grace_sec`.
    async fn reap_abandoned(&self, grace_sec: i32, limit: i64) -> Result<Vec<FailureApplied>>;

    /// Resubmits a failed or cancelled task (or a dead-letter copy) into
    /// its original queue.
    async fn replay(&self, task_id: Uuid) -> Result<Task>;

    async fn queue_stats(&self, queue: &str) -> Result<QueueStats>;

    async fn set_dead_letter(&self, queue: &str, enabled: bool) -> Result<()>;
}

#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Validates the graph, then inserts the workflow, its tasks and edges
    /// atomically. Tasks with predecessors are inserted held.
    async fn create_workflow(
        &self,
        name: &str,
        tasks: &[WorkflowTaskSpec],
        edges: &[DependencyEdge],
    ) -> Result<WorkflowCreated>;

    async fn workflow_graph(&self, workflow_id: Uuid) -> Result<WorkflowGraph>;

    async fn list_workflows(&self, limit: i64) -> Result<Vec<Workflow>>;

    /// Un-holds those `candidates` whose predecessors have all completed,
    /// re-checked inside the store. Returns the tasks released.
    async fn release_ready(&self, workflow_id: Uuid, candidates: &[Uuid]) -> Result<Vec<Task>>;

    /// Workflows that still have held members.
    async fn active_workflows(&self, limit: i64) -> Result<Vec<Uuid>>;
}

#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn create_schedule(&self, spec: &ScheduleSpec) -> Result<Schedule>;

    async fn update_schedule(&self, name: &str, update: &ScheduleUpdate) -> Result<Schedule>;

    async fn delete_schedule(&self, name: &str) -> Result<bool>;

    async fn get_schedule(&self, name: &str) -> Result<Option<Schedule>>;

    async fn list_schedules(&self) -> Result<Vec<Schedule>>;

    /// Spawns every enabled schedule due at `now` and advances it. A due
    /// entry is handled by exactly one concurrent caller.
    async fn fire_due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<ScheduleFired>>;

    async fn trigger_now(&self, name: &str) -> Result<ScheduleFired>;
}

pub trait Store: TaskStore + WorkflowStore + ScheduleStore {}

impl<T: TaskStore + WorkflowStore + ScheduleStore> Store for T {}

//! Boundary operations. Every transition goes through here so the
//! observer and the dependency resolver see it.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::schedules::{Schedule, ScheduleFired, ScheduleSpec, ScheduleUpdate};
use crate::tasks::{
    NewTask, NoopObserver, QueueStats, SpawnOutcome, Store, Task, TaskFilter, TaskObserver,
    TaskPage, TaskStatus,
};
use crate::workflows::{
    dag, DependencyEdge, DependencyResolver, SweepReport, Workflow, WorkflowCreated,
    WorkflowGraph, WorkflowState, WorkflowStatus, WorkflowTaskSpec, WorkflowTaskStatus,
};

#[derive(Clone)]
pub struct Engine {
    store: Arc<dyn Store>,
    observer: Arc<dyn TaskObserver>,
    resolver: DependencyResolver,
}

impl Engine {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            resolver: DependencyResolver::new(store.clone()),
            store,
            observer: Arc::new(NoopObserver),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn TaskObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn resolver(&self) -> &DependencyResolver {
        &self.resolver
    }

    fn notify(&self, task: &Task) {
        self.observer.on_task_status_changed(task);
    }

    fn notify_all(&self, tasks: &[Task]) {
        tasks.iter().for_each(|t| self.notify(t));
    }

    pub async fn now(&self) -> Result<DateTime<Utc>> {
        self.store.now().await
    }

    // ----------------------------
    // Tasks
    // ----------------------------

    pub async fn spawn(&self, task: NewTask) -> Result<SpawnOutcome> {
        let spawned = self.store.spawn(&task).await?;
        if spawned.created {
            self.notify(&spawned.task);
        } else {
            info!(
                task_id = %spawned.task.id,
                queue = %task.queue_name,
                idempotency_key = task.idempotency_key.as_deref().unwrap_or(""),
                "spawn matched an existing task"
            );
        }
        Ok(spawned.outcome())
    }

    pub async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>> {
        self.store.get_task(task_id).await
    }

    pub async fn list_tasks(&self, filter: &TaskFilter) -> Result<TaskPage> {
        self.store.list_tasks(filter).await
    }

    pub async fn claim(&self, queue: &str, worker_id: &str) -> Result<Option<Task>> {
        let claimed = self.store.claim(queue, worker_id).await?;
        if let Some(task) = &claimed {
            self.notify(task);
        }
        Ok(claimed)
    }

    pub async fn heartbeat(&self, task_id: Uuid, worker_id: &str) -> Result<bool> {
        self.store.heartbeat(task_id, worker_id).await
    }

    pub async fn complete(
        &self,
        task_id: Uuid,
        worker_id: Option<&str>,
        result: Value,
    ) -> Result<Task> {
        let task = self.store.complete(task_id, worker_id, result).await?;
        self.notify(&task);

        if task.workflow_id.is_some() {
            // The task is durably completed; a lost release is repaired by
            // the reaper's sweep.
            match self.resolver.on_task_completed(&task).await {
                Ok(released) => self.notify_all(&released),
                Err(e) => warn!(task_id = %task.id, error = %e, "workflow release failed"),
            }
        }
        Ok(task)
    }

    pub async fn fail(&self, task_id: Uuid, worker_id: Option<&str>, error: &str) -> Result<Task> {
        let applied = self.store.fail(task_id, worker_id, error).await?;
        self.notify(&applied.task);
        if let Some(copy) = &applied.dead_letter {
            self.notify(copy);
        }

        self.after_terminal(&applied.task).await;
        Ok(applied.task)
    }

    pub async fn cancel(&self, task_id: Uuid) -> Result<Task> {
        let task = self.store.cancel(task_id).await?;
        self.notify(&task);
        self.after_terminal(&task).await;
        Ok(task)
    }

    /// Downstream cascade for a workflow member that can no longer complete.
    async fn after_terminal(&self, task: &Task) {
        if task.workflow_id.is_none()
            || !matches!(task.status, TaskStatus::Failed | TaskStatus::Cancelled)
        {
            return;
        }
        match self.resolver.on_task_failed(task).await {
            Ok(cancelled) => self.notify_all(&cancelled),
            Err(e) => warn!(task_id = %task.id, error = %e, "workflow cascade failed"),
        }
    }

    /// Reaps abandoned claims. Returns the reaped tasks in their new state.
    pub async fn reap_abandoned(&self, grace_sec: i32, limit: i64) -> Result<Vec<Task>> {
        let reaped = self.store.reap_abandoned(grace_sec, limit).await?;

        let mut out = Vec::with_capacity(reaped.len());
        for applied in reaped {
            self.notify(&applied.task);
            if let Some(copy) = &applied.dead_letter {
                self.notify(copy);
            }
            self.after_terminal(&applied.task).await;
            out.push(applied.task);
        }
        Ok(out)
    }

    pub async fn replay(&self, task_id: Uuid) -> Result<Task> {
        let task = self.store.replay(task_id).await?;
        self.notify(&task);
        Ok(task)
    }

    pub async fn queue_stats(&self, queue: &str) -> Result<QueueStats> {
        self.store.queue_stats(queue).await
    }

    pub async fn set_dead_letter(&self, queue: &str, enabled: bool) -> Result<()> {
        self.store.set_dead_letter(queue, enabled).await
    }

    // ----------------------------
    // Workflows
    // ----------------------------

    pub async fn create_workflow(
        &self,
        name: &str,
        tasks: &[WorkflowTaskSpec],
        edges: &[DependencyEdge],
    ) -> Result<WorkflowCreated> {
        let created = self.store.create_workflow(name, tasks, edges).await?;

        let graph = self.store.workflow_graph(created.workflow_id).await?;
        self.notify_all(&graph.tasks);

        info!(
            workflow_id = %created.workflow_id,
            name,
            tasks = created.task_ids.len(),
            edges = edges.len(),
            "workflow created"
        );
        Ok(created)
    }

    pub async fn get_ready_tasks(&self, workflow_id: Uuid) -> Result<Vec<Uuid>> {
        self.resolver.get_ready_tasks(workflow_id).await
    }

    pub async fn workflow_status(&self, workflow_id: Uuid) -> Result<WorkflowStatus> {
        let graph = self.store.workflow_graph(workflow_id).await?;
        Ok(status_of(graph))
    }

    pub async fn list_workflows(&self, limit: i64) -> Result<Vec<Workflow>> {
        self.store.list_workflows(limit).await
    }

    /// Newest-first statuses, optionally only those in `state`. The filter
    /// applies to the derived state, so it scans the newest
    /// `WORKFLOW_SCAN_LIMIT` workflows.
    pub async fn list_workflow_statuses(
        &self,
        state: Option<WorkflowState>,
        limit: i64,
    ) -> Result<Vec<WorkflowStatus>> {
        let limit = limit.clamp(1, WORKFLOW_SCAN_LIMIT) as usize;
        let scan = if state.is_some() {
            WORKFLOW_SCAN_LIMIT
        } else {
            limit as i64
        };

        let mut out = Vec::new();
        for wf in self.store.list_workflows(scan).await? {
            let status = match self.store.workflow_graph(wf.id).await {
                Ok(graph) => status_of(graph),
                Err(EngineError::WorkflowNotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            if state.map_or(true, |s| s == status.state) {
                out.push(status);
                if out.len() == limit {
                    break;
                }
            }
        }
        Ok(out)
    }

    pub async fn sweep_workflows(&self, limit: i64) -> Result<SweepReport> {
        let report = self.resolver.sweep(limit).await?;
        self.notify_all(&report.cancelled);
        self.notify_all(&report.released);
        Ok(report)
    }

    // ----------------------------
    // Schedules
    // ----------------------------

    pub async fn create_schedule(&self, spec: &ScheduleSpec) -> Result<Schedule> {
        let schedule = self.store.create_schedule(spec).await?;
        info!(
            schedule = %schedule.name,
            cron = %schedule.cron_expression,
            next_run_at = ?schedule.next_run_at,
            "schedule created"
        );
        Ok(schedule)
    }

    pub async fn update_schedule(&self, name: &str, update: &ScheduleUpdate) -> Result<Schedule> {
        self.store.update_schedule(name, update).await
    }

    pub async fn delete_schedule(&self, name: &str) -> Result<bool> {
        self.store.delete_schedule(name).await
    }

    pub async fn get_schedule(&self, name: &str) -> Result<Option<Schedule>> {
        self.store.get_schedule(name).await
    }

    pub async fn list_schedules(&self) -> Result<Vec<Schedule>> {
        self.store.list_schedules().await
    }

    pub async fn trigger_now(&self, name: &str) -> Result<ScheduleFired> {
        let fired = self.store.trigger_now(name).await?;
        self.notify_spawned(&fired).await?;
        Ok(fired)
    }

    pub async fn fire_due_schedules(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ScheduleFired>> {
        let fired = self.store.fire_due(now, limit).await?;
        for f in &fired {
            self.notify_spawned(f).await?;
        }
        Ok(fired)
    }

    async fn notify_spawned(&self, fired: &ScheduleFired) -> Result<()> {
        if !fired.created {
            return Ok(());
        }
        let task = self
            .store
            .get_task(fired.task_id)
            .await?
            .ok_or(EngineError::TaskNotFound(fired.task_id))?;
        self.notify(&task);
        Ok(())
    }
}

const WORKFLOW_SCAN_LIMIT: i64 = 500;

fn status_of(graph: WorkflowGraph) -> WorkflowStatus {
    let counts = dag::counts(&graph.tasks);
    WorkflowStatus {
        workflow_id: graph.workflow.id,
        name: graph.workflow.name,
        created_at: graph.workflow.created_at,
        state: dag::aggregate_state(&graph.tasks),
        progress: counts.progress(),
        counts,
        tasks: graph
            .tasks
            .iter()
            .map(|t| WorkflowTaskStatus {
                task_id: t.id,
                task_name: t.task_name.clone(),
                queue_name: t.queue_name.clone(),
                status: t.status,
                held: t.held,
            })
            .collect(),
    }
}

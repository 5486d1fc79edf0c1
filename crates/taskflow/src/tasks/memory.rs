//! In-process store: one mutex around every table, so each trait method
//! is a single critical section. Timestamps come from the injected clock.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::error::{EngineError, Result};
use crate::schedules::{CronExpr, Schedule, ScheduleFired, ScheduleSpec, ScheduleUpdate};
use crate::tasks::model::{
    dead_letter_queue, NewTask, QueueStats, Task, TaskFilter, TaskPage, TaskStatus,
};
use crate::tasks::retry::{backoff_delay, decide_outcome, Outcome, RetryConfig};
use crate::tasks::store::{
    FailureApplied, ScheduleStore, Spawned, TaskStore, WorkflowStore, ABANDONED_ERROR,
};
use crate::workflows::dag;
use crate::workflows::{DependencyEdge, Workflow, WorkflowCreated, WorkflowGraph, WorkflowTaskSpec};

struct Row {
    /// Insertion order; breaks `created_at` ties.
    seq: u64,
    task: Task,
}

#[derive(Default)]
struct Tables {
    next_seq: u64,
    tasks: HashMap<Uuid, Row>,
    workflows: HashMap<Uuid, Workflow>,
    /// (workflow_id, task_id, depends_on_task_id)
    edges: Vec<(Uuid, Uuid, Uuid)>,
    dead_letter: HashMap<String, bool>,
    schedules: BTreeMap<String, Schedule>,
}

impl Tables {
    fn get(&self, id: Uuid) -> Result<&Task> {
        self.tasks
            .get(&id)
            .map(|r| &r.task)
            .ok_or(EngineError::TaskNotFound(id))
    }

    fn get_mut(&mut self, id: Uuid) -> Result<&mut Task> {
        self.tasks
            .get_mut(&id)
            .map(|r| &mut r.task)
            .ok_or(EngineError::TaskNotFound(id))
    }

    fn insert(&mut self, task: Task) -> Task {
        self.next_seq += 1;
        let seq = self.next_seq;
        self.tasks.insert(
            task.id,
            Row {
                seq,
                task: task.clone(),
            },
        );
        task
    }

    fn live_by_key(&self, queue: &str, key: &str) -> Option<&Task> {
        self.tasks.values().map(|r| &r.task).find(|t| {
            t.queue_name == queue
                && t.idempotency_key.as_deref() == Some(key)
                && !t.status.is_terminal()
        })
    }

    fn spawn(&mut self, new: &NewTask, now: DateTime<Utc>) -> Spawned {
        if let Some(key) = new.idempotency_key.as_deref() {
            if let Some(existing) = self.live_by_key(&new.queue_name, key) {
                return Spawned {
                    task: existing.clone(),
                    created: false,
                };
            }
        }

        let task = self.insert(blank_task(new, now));
        Spawned {
            task,
            created: true,
        }
    }

    fn dead_letter_enabled(&self, queue: &str, default: bool) -> bool {
        self.dead_letter.get(queue).copied().unwrap_or(default)
    }

    fn predecessors_completed(&self, task_id: Uuid) -> bool {
        self.edges
            .iter()
            .filter(|(_, t, _)| *t == task_id)
            .all(|(_, _, up)| {
                self.tasks
                    .get(up)
                    .map_or(false, |r| r.task.status == TaskStatus::Completed)
            })
    }
}

fn blank_task(new: &NewTask, now: DateTime<Utc>) -> Task {
    Task {
        id: Uuid::new_v4(),
        queue_name: new.queue_name.clone(),
        task_name: new.task_name.clone(),
        params: new.params.clone(),
        priority: new.priority,
        status: TaskStatus::Pending,
        attempt: 0,
        max_retries: new.max_retries.max(0),
        worker_id: None,
        result: None,
        error: None,
        timeout_sec: new.timeout_sec,
        idempotency_key: new.idempotency_key.clone(),
        retry_at: None,
        heartbeat_at: None,
        execution_time_sec: None,
        wait_time_sec: None,
        workflow_id: None,
        held: false,
        dead_letter_of: None,
        replay_of: None,
        created_at: now,
        claimed_at: None,
        completed_at: None,
        updated_at: now,
    }
}

fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / 1000.0
}

fn check_owner(task: &Task, worker_id: Option<&str>, expected: &'static str) -> Result<()> {
    if task.status != TaskStatus::Claimed {
        return Err(EngineError::InvalidTransition {
            task_id: task.id,
            status: task.status,
            expected,
        });
    }
    if let Some(w) = worker_id {
        if task.worker_id.as_deref() != Some(w) {
            return Err(EngineError::NotOwner {
                task_id: task.id,
                worker_id: w.to_string(),
            });
        }
    }
    Ok(())
}

pub struct MemoryStore {
    tables: Mutex<Tables>,
    clock: Arc<dyn Clock>,
    retry: RetryConfig,
}

impl MemoryStore {
    pub fn new(retry: RetryConfig) -> Self {
        Self::with_clock(retry, Arc::new(SystemClock))
    }

    pub fn with_clock(retry: RetryConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            clock,
            retry,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Retry-or-fail for a claimed task. `reaped` claims go straight back
    /// to `pending`; worker failures wait out the backoff in `retrying`.
    fn apply_failure(
        &self,
        tables: &mut Tables,
        task_id: Uuid,
        error: &str,
        reaped: bool,
        now: DateTime<Utc>,
    ) -> Result<FailureApplied> {
        let task = tables.get_mut(task_id)?;
        task.error = Some(error.to_string());
        task.result = None;
        task.worker_id = None;
        task.heartbeat_at = None;
        task.updated_at = now;

        match decide_outcome(task.attempt, task.max_retries) {
            Outcome::Retry { attempt } => {
                task.attempt = attempt;
                task.claimed_at = None;
                if reaped {
                    task.status = TaskStatus::Pending;
                    task.retry_at = None;
                } else {
                    let delay = backoff_delay(attempt, &self.retry, &mut rand::thread_rng());
                    let delay = Duration::from_std(delay).unwrap_or_else(|_| Duration::zero());
                    task.status = TaskStatus::Retrying;
                    task.retry_at = Some(now + delay);
                }
                Ok(FailureApplied {
                    task: task.clone(),
                    dead_letter: None,
                })
            }
            Outcome::Fail => {
                task.status = TaskStatus::Failed;
                task.completed_at = Some(now);
                let failed = task.clone();

                let dead_letter = if tables
                    .dead_letter_enabled(&failed.queue_name, self.retry.dead_letter_default)
                {
                    let mut copy = blank_task(
                        &NewTask {
                            queue_name: dead_letter_queue(&failed.queue_name),
                            task_name: failed.task_name.clone(),
                            params: failed.params.clone(),
                            priority: failed.priority,
                            max_retries: failed.max_retries,
                            timeout_sec: failed.timeout_sec,
                            idempotency_key: None,
                        },
                        now,
                    );
                    copy.status = TaskStatus::Failed;
                    copy.attempt = failed.attempt;
                    copy.error = failed.error.clone();
                    copy.dead_letter_of = Some(failed.id);
                    copy.completed_at = Some(now);
                    Some(tables.insert(copy))
                } else {
                    None
                };

                Ok(FailureApplied {
                    task: failed,
                    dead_letter,
                })
            }
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn now(&self) -> Result<DateTime<Utc>> {
        Ok(self.clock.now())
    }

    async fn spawn(&self, task: &NewTask) -> Result<Spawned> {
        let now = self.clock.now();
        Ok(self.lock().spawn(task, now))
    }

    async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>> {
        Ok(self.lock().tasks.get(&task_id).map(|r| r.task.clone()))
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<TaskPage> {
        let tables = self.lock();
        let mut rows: Vec<&Row> = tables
            .tasks
            .values()
            .filter(|r| filter.matches(&r.task))
            .collect();
        rows.sort_by(|a, b| {
            b.task
                .created_at
                .cmp(&a.task.created_at)
                .then(b.seq.cmp(&a.seq))
        });

        let total = rows.len() as i64;
        let tasks = rows
            .into_iter()
            .skip(filter.clamped_offset() as usize)
            .take(filter.clamped_limit() as usize)
            .map(|r| r.task.clone())
            .collect();

        Ok(TaskPage { tasks, total })
    }

    async fn claim(&self, queue: &str, worker_id: &str) -> Result<Option<Task>> {
        let now = self.clock.now();
        let mut tables = self.lock();

        let next = tables
            .tasks
            .values()
            .filter(|r| {
                let t = &r.task;
                t.queue_name == queue
                    && !t.held
                    && match t.status {
                        TaskStatus::Pending => true,
                        TaskStatus::Retrying => t.retry_at.map_or(true, |at| at <= now),
                        _ => false,
                    }
            })
            .min_by(|a, b| {
                b.task
                    .priority
                    .cmp(&a.task.priority)
                    .then(a.task.created_at.cmp(&b.task.created_at))
                    .then(a.seq.cmp(&b.seq))
            })
            .map(|r| r.task.id);

        let Some(id) = next else {
            return Ok(None);
        };

        let task = tables.get_mut(id)?;
        task.status = TaskStatus::Claimed;
        task.worker_id = Some(worker_id.to_string());
        task.claimed_at = Some(now);
        task.heartbeat_at = None;
        task.retry_at = None;
        task.updated_at = now;

        Ok(Some(task.clone()))
    }

    async fn heartbeat(&self, task_id: Uuid, worker_id: &str) -> Result<bool> {
        let now = self.clock.now();
        let mut tables = self.lock();
        let task = tables.get_mut(task_id)?;

        if task.status != TaskStatus::Claimed || task.worker_id.as_deref() != Some(worker_id) {
            return Ok(false);
        }
        task.heartbeat_at = Some(now);
        task.updated_at = now;
        Ok(true)
    }

    async fn complete(
        &self,
        task_id: Uuid,
        worker_id: Option<&str>,
        result: Value,
    ) -> Result<Task> {
        let now = self.clock.now();
        let mut tables = self.lock();
        let task = tables.get_mut(task_id)?;
        check_owner(task, worker_id, "claimed")?;

        let claimed_at = task.claimed_at.unwrap_or(now);
        task.status = TaskStatus::Completed;
        task.result = Some(result);
        task.error = None;
        task.worker_id = None;
        task.completed_at = Some(now);
        task.execution_time_sec = Some(seconds_between(claimed_at, now));
        task.wait_time_sec = Some(seconds_between(task.created_at, claimed_at));
        task.updated_at = now;

        Ok(task.clone())
    }

    async fn fail(
        &self,
        task_id: Uuid,
        worker_id: Option<&str>,
        error: &str,
    ) -> Result<FailureApplied> {
        let now = self.clock.now();
        let mut tables = self.lock();
        check_owner(tables.get(task_id)?, worker_id, "claimed")?;
        self.apply_failure(&mut tables, task_id, error, false, now)
    }

    async fn cancel(&self, task_id: Uuid) -> Result<Task> {
        let now = self.clock.now();
        let mut tables = self.lock();
        let task = tables.get_mut(task_id)?;

        if !matches!(task.status, TaskStatus::Pending | TaskStatus::Retrying) {
            return Err(EngineError::InvalidTransition {
                task_id,
                status: task.status,
                expected: "pending or retrying",
            });
        }
        task.status = TaskStatus::Cancelled;
        task.retry_at = None;
        task.completed_at = Some(now);
        task.updated_at = now;

        Ok(task.clone())
    }

    async fn reap_abandoned(&self, grace_sec: i32, limit: i64) -> Result<Vec<FailureApplied>> {
        let now = self.clock.now();
        let mut tables = self.lock();

        let mut stale: Vec<(DateTime<Utc>, Uuid)> = tables
            .tasks
            .values()
            .map(|r| &r.task)
            .filter(|t| t.status == TaskStatus::Claimed)
            .filter_map(|t| {
                let last_seen = t.heartbeat_at.or(t.claimed_at)?;
                let window = Duration::seconds(i64::from(t.timeout_sec.unwrap_or(grace_sec)));
                (now - last_seen > window).then_some((t.claimed_at.unwrap_or(last_seen), t.id))
            })
            .collect();
        stale.sort();
        stale.truncate(limit.max(0) as usize);

        stale
            .into_iter()
            .map(|(_, id)| self.apply_failure(&mut tables, id, ABANDONED_ERROR, true, now))
            .collect()
    }

    async fn replay(&self, task_id: Uuid) -> Result<Task> {
        let now = self.clock.now();
        let mut tables = self.lock();
        let source = tables.get(task_id)?.clone();

        if !matches!(source.status, TaskStatus::Failed | TaskStatus::Cancelled) {
            return Err(EngineError::InvalidTransition {
                task_id,
                status: source.status,
                expected: "failed or cancelled",
            });
        }

        let queue = replay_queue(&source);
        let mut task = blank_task(
            &NewTask {
                queue_name: queue,
                task_name: source.task_name.clone(),
                params: source.params.clone(),
                priority: source.priority,
                max_retries: source.max_retries,
                timeout_sec: source.timeout_sec,
                idempotency_key: None,
            },
            now,
        );
        task.replay_of = Some(task_id);

        Ok(tables.insert(task))
    }

    async fn queue_stats(&self, queue: &str) -> Result<QueueStats> {
        let tables = self.lock();
        let mut stats = QueueStats::empty(queue);
        for t in tables.tasks.values().map(|r| &r.task) {
            if t.queue_name == queue {
                stats.add(t.status, 1);
            }
        }
        Ok(stats)
    }

    async fn set_dead_letter(&self, queue: &str, enabled: bool) -> Result<()> {
        self.lock().dead_letter.insert(queue.to_string(), enabled);
        Ok(())
    }
}

/// Dead-letter copies replay into the queue they were copied from.
pub(crate) fn replay_queue(task: &Task) -> String {
    if task.dead_letter_of.is_some() {
        if let Some(original) = task.queue_name.strip_suffix("-dlq") {
            return original.to_string();
        }
    }
    task.queue_name.clone()
}

#[async_trait]
impl WorkflowStore for MemoryStore {
    async fn create_workflow(
        &self,
        name: &str,
        tasks: &[WorkflowTaskSpec],
        edges: &[DependencyEdge],
    ) -> Result<WorkflowCreated> {
        dag::validate(tasks, edges)?;

        let now = self.clock.now();
        let mut tables = self.lock();

        let workflow = Workflow {
            id: Uuid::new_v4(),
            name: name.to_string(),
            created_at: now,
        };
        let dependents: HashSet<&str> = edges.iter().map(|e| e.task.as_str()).collect();

        let mut task_ids = BTreeMap::new();
        for spec in tasks {
            let mut task = blank_task(&spec.to_new_task(), now);
            task.workflow_id = Some(workflow.id);
            task.held = dependents.contains(spec.key.as_str());
            task_ids.insert(spec.key.clone(), tables.insert(task).id);
        }

        for e in edges {
            tables
                .edges
                .push((workflow.id, task_ids[&e.task], task_ids[&e.depends_on]));
        }
        tables.workflows.insert(workflow.id, workflow.clone());

        Ok(WorkflowCreated {
            workflow_id: workflow.id,
            task_ids,
        })
    }

    async fn workflow_graph(&self, workflow_id: Uuid) -> Result<WorkflowGraph> {
        let tables = self.lock();
        let workflow = tables
            .workflows
            .get(&workflow_id)
            .cloned()
            .ok_or(EngineError::WorkflowNotFound(workflow_id))?;

        let mut rows: Vec<&Row> = tables
            .tasks
            .values()
            .filter(|r| r.task.workflow_id == Some(workflow_id))
            .collect();
        rows.sort_by_key(|r| r.seq);

        Ok(WorkflowGraph {
            workflow,
            tasks: rows.into_iter().map(|r| r.task.clone()).collect(),
            edges: tables
                .edges
                .iter()
                .filter(|(w, _, _)| *w == workflow_id)
                .map(|(_, t, up)| (*t, *up))
                .collect(),
        })
    }

    async fn list_workflows(&self, limit: i64) -> Result<Vec<Workflow>> {
        let tables = self.lock();
        let mut all: Vec<Workflow> = tables.workflows.values().cloned().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        all.truncate(limit.clamp(1, 500) as usize);
        Ok(all)
    }

    async fn release_ready(&self, workflow_id: Uuid, candidates: &[Uuid]) -> Result<Vec<Task>> {
        let now = self.clock.now();
        let mut tables = self.lock();
        let mut released = Vec::new();

        for id in candidates {
            let eligible = tables.tasks.get(id).map_or(false, |r| {
                r.task.workflow_id == Some(workflow_id)
                    && r.task.held
                    && r.task.status == TaskStatus::Pending
            });
            if !eligible || !tables.predecessors_completed(*id) {
                continue;
            }

            let task = tables.get_mut(*id)?;
            task.held = false;
            task.updated_at = now;
            released.push(task.clone());
        }

        Ok(released)
    }

    async fn active_workflows(&self, limit: i64) -> Result<Vec<Uuid>> {
        let tables = self.lock();
        let ids: HashSet<Uuid> = tables
            .tasks
            .values()
            .map(|r| &r.task)
            .filter(|t| t.held && t.status == TaskStatus::Pending)
            .filter_map(|t| t.workflow_id)
            .collect();
        Ok(ids.into_iter().take(limit.max(0) as usize).collect())
    }
}

#[async_trait]
impl ScheduleStore for MemoryStore {
    async fn create_schedule(&self, spec: &ScheduleSpec) -> Result<Schedule> {
        let cron = CronExpr::parse(&spec.cron_expression)?;
        let now = self.clock.now();
        let mut tables = self.lock();

        if tables.schedules.contains_key(&spec.name) {
            return Err(EngineError::ScheduleExists(spec.name.clone()));
        }

        let schedule = Schedule {
            id: Uuid::new_v4(),
            name: spec.name.clone(),
            cron_expression: cron.as_str().to_string(),
            queue_name: spec.queue_name.clone(),
            task_name: spec.task_name.clone(),
            params: spec.params.clone(),
            priority: spec.priority,
            max_retries: spec.max_retries.max(0),
            timeout_sec: spec.timeout_sec,
            enabled: spec.enabled,
            next_run_at: cron.next_after(now),
            last_run_at: None,
            created_at: now,
            updated_at: now,
        };
        tables.schedules.insert(spec.name.clone(), schedule.clone());

        Ok(schedule)
    }

    async fn update_schedule(&self, name: &str, update: &ScheduleUpdate) -> Result<Schedule> {
        let cron = update
            .cron_expression
            .as_deref()
            .map(CronExpr::parse)
            .transpose()?;
        let now = self.clock.now();
        let mut tables = self.lock();

        let schedule = tables
            .schedules
            .get_mut(name)
            .ok_or_else(|| EngineError::ScheduleNotFound(name.to_string()))?;
        let reschedule = update.reschedules(schedule.enabled);

        update.apply(schedule);
        if let Some(cron) = &cron {
            schedule.cron_expression = cron.as_str().to_string();
        }
        if reschedule {
            schedule.next_run_at = CronExpr::parse(&schedule.cron_expression)?.next_after(now);
        }
        schedule.updated_at = now;

        Ok(schedule.clone())
    }

    async fn delete_schedule(&self, name: &str) -> Result<bool> {
        Ok(self.lock().schedules.remove(name).is_some())
    }

    async fn get_schedule(&self, name: &str) -> Result<Option<Schedule>> {
        Ok(self.lock().schedules.get(name).cloned())
    }

    async fn list_schedules(&self) -> Result<Vec<Schedule>> {
        Ok(self.lock().schedules.values().cloned().collect())
    }

    async fn fire_due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<ScheduleFired>> {
        let mut tables = self.lock();

        let mut due: Vec<(DateTime<Utc>, String)> = tables
            .schedules
            .values()
            .filter(|s| s.enabled)
            .filter_map(|s| s.next_run_at.filter(|at| *at <= now).map(|at| (at, s.name.clone())))
            .collect();
        due.sort();
        due.truncate(limit.max(0) as usize);

        let mut fired = Vec::with_capacity(due.len());
        for (due_at, name) in due {
            let Some(schedule) = tables.schedules.get(&name).cloned() else {
                continue;
            };
            let next_run_at = CronExpr::parse(&schedule.cron_expression)?.next_after(now);
            let spawned = tables.spawn(&schedule.task_for(due_at), now);

            if let Some(s) = tables.schedules.get_mut(&name) {
                s.last_run_at = Some(now);
                s.next_run_at = next_run_at;
                s.updated_at = now;
            }

            fired.push(ScheduleFired {
                schedule_name: name,
                task_id: spawned.task.id,
                created: spawned.created,
                fired_at: now,
                next_run_at,
            });
        }

        Ok(fired)
    }

    async fn trigger_now(&self, name: &str) -> Result<ScheduleFired> {
        let now = self.clock.now();
        let mut tables = self.lock();

        let schedule = tables
            .schedules
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::ScheduleNotFound(name.to_string()))?;
        let spawned = tables.spawn(&schedule.template(), now);

        if let Some(s) = tables.schedules.get_mut(name) {
            s.last_run_at = Some(now);
            s.updated_at = now;
        }

        Ok(ScheduleFired {
            schedule_name: name.to_string(),
            task_id: spawned.task.id,
            created: spawned.created,
            fired_at: now,
            next_run_at: schedule.next_run_at,
        })
    }
}

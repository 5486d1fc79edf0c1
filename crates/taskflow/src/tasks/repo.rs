// crates/taskflow/src/tasks/repo.rs

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgConnection, PgPool};
use std::collections::{BTreeMap, HashSet};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::schedules::{CronExpr, Schedule, ScheduleFired, ScheduleSpec, ScheduleUpdate};
use crate::tasks::memory::replay_queue;
use crate::tasks::model::{
    dead_letter_queue, NewTask, QueueStats, Task, TaskFilter, TaskPage, TaskStatus,
};
use crate::tasks::retry::{backoff_delay, decide_outcome, Outcome, RetryConfig};
use crate::tasks::store::{
    FailureApplied, ScheduleStore, Spawned, TaskStore, WorkflowStore, ABANDONED_ERROR,
};
use crate::workflows::dag;
use crate::workflows::{DependencyEdge, Workflow, WorkflowCreated, WorkflowGraph, WorkflowTaskSpec};

/// `tasks` row as stored; `status` is plain text in the table.
#[derive(Debug, sqlx::FromRow)]
struct TaskRow {
    id: Uuid,
    queue_name: String,
    task_name: String,
    params: Value,
    priority: i32,
    status: String,
    attempt: i32,
    max_retries: i32,
    worker_id: Option<String>,
    result: Option<Value>,
    error: Option<String>,
    timeout_sec: Option<i32>,
    idempotency_key: Option<String>,
    retry_at: Option<DateTime<Utc>>,
    heartbeat_at: Option<DateTime<Utc>>,
    execution_time_sec: Option<f64>,
    wait_time_sec: Option<f64>,
    workflow_id: Option<Uuid>,
    held: bool,
    dead_letter_of: Option<Uuid>,
    replay_of: Option<Uuid>,
    created_at: DateTime<Utc>,
    claimed_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<TaskRow> for Task {
    type Error = EngineError;

    fn try_from(r: TaskRow) -> Result<Self> {
        let status = r
            .status
            .parse::<TaskStatus>()
            .map_err(EngineError::Storage)?;

        Ok(Task {
            id: r.id,
            queue_name: r.queue_name,
            task_name: r.task_name,
            params: r.params,
            priority: r.priority,
            status,
            attempt: r.attempt,
            max_retries: r.max_retries,
            worker_id: r.worker_id,
            result: r.result,
            error: r.error,
            timeout_sec: r.timeout_sec,
            idempotency_key: r.idempotency_key,
            retry_at: r.retry_at,
            heartbeat_at: r.heartbeat_at,
            execution_time_sec: r.execution_time_sec,
            wait_time_sec: r.wait_time_sec,
            workflow_id: r.workflow_id,
            held: r.held,
            dead_letter_of: r.dead_letter_of,
            replay_of: r.replay_of,
            created_at: r.created_at,
            claimed_at: r.claimed_at,
            completed_at: r.completed_at,
            updated_at: r.updated_at,
        })
    }
}

fn into_tasks(rows: Vec<TaskRow>) -> Result<Vec<Task>> {
    rows.into_iter().map(Task::try_from).collect()
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    retry: RetryConfig,
}

impl PgStore {
    pub fn new(pool: PgPool, retry: RetryConfig) -> Self {
        Self { pool, retry }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Turns a conditional UPDATE that matched nothing into the reason.
    async fn explain_miss(
        &self,
        task_id: Uuid,
        worker_id: Option<&str>,
        expected: &'static str,
    ) -> EngineError {
        let task = match self.get_task(task_id).await {
            Ok(Some(t)) => t,
            Ok(None) => return EngineError::TaskNotFound(task_id),
            Err(e) => return e,
        };

        let status_ok = match expected {
            "claimed" => task.status == TaskStatus::Claimed,
            _ => matches!(task.status, TaskStatus::Pending | TaskStatus::Retrying),
        };
        if status_ok {
            if let Some(w) = worker_id {
                return EngineError::NotOwner {
                    task_id,
                    worker_id: w.to_string(),
                };
            }
        }

        EngineError::InvalidTransition {
            task_id,
            status: task.status,
            expected,
        }
    }
}

// ----------------------------
// Shared statements (run on a caller's connection or transaction)
// ----------------------------

async fn insert_task(conn: &mut PgConnection, task: &NewTask) -> Result<Spawned> {
    // The existing live row can turn terminal between the insert and the
    // lookup; one more round settles it.
    for _ in 0..3 {
        let inserted = sqlx::query_as::<_, TaskRow>(
            r#"
            INSERT INTO tasks (queue_name, task_name, params, priority, max_retries, timeout_sec, idempotency_key)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (queue_name, idempotency_key)
                WHERE idempotency_key IS NOT NULL AND status IN ('pending', 'claimed', 'retrying')
                DO NOTHING
            RETURNING *
            "#,
        )
        .bind(&task.queue_name)
        .bind(&task.task_name)
        .bind(&task.params)
        .bind(task.priority)
        .bind(task.max_retries.max(0))
        .bind(task.timeout_sec)
        .bind(&task.idempotency_key)
        .fetch_optional(&mut *conn)
        .await?;

        if let Some(row) = inserted {
            return Ok(Spawned {
                task: row.try_into()?,
                created: true,
            });
        }

        let existing = sqlx::query_as::<_, TaskRow>(
            r#"
            SELECT *
            FROM tasks
            WHERE queue_name = $1
              AND idempotency_key = $2
              AND status IN ('pending', 'claimed', 'retrying')
            "#,
        )
        .bind(&task.queue_name)
        .bind(&task.idempotency_key)
        .fetch_optional(&mut *conn)
        .await?;

        if let Some(row) = existing {
            return Ok(Spawned {
                task: row.try_into()?,
                created: false,
            });
        }
    }

    Err(EngineError::Storage(format!(
        "idempotency key {:?} kept changing state during spawn",
        task.idempotency_key
    )))
}

async fn dead_letter_enabled(conn: &mut PgConnection, queue: &str, default: bool) -> Result<bool> {
    let enabled: Option<bool> =
        sqlx::query_scalar("SELECT dead_letter FROM queue_policies WHERE queue_name = $1")
            .bind(queue)
            .fetch_optional(&mut *conn)
            .await?;
    Ok(enabled.unwrap_or(default))
}

/// Applies the retry decision to a claimed row the caller has locked.
async fn apply_failure(
    conn: &mut PgConnection,
    retry: &RetryConfig,
    task: &Task,
    error: &str,
    reaped: bool,
) -> Result<FailureApplied> {
    match decide_outcome(task.attempt, task.max_retries) {
        Outcome::Retry { attempt } if reaped => {
            let row = sqlx::query_as::<_, TaskRow>(
                r#"
                UPDATE tasks
                SET status = 'pending',
                    attempt = $2,
                    error = $3,
                    result = NULL,
                    worker_id = NULL,
                    claimed_at = NULL,
                    heartbeat_at = NULL,
                    retry_at = NULL,
                    updated_at = now()
                WHERE id = $1
                RETURNING *
                "#,
            )
            .bind(task.id)
            .bind(attempt)
            .bind(error)
            .fetch_one(&mut *conn)
            .await?;

            Ok(FailureApplied {
                task: row.try_into()?,
                dead_letter: None,
            })
        }
        Outcome::Retry { attempt } => {
            let delay = backoff_delay(attempt, retry, &mut rand::thread_rng());

            let row = sqlx::query_as::<_, TaskRow>(
                r#"
                UPDATE tasks
                SET status = 'retrying',
                    attempt = $2,
                    error = $3,
                    result = NULL,
                    worker_id = NULL,
                    claimed_at = NULL,
                    heartbeat_at = NULL,
                    retry_at = now() + ($4::float8 * interval '1 second'),
                    updated_at = now()
                WHERE id = $1
                RETURNING *
                "#,
            )
            .bind(task.id)
            .bind(attempt)
            .bind(error)
            .bind(delay.as_secs_f64())
            .fetch_one(&mut *conn)
            .await?;

            Ok(FailureApplied {
                task: row.try_into()?,
                dead_letter: None,
            })
        }
        Outcome::Fail => {
            let failed: Task = sqlx::query_as::<_, TaskRow>(
                r#"
                UPDATE tasks
                SET status = 'failed',
                    error = $2,
                    result = NULL,
                    worker_id = NULL,
                    heartbeat_at = NULL,
                    completed_at = now(),
                    updated_at = now()
                WHERE id = $1
                RETURNING *
                "#,
            )
            .bind(task.id)
            .bind(error)
            .fetch_one(&mut *conn)
            .await?
            .try_into()?;

            let dead_letter =
                if dead_letter_enabled(conn, &failed.queue_name, retry.dead_letter_default).await? {
                    let row = sqlx::query_as::<_, TaskRow>(
                        r#"
                        INSERT INTO tasks (
                            queue_name, task_name, params, priority, status,
                            attempt, max_retries, error, timeout_sec,
                            dead_letter_of, completed_at
                        )
                        VALUES ($1, $2, $3, $4, 'failed', $5, $6, $7, $8, $9, now())
                        RETURNING *
                        "#,
                    )
                    .bind(dead_letter_queue(&failed.queue_name))
                    .bind(&failed.task_name)
                    .bind(&failed.params)
                    .bind(failed.priority)
                    .bind(failed.attempt)
                    .bind(failed.max_retries)
                    .bind(&failed.error)
                    .bind(failed.timeout_sec)
                    .bind(failed.id)
                    .fetch_one(&mut *conn)
                    .await?;
                    Some(row.try_into()?)
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

#[async_trait]
impl TaskStore for PgStore {
    async fn now(&self) -> Result<DateTime<Utc>> {
        let now: DateTime<Utc> = sqlx::query_scalar("SELECT now()")
            .fetch_one(&self.pool)
            .await?;
        Ok(now)
    }

    async fn spawn(&self, task: &NewTask) -> Result<Spawned> {
        let mut conn = self.pool.acquire().await?;
        insert_task(&mut conn, task).await
    }

    async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>> {
        let row = sqlx::query_as::<_, TaskRow>("SELECT * FROM tasks WHERE id = $1")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Task::try_from).transpose()
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<TaskPage> {
        let status = filter.status.map(|s| s.as_str());

        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM tasks
            WHERE ($1::text IS NULL OR queue_name = $1)
              AND ($2::text IS NULL OR status = $2)
              AND ($3::text IS NULL OR task_name = $3)
            "#,
        )
        .bind(&filter.queue_name)
        .bind(status)
        .bind(&filter.task_name)
        .fetch_one(&self.pool)
        .await?;

        let rows = sqlx::query_as::<_, TaskRow>(
            r#"
            SELECT *
            FROM tasks
            WHERE ($1::text IS NULL OR queue_name = $1)
              AND ($2::text IS NULL OR status = $2)
              AND ($3::text IS NULL OR task_name = $3)
            ORDER BY created_at DESC, id DESC
            LIMIT $4 OFFSET $5
            "#,
        )
        .bind(&filter.queue_name)
        .bind(status)
        .bind(&filter.task_name)
        .bind(filter.clamped_limit())
        .bind(filter.clamped_offset())
        .fetch_all(&self.pool)
        .await?;

        Ok(TaskPage {
            tasks: into_tasks(rows)?,
            total,
        })
    }

    // ----------------------------
    // Claim
    // ----------------------------

    /// One eligible task, locked with SKIP LOCKED so concurrent claimers
    /// never wait on (or receive) the same row.
    async fn claim(&self, queue: &str, worker_id: &str) -> Result<Option<Task>> {
        let row = sqlx::query_as::<_, TaskRow>(
            r#"
            WITH next AS (
                SELECT id
                FROM tasks
                WHERE queue_name = $1
                  AND NOT held
                  AND (
                        status = 'pending'
                     OR (status = 'retrying' AND (retry_at IS NULL OR retry_at <= now()))
                  )
                ORDER BY priority DESC, created_at ASC, id ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            UPDATE tasks t
            SET status = 'claimed',
                worker_id = $2,
                claimed_at = now(),
                heartbeat_at = NULL,
                retry_at = NULL,
                updated_at = now()
            FROM next
            WHERE t.id = next.id
            RETURNING t.*
            "#,
        )
        .bind(queue)
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Task::try_from).transpose()
    }

    async fn heartbeat(&self, task_id: Uuid, worker_id: &str) -> Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE tasks
            SET heartbeat_at = now(),
                updated_at = now()
            WHERE id = $1
              AND status = 'claimed'
              AND worker_id = $2
            "#,
        )
        .bind(task_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() > 0)
    }

    // ----------------------------
    // State transitions
    // ----------------------------

    async fn complete(
        &self,
        task_id: Uuid,
        worker_id: Option<&str>,
        result: Value,
    ) -> Result<Task> {
        let row = sqlx::query_as::<_, TaskRow>(
            r#"
            UPDATE tasks
            SET status = 'completed',
                result = $2,
                error = NULL,
                worker_id = NULL,
                completed_at = now(),
                execution_time_sec = EXTRACT(EPOCH FROM (now() - claimed_at))::float8,
                wait_time_sec = EXTRACT(EPOCH FROM (claimed_at - created_at))::float8,
                updated_at = now()
            WHERE id = $1
              AND status = 'claimed'
              AND ($3::text IS NULL OR worker_id = $3)
            RETURNING *
            "#,
        )
        .bind(task_id)
        .bind(&result)
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row.try_into(),
            None => Err(self.explain_miss(task_id, worker_id, "claimed").await),
        }
    }

    async fn fail(
        &self,
        task_id: Uuid,
        worker_id: Option<&str>,
        error: &str,
    ) -> Result<FailureApplied> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, TaskRow>("SELECT * FROM tasks WHERE id = $1 FOR UPDATE")
            .bind(task_id)
            .fetch_optional(&mut *tx)
            .await?;
        let task: Task = row
            .ok_or(EngineError::TaskNotFound(task_id))?
            .try_into()?;

        if task.status != TaskStatus::Claimed {
            return Err(EngineError::InvalidTransition {
                task_id,
                status: task.status,
                expected: "claimed",
            });
        }
        if let Some(w) = worker_id {
            if task.worker_id.as_deref() != Some(w) {
                return Err(EngineError::NotOwner {
                    task_id,
                    worker_id: w.to_string(),
                });
            }
        }

        let applied = apply_failure(&mut tx, &self.retry, &task, error, false).await?;
        tx.commit().await?;

        Ok(applied)
    }

    async fn cancel(&self, task_id: Uuid) -> Result<Task> {
        let row = sqlx::query_as::<_, TaskRow>(
            r#"
            UPDATE tasks
            SET status = 'cancelled',
                retry_at = NULL,
                completed_at = now(),
                updated_at = now()
            WHERE id = $1
              AND status IN ('pending', 'retrying')
            RETURNING *
            "#,
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row.try_into(),
            None => Err(self.explain_miss(task_id, None, "pending or retrying").await),
        }
    }

    // ----------------------------
    // Reaper
    // ----------------------------

    async fn reap_abandoned(&self, grace_sec: i32, limit: i64) -> Result<Vec<FailureApplied>> {
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query_as::<_, TaskRow>(
            r#"
            SELECT *
            FROM tasks
            WHERE status = 'claimed'
              AND COALESCE(heartbeat_at, claimed_at)
                  < now() - (COALESCE(timeout_sec, $1::int) * interval '1 second')
            ORDER BY claimed_at ASC
            FOR UPDATE SKIP LOCKED
            LIMIT $2
            "#,
        )
        .bind(grace_sec)
        .bind(limit.max(0))
        .fetch_all(&mut *tx)
        .await?;

        let mut reaped = Vec::with_capacity(rows.len());
        for row in rows {
            let task: Task = row.try_into()?;
            reaped.push(apply_failure(&mut tx, &self.retry, &task, ABANDONED_ERROR, true).await?);
        }

        tx.commit().await?;
        Ok(reaped)
    }

    // ----------------------------
    // Replay
    // ----------------------------

    async fn replay(&self, task_id: Uuid) -> Result<Task> {
        let src: Task = self
            .get_task(task_id)
            .await?
            .ok_or(EngineError::TaskNotFound(task_id))?;

        if !matches!(src.status, TaskStatus::Failed | TaskStatus::Cancelled) {
            return Err(EngineError::InvalidTransition {
                task_id,
                status: src.status,
                expected: "failed or cancelled",
            });
        }

        let row = sqlx::query_as::<_, TaskRow>(
            r#"
            INSERT INTO tasks (queue_name, task_name, params, priority, max_retries, timeout_sec, replay_of)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING *
            "#,
        )
        .bind(replay_queue(&src))
        .bind(&src.task_name)
        .bind(&src.params)
        .bind(src.priority)
        .bind(src.max_retries)
        .bind(src.timeout_sec)
        .bind(src.id)
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    async fn queue_stats(&self, queue: &str) -> Result<QueueStats> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT status, COUNT(*)
            FROM tasks
            WHERE queue_name = $1
            GROUP BY status
            "#,
        )
        .bind(queue)
        .fetch_all(&self.pool)
        .await?;

        let mut stats = QueueStats::empty(queue);
        for (status, count) in rows {
            let status = status.parse().map_err(EngineError::Storage)?;
            stats.add(status, count);
        }
        Ok(stats)
    }

    async fn set_dead_letter(&self, queue: &str, enabled: bool) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO queue_policies (queue_name, dead_letter)
            VALUES ($1, $2)
            ON CONFLICT (queue_name)
            DO UPDATE SET dead_letter = EXCLUDED.dead_letter, updated_at = now()
            "#,
        )
        .bind(queue)
        .bind(enabled)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl WorkflowStore for PgStore {
    async fn create_workflow(
        &self,
        name: &str,
        tasks: &[WorkflowTaskSpec],
        edges: &[DependencyEdge],
    ) -> Result<WorkflowCreated> {
        // Rejected graphs never open a transaction.
        dag::validate(tasks, edges)?;

        let dependents: HashSet<&str> = edges.iter().map(|e| e.task.as_str()).collect();
        let mut tx = self.pool.begin().await?;

        let workflow_id: Uuid =
            sqlx::query_scalar("INSERT INTO workflows (name) VALUES ($1) RETURNING id")
                .bind(name)
                .fetch_one(&mut *tx)
                .await?;

        let mut task_ids = BTreeMap::new();
        for spec in tasks {
            let t = spec.to_new_task();
            let id: Uuid = sqlx::query_scalar(
                r#"
                INSERT INTO tasks (queue_name, task_name, params, priority, max_retries, timeout_sec, workflow_id, held)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                RETURNING id
                "#,
            )
            .bind(&t.queue_name)
            .bind(&t.task_name)
            .bind(&t.params)
            .bind(t.priority)
            .bind(t.max_retries)
            .bind(t.timeout_sec)
            .bind(workflow_id)
            .bind(dependents.contains(spec.key.as_str()))
            .fetch_one(&mut *tx)
            .await?;
            task_ids.insert(spec.key.clone(), id);
        }

        for e in edges {
            sqlx::query(
                r#"
                INSERT INTO task_dependencies (workflow_id, task_id, depends_on_task_id)
                VALUES ($1, $2, $3)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(workflow_id)
            .bind(task_ids[&e.task])
            .bind(task_ids[&e.depends_on])
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        Ok(WorkflowCreated {
            workflow_id,
            task_ids,
        })
    }

    async fn workflow_graph(&self, workflow_id: Uuid) -> Result<WorkflowGraph> {
        let workflow = sqlx::query_as::<_, Workflow>(
            "SELECT id, name, created_at FROM workflows WHERE id = $1",
        )
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(EngineError::WorkflowNotFound(workflow_id))?;

        let rows = sqlx::query_as::<_, TaskRow>(
            "SELECT * FROM tasks WHERE workflow_id = $1 ORDER BY created_at ASC, id ASC",
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await?;

        let edges: Vec<(Uuid, Uuid)> = sqlx::query_as(
            "SELECT task_id, depends_on_task_id FROM task_dependencies WHERE workflow_id = $1",
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(WorkflowGraph {
            workflow,
            tasks: into_tasks(rows)?,
            edges,
        })
    }

    async fn list_workflows(&self, limit: i64) -> Result<Vec<Workflow>> {
        let rows = sqlx::query_as::<_, Workflow>(
            r#"
            SELECT id, name, created_at
            FROM workflows
            ORDER BY created_at DESC, id DESC
            LIMIT $1
            "#,
        )
        .bind(limit.clamp(1, 500))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn release_ready(&self, workflow_id: Uuid, candidates: &[Uuid]) -> Result<Vec<Task>> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        // Row locks serialize two releasers; the NOT EXISTS is evaluated
        // against committed predecessor states.
        let rows = sqlx::query_as::<_, TaskRow>(
            r#"
            UPDATE tasks t
            SET held = FALSE,
                updated_at = now()
            WHERE t.id = ANY($2)
              AND t.workflow_id = $1
              AND t.held
              AND t.status = 'pending'
              AND NOT EXISTS (
                    SELECT 1
                    FROM task_dependencies d
                    JOIN tasks up ON up.id = d.depends_on_task_id
                    WHERE d.task_id = t.id
                      AND up.status <> 'completed'
              )
            RETURNING t.*
            "#,
        )
        .bind(workflow_id)
        .bind(candidates.to_vec())
        .fetch_all(&self.pool)
        .await?;

        into_tasks(rows)
    }

    async fn active_workflows(&self, limit: i64) -> Result<Vec<Uuid>> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT DISTINCT workflow_id
            FROM tasks
            WHERE workflow_id IS NOT NULL
              AND held
              AND status = 'pending'
            LIMIT $1
            "#,
        )
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }
}

// ----------------------------
// Schedules
// ----------------------------

async fn store_schedule(conn: &mut PgConnection, s: &Schedule) -> Result<Schedule> {
    let row = sqlx::query_as::<_, Schedule>(
        r#"
        UPDATE scheduled_tasks
        SET cron_expression = $2,
            queue_name = $3,
            task_name = $4,
            params = $5,
            priority = $6,
            max_retries = $7,
            timeout_sec = $8,
            enabled = $9,
            next_run_at = $10,
            last_run_at = $11,
            updated_at = now()
        WHERE id = $1
        RETURNING *
        "#,
    )
    .bind(s.id)
    .bind(&s.cron_expression)
    .bind(&s.queue_name)
    .bind(&s.task_name)
    .bind(&s.params)
    .bind(s.priority)
    .bind(s.max_retries)
    .bind(s.timeout_sec)
    .bind(s.enabled)
    .bind(s.next_run_at)
    .bind(s.last_run_at)
    .fetch_one(&mut *conn)
    .await?;
    Ok(row)
}

#[async_trait]
impl ScheduleStore for PgStore {
    async fn create_schedule(&self, spec: &ScheduleSpec) -> Result<Schedule> {
        let cron = CronExpr::parse(&spec.cron_expression)?;
        let now = self.now().await?;

        let inserted = sqlx::query_as::<_, Schedule>(
            r#"
            INSERT INTO scheduled_tasks (
                name, cron_expression, queue_name, task_name, params,
                priority, max_retries, timeout_sec, enabled, next_run_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING *
            "#,
        )
        .bind(&spec.name)
        .bind(cron.as_str())
        .bind(&spec.queue_name)
        .bind(&spec.task_name)
        .bind(&spec.params)
        .bind(spec.priority)
        .bind(spec.max_retries.max(0))
        .bind(spec.timeout_sec)
        .bind(spec.enabled)
        .bind(cron.next_after(now))
        .fetch_one(&self.pool)
        .await
        .map_err(EngineError::from);

        match inserted {
            Err(e) if e.is_unique_violation() => Err(EngineError::ScheduleExists(spec.name.clone())),
            other => other,
        }
    }

    async fn update_schedule(&self, name: &str, update: &ScheduleUpdate) -> Result<Schedule> {
        let cron = update
            .cron_expression
            .as_deref()
            .map(CronExpr::parse)
            .transpose()?;

        let mut tx = self.pool.begin().await?;

        let mut schedule = sqlx::query_as::<_, Schedule>(
            "SELECT * FROM scheduled_tasks WHERE name = $1 FOR UPDATE",
        )
        .bind(name)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| EngineError::ScheduleNotFound(name.to_string()))?;

        let reschedule = update.reschedules(schedule.enabled);
        update.apply(&mut schedule);
        if let Some(cron) = &cron {
            schedule.cron_expression = cron.as_str().to_string();
        }
        if reschedule {
            let now: DateTime<Utc> = sqlx::query_scalar("SELECT now()")
                .fetch_one(&mut *tx)
                .await?;
            schedule.next_run_at = CronExpr::parse(&schedule.cron_expression)?.next_after(now);
        }

        let stored = store_schedule(&mut tx, &schedule).await?;
        tx.commit().await?;
        Ok(stored)
    }

    async fn delete_schedule(&self, name: &str) -> Result<bool> {
        let res = sqlx::query("DELETE FROM scheduled_tasks WHERE name = $1")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn get_schedule(&self, name: &str) -> Result<Option<Schedule>> {
        let row = sqlx::query_as::<_, Schedule>("SELECT * FROM scheduled_tasks WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn list_schedules(&self) -> Result<Vec<Schedule>> {
        let rows = sqlx::query_as::<_, Schedule>("SELECT * FROM scheduled_tasks ORDER BY name ASC")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    /// Due rows stay locked until the spawn and the schedule advance
    /// commit together; a second scheduler skips them.
    async fn fire_due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<ScheduleFired>> {
        let mut tx = self.pool.begin().await?;

        let due = sqlx::query_as::<_, Schedule>(
            r#"
            SELECT *
            FROM scheduled_tasks
            WHERE enabled
              AND next_run_at IS NOT NULL
              AND next_run_at <= $1
            ORDER BY next_run_at ASC
            FOR UPDATE SKIP LOCKED
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit.max(0))
        .fetch_all(&mut *tx)
        .await?;

        let mut fired = Vec::with_capacity(due.len());
        for mut schedule in due {
            let Some(due_at) = schedule.next_run_at else {
                continue;
            };
            let spawned = insert_task(&mut tx, &schedule.task_for(due_at)).await?;

            schedule.last_run_at = Some(now);
            schedule.next_run_at = CronExpr::parse(&schedule.cron_expression)?.next_after(now);
            let stored = store_schedule(&mut tx, &schedule).await?;

            fired.push(ScheduleFired {
                schedule_name: stored.name,
                task_id: spawned.task.id,
                created: spawned.created,
                fired_at: now,
                next_run_at: stored.next_run_at,
            });
        }

        tx.commit().await?;
        Ok(fired)
    }

    async fn trigger_now(&self, name: &str) -> Result<ScheduleFired> {
        let mut tx = self.pool.begin().await?;

        let mut schedule = sqlx::query_as::<_, Schedule>(
            "SELECT * FROM scheduled_tasks WHERE name = $1 FOR UPDATE",
        )
        .bind(name)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| EngineError::ScheduleNotFound(name.to_string()))?;

        let spawned = insert_task(&mut tx, &schedule.template()).await?;
        let fired_at = spawned.task.created_at;

        schedule.last_run_at = Some(fired_at);
        let stored = store_schedule(&mut tx, &schedule).await?;
        tx.commit().await?;

        Ok(ScheduleFired {
            schedule_name: stored.name,
            task_id: spawned.task.id,
            created: spawned.created,
            fired_at,
            next_run_at: stored.next_run_at,
        })
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Claimed,
    Completed,
    Failed,
    Cancelled,
    Retrying,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::Pending,
        TaskStatus::Claimed,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
        TaskStatus::Retrying,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Claimed => "claimed",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Retrying => "retrying",
        }
    }

    /// Terminal tasks never change status again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "claimed" => Ok(TaskStatus::Claimed),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            "retrying" => Ok(TaskStatus::Retrying),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub queue_name: String,
    pub task_name: String,
    pub params: Value,
    pub priority: i32,
    pub status: TaskStatus,

    pub attempt: i32,
    pub max_retries: i32,

    pub worker_id: Option<String>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub timeout_sec: Option<i32>,
    pub idempotency_key: Option<String>,

    pub retry_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub execution_time_sec: Option<f64>,
    pub wait_time_sec: Option<f64>,

    pub workflow_id: Option<Uuid>,
    /// Workflow member still waiting on its predecessors; not claimable.
    pub held: bool,
    pub dead_letter_of: Option<Uuid>,
    pub replay_of: Option<Uuid>,

    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub queue_name: String,
    pub task_name: String,
    pub params: Value,
    pub priority: i32,
    pub max_retries: i32,
    pub timeout_sec: Option<i32>,
    pub idempotency_key: Option<String>,
}

impl NewTask {
    pub fn new(queue_name: &str, task_name: &str, params: Value) -> Self {
        Self {
            queue_name: queue_name.to_string(),
            task_name: task_name.to_string(),
            params,
            priority: 0,
            max_retries: 3,
            timeout_sec: None,
            idempotency_key: None,
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries.max(0);
        self
    }

    pub fn timeout_sec(mut self, timeout_sec: i32) -> Self {
        self.timeout_sec = Some(timeout_sec);
        self
    }

    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnOutcome {
    pub task_id: Uuid,
    pub status: TaskStatus,
    /// False when an idempotency key matched a live task.
    pub created: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskFilter {
    pub queue_name: Option<String>,
    pub status: Option<TaskStatus>,
    pub task_name: Option<String>,
    pub limit: i64,
    pub offset: i64,
}

impl TaskFilter {
    pub fn clamped_limit(&self) -> i64 {
        self.limit.clamp(1, 500)
    }

    pub fn clamped_offset(&self) -> i64 {
        self.offset.max(0)
    }

    pub fn matches(&self, task: &Task) -> bool {
        self.queue_name
            .as_deref()
            .map_or(true, |q| q == task.queue_name)
            && self.status.map_or(true, |s| s == task.status)
            && self
                .task_name
                .as_deref()
                .map_or(true, |n| n == task.task_name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPage {
    pub tasks: Vec<Task>,
    pub total: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queue_name: String,
    pub pending: i64,
    pub claimed: i64,
    pub retrying: i64,
    pub completed: i64,
    pub failed: i64,
    pub cancelled: i64,
}

impl QueueStats {
    pub fn empty(queue_name: &str) -> Self {
        Self {
            queue_name: queue_name.to_string(),
            ..Self::default()
        }
    }

    pub fn add(&mut self, status: TaskStatus, count: i64) {
        match status {
            TaskStatus::Pending => self.pending += count,
            TaskStatus::Claimed => self.claimed += count,
            TaskStatus::Retrying => self.retrying += count,
            TaskStatus::Completed => self.completed += count,
            TaskStatus::Failed => self.failed += count,
            TaskStatus::Cancelled => self.cancelled += count,
        }
    }

    pub fn total(&self) -> i64 {
        self.pending + self.claimed + self.retrying + self.completed + self.failed + self.cancelled
    }
}

/// Name of the dead-letter companion queue for `queue`.
pub fn dead_letter_queue(queue: &str) -> String {
    format!("{queue}-dlq")
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::tasks::{NewTask, Task, TaskStatus};

/// One member of a workflow, addressed by a caller-chosen key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowTaskSpec {
    pub key: String,
    pub queue_name: String,
    pub task_name: String,
    pub params: Value,
    pub priority: i32,
    pub max_retries: i32,
    pub timeout_sec: Option<i32>,
}

impl WorkflowTaskSpec {
    pub fn new(key: &str, queue_name: &str, task_name: &str, params: Value) -> Self {
        Self {
            key: key.to_string(),
            queue_name: queue_name.to_string(),
            task_name: task_name.to_string(),
            params,
            priority: 0,
            max_retries: 3,
            timeout_sec: None,
        }
    }

    pub fn max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries.max(0);
        self
    }

    pub fn to_new_task(&self) -> NewTask {
        NewTask {
            queue_name: self.queue_name.clone(),
            task_name: self.task_name.clone(),
            params: self.params.clone(),
            priority: self.priority,
            max_retries: self.max_retries.max(0),
            timeout_sec: self.timeout_sec,
            idempotency_key: None,
        }
    }
}

/// `task` waits for `depends_on`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub task: String,
    pub depends_on: String,
}

impl DependencyEdge {
    pub fn new(task: &str, depends_on: &str) -> Self {
        Self {
            task: task.to_string(),
            depends_on: depends_on.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowCreated {
    pub workflow_id: Uuid,
    pub task_ids: BTreeMap<String, Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Workflow {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Member tasks plus `(task_id, depends_on_task_id)` edges.
#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    pub workflow: Workflow,
    pub tasks: Vec<Task>,
    pub edges: Vec<(Uuid, Uuid)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowTaskStatus {
    pub task_id: Uuid,
    pub task_name: String,
    pub queue_name: String,
    pub status: TaskStatus,
    pub held: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowCounts {
    pub total: usize,
    pub blocked: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl WorkflowCounts {
    /// Share of members in a terminal state, 0.0 to 100.0.
    pub fn progress(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        let done = self.completed + self.failed + self.cancelled;
        done as f64 * 100.0 / self.total as f64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStatus {
    pub workflow_id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub state: WorkflowState,
    pub counts: WorkflowCounts,
    pub progress: f64,
    pub tasks: Vec<WorkflowTaskStatus>,
}

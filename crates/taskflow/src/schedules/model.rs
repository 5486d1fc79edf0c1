use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::tasks::NewTask;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Schedule {
    pub id: Uuid,
    pub name: String,
    pub cron_expression: String,
    pub queue_name: String,
    pub task_name: String,
    pub params: Value,
    pub priority: i32,
    pub max_retries: i32,
    pub timeout_sec: Option<i32>,
    pub enabled: bool,
    /// None when the expression never matches again.
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Schedule {
    /// Task spawned for the occurrence due at `due`. The key keeps two
    /// schedulers racing on the same occurrence from spawning twice.
    pub fn task_for(&self, due: DateTime<Utc>) -> NewTask {
        let mut task = self.template();
        task.idempotency_key = Some(format!("schedule:{}:{}", self.name, due.to_rfc3339()));
        task
    }

    pub fn template(&self) -> NewTask {
        NewTask {
            queue_name: self.queue_name.clone(),
            task_name: self.task_name.clone(),
            params: self.params.clone(),
            priority: self.priority,
            max_retries: self.max_retries,
            timeout_sec: self.timeout_sec,
            idempotency_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleSpec {
    pub name: String,
    pub cron_expression: String,
    pub queue_name: String,
    pub task_name: String,
    pub params: Value,
    pub priority: i32,
    pub max_retries: i32,
    pub timeout_sec: Option<i32>,
    pub enabled: bool,
}

impl ScheduleSpec {
    pub fn new(name: &str, cron_expression: &str, queue_name: &str, task_name: &str) -> Self {
        Self {
            name: name.to_string(),
            cron_expression: cron_expression.to_string(),
            queue_name: queue_name.to_string(),
            task_name: task_name.to_string(),
            params: Value::Object(Default::default()),
            priority: 0,
            max_retries: 3,
            timeout_sec: None,
            enabled: true,
        }
    }

    pub fn params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// Partial update; `None` leaves a field alone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScheduleUpdate {
    pub cron_expression: Option<String>,
    pub queue_name: Option<String>,
    pub task_name: Option<String>,
    pub params: Option<Value>,
    pub priority: Option<i32>,
    pub max_retries: Option<i32>,
    pub timeout_sec: Option<Option<i32>>,
    pub enabled: Option<bool>,
}

impl ScheduleUpdate {
    /// Whether `next_run_at` has to be recomputed after applying this to
    /// a schedule that was `was_enabled`.
    pub fn reschedules(&self, was_enabled: bool) -> bool {
        self.cron_expression.is_some() || (self.enabled == Some(true) && !was_enabled)
    }

    pub(crate) fn apply(&self, s: &mut Schedule) {
        if let Some(v) = &self.cron_expression {
            s.cron_expression = v.clone();
        }
        if let Some(v) = &self.queue_name {
            s.queue_name = v.clone();
        }
        if let Some(v) = &self.task_name {
            s.task_name = v.clone();
        }
        if let Some(v) = &self.params {
            s.params = v.clone();
        }
        if let Some(v) = self.priority {
            s.priority = v;
        }
        if let Some(v) = self.max_retries {
            s.max_retries = v.max(0);
        }
        if let Some(v) = self.timeout_sec {
            s.timeout_sec = v;
        }
        if let Some(v) = self.enabled {
            s.enabled = v;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleFired {
    pub schedule_name: String,
    pub task_id: Uuid,
    /// False when the occurrence had already been spawned.
    pub created: bool,
    pub fired_at: DateTime<Utc>,
    pub next_run_at: Option<DateTime<Utc>>,
}

use thiserror::Error;
use uuid::Uuid;

use crate::schedules::cron::CronError;
use crate::tasks::TaskStatus;

pub type Result<T, E = EngineError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("task {0} not found")]
    TaskNotFound(Uuid),

    #[error("task {task_id} is {status}, expected {expected}")]
    InvalidTransition {
        task_id: Uuid,
        status: TaskStatus,
        expected: &'static str,
    },

    #[error("task {task_id} is no longer claimed by worker {worker_id}")]
    NotOwner { task_id: Uuid, worker_id: String },

    #[error("dependency cycle detected: {}", .0.join(" -> "))]
    CycleDetected(Vec<String>),

    #[error("invalid workflow: {0}")]
    InvalidWorkflow(String),

    #[error("workflow {0} not found")]
    WorkflowNotFound(Uuid),

    #[error("schedule {0} not found")]
    ScheduleNotFound(String),

    #[error("schedule {0} already exists")]
    ScheduleExists(String),

    #[error(transparent)]
    Cron(#[from] CronError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("storage error: {0}")]
    Storage(String),
}

impl EngineError {
    /// Storage faults that a caller may retry. Everything else is a
    /// definitive answer from the store.
    pub fn is_transient(&self) -> bool {
        match self {
            EngineError::Database(err) => !matches!(
                err,
                sqlx::Error::RowNotFound
                    | sqlx::Error::ColumnNotFound(_)
                    | sqlx::Error::ColumnDecode { .. }
                    | sqlx::Error::Decode(_)
                    | sqlx::Error::TypeNotFound { .. }
            ),
            EngineError::Storage(_) => true,
            _ => false,
        }
    }

    pub(crate) fn is_unique_violation(&self) -> bool {
        match self {
            EngineError::Database(sqlx::Error::Database(db)) => {
                db.code().as_deref() == Some("23505")
            }
            _ => false,
        }
    }
}

use tracing::info;

use crate::tasks::Task;

/// Notified after every status transition the engine performs. Called
/// inline, so implementations should hand work off rather than block.
pub trait TaskObserver: Send + Sync {
    fn on_task_status_changed(&self, task: &Task);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl TaskObserver for NoopObserver {
    fn on_task_status_changed(&self, _task: &Task) {}
}

/// One structured event per transition.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl TaskObserver for TracingObserver {
    fn on_task_status_changed(&self, task: &Task) {
        info!(
            task_id = %task.id,
            queue = %task.queue_name,
            task_name = %task.task_name,
            status = %task.status,
            attempt = task.attempt,
            worker_id = task.worker_id.as_deref().unwrap_or("-"),
            "task status changed"
        );
    }
}

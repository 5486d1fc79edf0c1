use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::tasks::{Store, Task, TaskStatus};
use crate::workflows::dag;

/// Tasks changed by one resolver step.
#[derive(Debug, Default)]
pub struct SweepReport {
    pub released: Vec<Task>,
    pub cancelled: Vec<Task>,
}

impl SweepReport {
    fn extend(&mut self, other: SweepReport) {
        self.released.extend(other.released);
        self.cancelled.extend(other.cancelled);
    }
}

/// Releases held workflow members into their queues once every
/// predecessor has completed, and cancels everything downstream of a
/// member that failed or was cancelled.
#[derive(Clone)]
pub struct DependencyResolver {
    store: Arc<dyn Store>,
}

impl DependencyResolver {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn get_ready_tasks(&self, workflow_id: Uuid) -> Result<Vec<Uuid>> {
        let graph = self.store.workflow_graph(workflow_id).await?;
        Ok(dag::ready_tasks(&graph))
    }

    pub async fn on_task_completed(&self, task: &Task) -> Result<Vec<Task>> {
        let Some(workflow_id) = task.workflow_id else {
            return Ok(Vec::new());
        };

        let graph = self.store.workflow_graph(workflow_id).await?;
        let candidates = dag::direct_dependents(&graph.edges, task.id);
        let released = self.store.release_ready(workflow_id, &candidates).await?;

        if !released.is_empty() {
            debug!(
                workflow_id = %workflow_id,
                upstream = %task.id,
                released = released.len(),
                "released workflow tasks"
            );
        }
        Ok(released)
    }

    /// Cancels every transitive dependent of `task`. Dependents are still
    /// held, so none of them has ever been claimable.
    pub async fn on_task_failed(&self, task: &Task) -> Result<Vec<Task>> {
        let Some(workflow_id) = task.workflow_id else {
            return Ok(Vec::new());
        };

        let graph = self.store.workflow_graph(workflow_id).await?;
        let mut cancelled = Vec::new();

        for id in dag::transitive_dependents(&graph.edges, task.id) {
            let still_pending = graph
                .tasks
                .iter()
                .any(|t| t.id == id && t.status == TaskStatus::Pending);
            if !still_pending {
                continue;
            }

            match self.store.cancel(id).await {
                Ok(t) => cancelled.push(t),
                // Someone else settled it first.
                Err(EngineError::InvalidTransition { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        if !cancelled.is_empty() {
            warn!(
                workflow_id = %workflow_id,
                upstream = %task.id,
                upstream_status = %task.status,
                cancelled = cancelled.len(),
                "cancelled downstream workflow tasks"
            );
        }
        Ok(cancelled)
    }

    /// Repairs workflows whose release or cascade step was lost, e.g. to a
    /// crash between `Complete` and the release.
    pub async fn sweep(&self, limit: i64) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        for workflow_id in self.store.active_workflows(limit).await? {
            report.extend(self.sweep_one(workflow_id).await?);
        }

        Ok(report)
    }

    async fn sweep_one(&self, workflow_id: Uuid) -> Result<SweepReport> {
        let graph = self.store.workflow_graph(workflow_id).await?;
        let mut report = SweepReport::default();

        for upstream in graph
            .tasks
            .iter()
            .filter(|t| matches!(t.status, TaskStatus::Failed | TaskStatus::Cancelled))
        {
            let has_live_dependents = dag::transitive_dependents(&graph.edges, upstream.id)
                .iter()
                .any(|id| graph.tasks.iter().any(|t| t.id == *id && t.status == TaskStatus::Pending));
            if has_live_dependents {
                report.cancelled.extend(self.on_task_failed(upstream).await?);
            }
        }

        let ready = dag::ready_tasks(&graph);
        report.released = self.store.release_ready(workflow_id, &ready).await?;

        Ok(report)
    }
}

//! Pure graph logic for workflows: creation-time validation, readiness,
//! downstream cascade and the derived aggregate state.

use std::collections::{HashMap, HashSet, VecDeque};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::tasks::{Task, TaskStatus};
use crate::workflows::model::{
    DependencyEdge, WorkflowCounts, WorkflowGraph, WorkflowState, WorkflowTaskSpec,
};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Checks keys and edges, then returns the member keys in dependency
/// order (predecessors first).
pub fn validate(tasks: &[WorkflowTaskSpec], edges: &[DependencyEdge]) -> Result<Vec<String>> {
    if tasks.is_empty() {
        return Err(EngineError::InvalidWorkflow(
            "workflow has no tasks".to_string(),
        ));
    }

    let mut keys = HashSet::new();
    for t in tasks {
        if t.key.trim().is_empty() {
            return Err(EngineError::InvalidWorkflow("empty task key".to_string()));
        }
        if !keys.insert(t.key.as_str()) {
            return Err(EngineError::InvalidWorkflow(format!(
                "duplicate task key: {}",
                t.key
            )));
        }
    }

    let mut deps: HashMap<&str, Vec<&str>> = HashMap::new();
    for e in edges {
        for k in [&e.task, &e.depends_on] {
            if !keys.contains(k.as_str()) {
                return Err(EngineError::InvalidWorkflow(format!(
                    "edge references unknown task key: {k}"
                )));
            }
        }
        deps.entry(e.task.as_str())
            .or_default()
            .push(e.depends_on.as_str());
    }

    if let Some(cycle) = find_cycle(tasks, &deps) {
        return Err(EngineError::CycleDetected(cycle));
    }

    Ok(topological_order(tasks, &deps))
}

/// DFS with white/gray/black colouring; a gray successor is a back-edge.
fn find_cycle(tasks: &[WorkflowTaskSpec], deps: &HashMap<&str, Vec<&str>>) -> Option<Vec<String>> {
    let mut color: HashMap<&str, Color> = tasks
        .iter()
        .map(|t| (t.key.as_str(), Color::White))
        .collect();

    for t in tasks {
        let root = t.key.as_str();
        if color[root] != Color::White {
            continue;
        }

        // (node, index of next successor to visit)
        let mut stack: Vec<(&str, usize)> = vec![(root, 0)];
        let mut path: Vec<&str> = vec![root];
        color.insert(root, Color::Gray);

        while let Some((node, idx)) = stack.last_mut() {
            let succ = deps.get(*node).and_then(|d| d.get(*idx)).copied();
            *idx += 1;

            match succ {
                Some(next) => match color.get(next).copied().unwrap_or(Color::Black) {
                    Color::Gray => {
                        let start = path.iter().position(|n| *n == next).unwrap_or(0);
                        let mut cycle: Vec<String> =
                            path[start..].iter().map(|s| s.to_string()).collect();
                        cycle.push(next.to_string());
                        return Some(cycle);
                    }
                    Color::White => {
                        color.insert(next, Color::Gray);
                        stack.push((next, 0));
                        path.push(next);
                    }
                    Color::Black => {}
                },
                None => {
                    let done = *node;
                    color.insert(done, Color::Black);
                    stack.pop();
                    path.pop();
                }
            }
        }
    }

    None
}

fn topological_order(tasks: &[WorkflowTaskSpec], deps: &HashMap<&str, Vec<&str>>) -> Vec<String> {
    let mut indegree: HashMap<&str, usize> = tasks.iter().map(|t| (t.key.as_str(), 0)).collect();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for (task, ups) in deps {
        for up in ups {
            *indegree.entry(*task).or_default() += 1;
            dependents.entry(*up).or_default().push(*task);
        }
    }

    // Seed in declaration order so the result is deterministic.
    let mut queue: VecDeque<&str> = tasks
        .iter()
        .map(|t| t.key.as_str())
        .filter(|k| indegree[k] == 0)
        .collect();
    let mut order = Vec::with_capacity(tasks.len());

    while let Some(k) = queue.pop_front() {
        order.push(k.to_string());
        for d in dependents.get(k).into_iter().flatten() {
            if let Some(n) = indegree.get_mut(d) {
                *n -= 1;
                if *n == 0 {
                    queue.push_back(*d);
                }
            }
        }
    }

    order
}

/// Held pending members whose every predecessor has completed.
pub fn ready_tasks(graph: &WorkflowGraph) -> Vec<Uuid> {
    let status: HashMap<Uuid, TaskStatus> = graph.tasks.iter().map(|t| (t.id, t.status)).collect();

    graph
        .tasks
        .iter()
        .filter(|t| t.held && t.status == TaskStatus::Pending)
        .filter(|t| {
            graph
                .edges
                .iter()
                .filter(|(task, _)| *task == t.id)
                .all(|(_, up)| status.get(up) == Some(&TaskStatus::Completed))
        })
        .map(|t| t.id)
        .collect()
}

/// Direct dependents of `task_id`.
pub fn direct_dependents(edges: &[(Uuid, Uuid)], task_id: Uuid) -> Vec<Uuid> {
    edges
        .iter()
        .filter(|(_, up)| *up == task_id)
        .map(|(task, _)| *task)
        .collect()
}

/// Every task reachable downstream of `task_id`, nearest first.
pub fn transitive_dependents(edges: &[(Uuid, Uuid)], task_id: Uuid) -> Vec<Uuid> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    let mut queue = VecDeque::from([task_id]);

    while let Some(current) = queue.pop_front() {
        for d in direct_dependents(edges, current) {
            if seen.insert(d) {
                out.push(d);
                queue.push_back(d);
            }
        }
    }

    out
}

pub fn counts(tasks: &[Task]) -> WorkflowCounts {
    let mut c = WorkflowCounts {
        total: tasks.len(),
        ..WorkflowCounts::default()
    };
    for t in tasks {
        match t.status {
            TaskStatus::Pending if t.held => c.blocked += 1,
            TaskStatus::Pending => c.pending += 1,
            TaskStatus::Claimed | TaskStatus::Retrying => c.running += 1,
            TaskStatus::Completed => c.completed += 1,
            TaskStatus::Failed => c.failed += 1,
            TaskStatus::Cancelled => c.cancelled += 1,
        }
    }
    c
}

pub fn aggregate_state(tasks: &[Task]) -> WorkflowState {
    let c = counts(tasks);

    if c.failed > 0 {
        WorkflowState::Failed
    } else if c.total > 0 && c.completed == c.total {
        WorkflowState::Completed
    } else if c.completed + c.cancelled == c.total && c.cancelled > 0 {
        WorkflowState::Cancelled
    } else if c.running > 0 || c.completed > 0 {
        WorkflowState::Running
    } else {
        WorkflowState::Pending
    }
}

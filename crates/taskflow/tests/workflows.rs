mod common;

use common::memory_engine;
use serde_json::json;
use std::collections::HashSet;
use taskflow::error::EngineError;
use taskflow::tasks::{TaskFilter, TaskStatus};
use taskflow::workflows::{DependencyEdge, WorkflowState, WorkflowTaskSpec};
use taskflow::Engine;
use uuid::Uuid;

fn spec(key: &str) -> WorkflowTaskSpec {
    WorkflowTaskSpec::new(key, "etl", key, json!({ "step": key })).max_retries(0)
}

fn diamond() -> (Vec<WorkflowTaskSpec>, Vec<DependencyEdge>) {
    (
        vec![spec("extract"), spec("clean"), spec("enrich"), spec("load")],
        vec![
            DependencyEdge::new("clean", "extract"),
            DependencyEdge::new("enrich", "extract"),
            DependencyEdge::new("load", "clean"),
            DependencyEdge::new("load", "enrich"),
        ],
    )
}

async fn claim_and_complete(engine: &Engine, expected: Uuid) {
    let t = engine.claim("etl", "w").await.unwrap().unwrap();
    assert_eq!(t.id, expected);
    engine.complete(t.id, Some("w"), json!({})).await.unwrap();
}

#[tokio::test]
async fn diamond_releases_in_dependency_order() {
    let (engine, _clock) = memory_engine();
    let (tasks, edges) = diamond();
    let wf = engine.create_workflow("nightly", &tasks, &edges).await.unwrap();
    let id = |k: &str| wf.task_ids[k];

    assert_eq!(
        engine.get_ready_tasks(wf.workflow_id).await.unwrap(),
        Vec::<Uuid>::new()
    );
    let status = engine.workflow_status(wf.workflow_id).await.unwrap();
    assert_eq!(status.state, WorkflowState::Pending);
    assert_eq!(status.counts.blocked, 3);
    assert_eq!(status.counts.pending, 1);

    claim_and_complete(&engine, id("extract")).await;
    let status = engine.workflow_status(wf.workflow_id).await.unwrap();
    assert_eq!(status.progress, 25.0);

    let mut middle = HashSet::new();
    for _ in 0..2 {
        let t = engine.claim("etl", "w").await.unwrap().unwrap();
        middle.insert(t.id);
    }
    assert_eq!(middle, HashSet::from([id("clean"), id("enrich")]));
    assert!(engine.claim("etl", "w").await.unwrap().is_none());

    for t in &middle {
        engine.complete(*t, Some("w"), json!({})).await.unwrap();
    }

    let status = engine.workflow_status(wf.workflow_id).await.unwrap();
    assert_eq!(status.state, WorkflowState::Running);
    assert!(status.tasks.iter().any(|t| t.task_id == id("load") && !t.held));

    claim_and_complete(&engine, id("load")).await;
    let status = engine.workflow_status(wf.workflow_id).await.unwrap();
    assert_eq!(status.state, WorkflowState::Completed);
    assert_eq!(status.counts.completed, 4);
    assert_eq!(status.progress, 100.0);
}

#[tokio::test]
async fn workflow_listing_filters_on_derived_state() {
    let (engine, _clock) = memory_engine();

    let pair = engine
        .create_workflow(
            "pair",
            &[spec("a"), spec("b")],
            &[DependencyEdge::new("b", "a")],
        )
        .await
        .unwrap();
    engine.cancel(pair.task_ids["a"]).await.unwrap();

    let (tasks, edges) = diamond();
    let nightly = engine.create_workflow("nightly", &tasks, &edges).await.unwrap();

    let solo = engine
        .create_workflow(
            "solo",
            &[WorkflowTaskSpec::new("only", "solo", "only", json!({}))],
            &[],
        )
        .await
        .unwrap();
    let t = engine.claim("solo", "w").await.unwrap().unwrap();
    engine.complete(t.id, Some("w"), json!({})).await.unwrap();

    let ids = |state| {
        let engine = engine.clone();
        async move {
            engine
                .list_workflow_statuses(state, 10)
                .await
                .unwrap()
                .into_iter()
                .map(|s| (s.workflow_id, s.progress))
                .collect::<Vec<_>>()
        }
    };

    assert_eq!(
        ids(Some(WorkflowState::Cancelled)).await,
        vec![(pair.workflow_id, 100.0)]
    );
    assert_eq!(
        ids(Some(WorkflowState::Pending)).await,
        vec![(nightly.workflow_id, 0.0)]
    );
    assert_eq!(
        ids(Some(WorkflowState::Completed)).await,
        vec![(solo.workflow_id, 100.0)]
    );
    assert!(ids(Some(WorkflowState::Failed)).await.is_empty());
    assert_eq!(ids(None).await.len(), 3);
    assert_eq!(
        engine.list_workflow_statuses(None, 2).await.unwrap().len(),
        2
    );
}

#[tokio::test]
async fn dependent_is_held_until_every_predecessor_completes() {
    let (engine, _clock) = memory_engine();
    let tasks = vec![spec("a"), spec("b"), spec("join")];
    let edges = vec![DependencyEdge::new("join", "a"), DependencyEdge::new("join", "b")];
    let wf = engine.create_workflow("fan-in", &tasks, &edges).await.unwrap();

    let first = engine.claim("etl", "w").await.unwrap().unwrap();
    engine.complete(first.id, Some("w"), json!({})).await.unwrap();

    let join = engine.get_task(wf.task_ids["join"]).await.unwrap().unwrap();
    assert!(join.held);

    let second = engine.claim("etl", "w").await.unwrap().unwrap();
    assert_ne!(second.id, wf.task_ids["join"]);
    engine.complete(second.id, Some("w"), json!({})).await.unwrap();

    let join = engine.get_task(wf.task_ids["join"]).await.unwrap().unwrap();
    assert!(!join.held);
    assert_eq!(join.status, TaskStatus::Pending);
}

#[tokio::test]
async fn failure_cancels_every_downstream_task() {
    let (engine, _clock) = memory_engine();
    let tasks = vec![spec("a"), spec("b"), spec("c"), spec("side")];
    let edges = vec![DependencyEdge::new("b", "a"), DependencyEdge::new("c", "b")];
    let wf = engine.create_workflow("chain", &tasks, &edges).await.unwrap();

    // Roots dequeue in declaration order.
    let a = engine.claim("etl", "w").await.unwrap().unwrap();
    assert_eq!(a.id, wf.task_ids["a"]);
    let failed = engine.fail(a.id, Some("w"), "source missing").await.unwrap();
    assert_eq!(failed.status, TaskStatus::Failed);

    for k in ["b", "c"] {
        let t = engine.get_task(wf.task_ids[k]).await.unwrap().unwrap();
        assert_eq!(t.status, TaskStatus::Cancelled, "{k}");
    }
    let side = engine.get_task(wf.task_ids["side"]).await.unwrap().unwrap();
    assert_ne!(side.status, TaskStatus::Cancelled);

    let status = engine.workflow_status(wf.workflow_id).await.unwrap();
    assert_eq!(status.state, WorkflowState::Failed);
    assert_eq!(status.counts.cancelled, 2);
}

#[tokio::test]
async fn cancelling_a_member_cancels_its_dependents() {
    let (engine, _clock) = memory_engine();
    let tasks = vec![spec("a"), spec("b")];
    let edges = vec![DependencyEdge::new("b", "a")];
    let wf = engine.create_workflow("pair", &tasks, &edges).await.unwrap();

    engine.cancel(wf.task_ids["a"]).await.unwrap();

    let b = engine.get_task(wf.task_ids["b"]).await.unwrap().unwrap();
    assert_eq!(b.status, TaskStatus::Cancelled);
    let status = engine.workflow_status(wf.workflow_id).await.unwrap();
    assert_eq!(status.state, WorkflowState::Cancelled);
}

#[tokio::test]
async fn cycles_are_rejected_before_anything_is_written() {
    let (engine, _clock) = memory_engine();
    let tasks = vec![spec("a"), spec("b"), spec("c")];
    let edges = vec![
        DependencyEdge::new("b", "a"),
        DependencyEdge::new("c", "b"),
        DependencyEdge::new("a", "c"),
    ];

    let err = engine.create_workflow("loop", &tasks, &edges).await.unwrap_err();
    assert!(matches!(err, EngineError::CycleDetected(_)));

    assert!(engine.list_workflows(10).await.unwrap().is_empty());
    let page = engine
        .list_tasks(&TaskFilter {
            limit: 10,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(page.total, 0);
}

#[tokio::test]
async fn malformed_graphs_are_rejected() {
    let (engine, _clock) = memory_engine();

    let unknown = engine
        .create_workflow("x", &[spec("a")], &[DependencyEdge::new("a", "ghost")])
        .await
        .unwrap_err();
    assert!(matches!(unknown, EngineError::InvalidWorkflow(_)));

    let dup = engine
        .create_workflow("x", &[spec("a"), spec("a")], &[])
        .await
        .unwrap_err();
    assert!(matches!(dup, EngineError::InvalidWorkflow(_)));

    let self_loop = engine
        .create_workflow("x", &[spec("a")], &[DependencyEdge::new("a", "a")])
        .await
        .unwrap_err();
    assert!(matches!(self_loop, EngineError::CycleDetected(_)));
}

#[tokio::test]
async fn sweep_repairs_a_lost_release() {
    let (engine, _clock) = memory_engine();
    let tasks = vec![spec("a"), spec("b")];
    let edges = vec![DependencyEdge::new("b", "a")];
    let wf = engine.create_workflow("pair", &tasks, &edges).await.unwrap();

    // Complete straight through the store, skipping the resolver.
    engine.claim("etl", "w").await.unwrap().unwrap();
    engine
        .store()
        .complete(wf.task_ids["a"], Some("w"), json!({}))
        .await
        .unwrap();
    assert!(engine.claim("etl", "w").await.unwrap().is_none());
    assert_eq!(
        engine.get_ready_tasks(wf.workflow_id).await.unwrap(),
        vec![wf.task_ids["b"]]
    );

    let report = engine.sweep_workflows(100).await.unwrap();
    assert_eq!(report.released.len(), 1);

    let b = engine.claim("etl", "w").await.unwrap().unwrap();
    assert_eq!(b.id, wf.task_ids["b"]);

    // Nothing left to repair.
    let again = engine.sweep_workflows(100).await.unwrap();
    assert!(again.released.is_empty() && again.cancelled.is_empty());
}

#[tokio::test]
async fn unknown_workflow_is_reported() {
    let (engine, _clock) = memory_engine();
    let err = engine.workflow_status(Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, EngineError::WorkflowNotFound(_)));
}

mod common;

use common::{memory_engine, task};
use std::collections::HashSet;
use taskflow::error::EngineError;
use taskflow::tasks::TaskStatus;

#[tokio::test]
async fn claims_highest_priority_then_oldest() {
    let (engine, clock) = memory_engine();

    let t1 = engine.spawn(task("q", "t1").priority(5)).await.unwrap();
    clock.advance(chrono::Duration::seconds(1));
    let t2 = engine.spawn(task("q", "t2").priority(1)).await.unwrap();
    clock.advance(chrono::Duration::seconds(1));
    let t3 = engine.spawn(task("q", "t3").priority(5)).await.unwrap();

    let mut order = Vec::new();
    for _ in 0..3 {
        order.push(engine.claim("q", "w").await.unwrap().unwrap().id);
    }

    assert_eq!(order, vec![t1.task_id, t3.task_id, t2.task_id]);
    assert!(engine.claim("q", "w").await.unwrap().is_none());
}

#[tokio::test]
async fn claim_only_sees_its_own_queue() {
    let (engine, _clock) = memory_engine();
    engine.spawn(task("emails", "send")).await.unwrap();

    assert!(engine.claim("reports", "w").await.unwrap().is_none());

    let claimed = engine.claim("emails", "w").await.unwrap().unwrap();
    assert_eq!(claimed.status, TaskStatus::Claimed);
    assert_eq!(claimed.worker_id.as_deref(), Some("w"));
    assert!(claimed.claimed_at.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_hand_out_each_task_once() {
    let (engine, _clock) = memory_engine();
    for i in 0..25 {
        engine
            .spawn(task("q", "work").priority(i % 3))
            .await
            .unwrap();
    }

    let mut handles = Vec::new();
    for w in 0..8 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            let worker = format!("w-{w}");
            let mut got = Vec::new();
            while let Some(t) = engine.claim("q", &worker).await.unwrap() {
                got.push(t.id);
                tokio::task::yield_now().await;
            }
            got
        }));
    }

    let mut all = Vec::new();
    for h in handles {
        all.extend(h.await.unwrap());
    }
    let unique: HashSet<_> = all.iter().copied().collect();

    assert_eq!(all.len(), 25);
    assert_eq!(unique.len(), 25);
}

#[tokio::test]
async fn only_the_claiming_worker_may_complete() {
    let (engine, _clock) = memory_engine();
    let spawned = engine.spawn(task("q", "work")).await.unwrap();
    engine.claim("q", "owner").await.unwrap().unwrap();

    let err = engine
        .complete(spawned.task_id, Some("intruder"), serde_json::json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotOwner { .. }));

    let done = engine
        .complete(spawned.task_id, Some("owner"), serde_json::json!({"ok": true}))
        .await
        .unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.result, Some(serde_json::json!({"ok": true})));
    assert!(done.execution_time_sec.is_some());
    assert!(done.wait_time_sec.is_some());

    // Terminal tasks stay terminal.
    let err = engine
        .complete(spawned.task_id, None, serde_json::json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition { .. }));
}

#[tokio::test]
async fn cancel_only_before_claim() {
    let (engine, _clock) = memory_engine();
    let a = engine.spawn(task("q", "a")).await.unwrap();
    let b = engine.spawn(task("q", "b")).await.unwrap();

    let cancelled = engine.cancel(a.task_id).await.unwrap();
    assert_eq!(cancelled.status, TaskStatus::Cancelled);

    let claimed = engine.claim("q", "w").await.unwrap().unwrap();
    assert_eq!(claimed.id, b.task_id);

    let err = engine.cancel(b.task_id).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::InvalidTransition {
            status: TaskStatus::Claimed,
            ..
        }
    ));
}

#[tokio::test]
async fn heartbeat_is_refused_for_other_workers() {
    let (engine, _clock) = memory_engine();
    let s = engine.spawn(task("q", "work")).await.unwrap();
    engine.claim("q", "owner").await.unwrap().unwrap();

    assert!(engine.heartbeat(s.task_id, "owner").await.unwrap());
    assert!(!engine.heartbeat(s.task_id, "other").await.unwrap());

    let t = engine.get_task(s.task_id).await.unwrap().unwrap();
    assert!(t.heartbeat_at.is_some());
}

#[tokio::test]
async fn list_and_stats_reflect_queue_state() {
    let (engine, clock) = memory_engine();
    for _ in 0..3 {
        engine.spawn(task("q", "work")).await.unwrap();
        clock.advance(chrono::Duration::seconds(1));
    }
    engine.spawn(task("other", "work")).await.unwrap();
    engine.claim("q", "w").await.unwrap().unwrap();

    let stats = engine.queue_stats("q").await.unwrap();
    assert_eq!(stats.pending, 2);
    assert_eq!(stats.claimed, 1);
    assert_eq!(stats.total(), 3);

    let page = engine
        .list_tasks(&taskflow::tasks::TaskFilter {
            queue_name: Some("q".to_string()),
            status: Some(TaskStatus::Pending),
            limit: 1,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(page.total, 2);
    assert_eq!(page.tasks.len(), 1);
    // Newest first.
    assert_eq!(page.tasks[0].created_at, common::t0() + chrono::Duration::seconds(2));
}

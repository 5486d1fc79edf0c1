mod common;

use chrono::Duration;
use common::{memory_engine, task};
use taskflow::error::EngineError;
use taskflow::tasks::{TaskFilter, TaskStatus};

#[tokio::test]
async fn two_retries_then_failed_with_backoff() {
    let (engine, clock) = memory_engine();
    let id = engine
        .spawn(task("ingest", "convert").priority(10).max_retries(2))
        .await
        .unwrap()
        .task_id;

    // Execution 1.
    engine.claim("ingest", "w").await.unwrap().unwrap();
    let t = engine.fail(id, Some("w"), "disk full").await.unwrap();
    assert_eq!(t.status, TaskStatus::Retrying);
    assert_eq!(t.attempt, 1);
    assert_eq!(t.retry_at, Some(clock_now(&clock) + Duration::seconds(1)));
    assert_eq!(t.worker_id, None);

    // Not claimable until the backoff elapses.
    assert!(engine.claim("ingest", "w").await.unwrap().is_none());
    clock.advance(Duration::seconds(1));

    // Execution 2.
    engine.claim("ingest", "w").await.unwrap().unwrap();
    let t = engine.fail(id, Some("w"), "disk full").await.unwrap();
    assert_eq!(t.status, TaskStatus::Retrying);
    assert_eq!(t.attempt, 2);
    assert_eq!(t.retry_at, Some(clock_now(&clock) + Duration::seconds(2)));

    clock.advance(Duration::seconds(2));

    // Execution 3 is the last.
    engine.claim("ingest", "w").await.unwrap().unwrap();
    let t = engine.fail(id, Some("w"), "disk full").await.unwrap();
    assert_eq!(t.status, TaskStatus::Failed);
    assert_eq!(t.attempt, 2);
    assert_eq!(t.error.as_deref(), Some("disk full"));
    assert!(t.completed_at.is_some());

    assert!(engine.claim("ingest", "w").await.unwrap().is_none());
}

fn clock_now(clock: &taskflow::clock::ManualClock) -> chrono::DateTime<chrono::Utc> {
    use taskflow::clock::Clock;
    clock.now()
}

#[tokio::test]
async fn zero_retries_fails_on_first_error() {
    let (engine, _clock) = memory_engine();
    let id = engine
        .spawn(task("q", "once").max_retries(0))
        .await
        .unwrap()
        .task_id;

    engine.claim("q", "w").await.unwrap().unwrap();
    let t = engine.fail(id, None, "nope").await.unwrap();

    assert_eq!(t.status, TaskStatus::Failed);
    assert_eq!(t.attempt, 0);
}

#[tokio::test]
async fn exhausted_task_is_copied_to_dead_letter_queue() {
    let (engine, _clock) = memory_engine();
    let id = engine
        .spawn(task("billing", "charge").max_retries(0))
        .await
        .unwrap()
        .task_id;

    engine.claim("billing", "w").await.unwrap().unwrap();
    engine.fail(id, Some("w"), "card declined").await.unwrap();

    let dlq = engine
        .list_tasks(&TaskFilter {
            queue_name: Some("billing-dlq".to_string()),
            limit: 10,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(dlq.total, 1);

    let copy = &dlq.tasks[0];
    assert_eq!(copy.status, TaskStatus::Failed);
    assert_eq!(copy.dead_letter_of, Some(id));
    assert_eq!(copy.task_name, "charge");
    assert_eq!(copy.error.as_deref(), Some("card declined"));

    // Copies are terminal; nothing in the dead-letter queue is claimable.
    assert!(engine.claim("billing-dlq", "w").await.unwrap().is_none());
    assert_eq!(engine.queue_stats("billing-dlq").await.unwrap().failed, 1);
}

#[tokio::test]
async fn dead_letter_can_be_disabled_per_queue() {
    let (engine, _clock) = memory_engine();
    engine.set_dead_letter("scratch", false).await.unwrap();

    let id = engine
        .spawn(task("scratch", "tmp").max_retries(0))
        .await
        .unwrap()
        .task_id;
    engine.claim("scratch", "w").await.unwrap().unwrap();
    engine.fail(id, None, "x").await.unwrap();

    assert_eq!(engine.queue_stats("scratch-dlq").await.unwrap().total(), 0);
}

#[tokio::test]
async fn replay_of_dead_letter_copy_returns_to_original_queue() {
    let (engine, _clock) = memory_engine();
    let id = engine
        .spawn(task("billing", "charge").max_retries(0))
        .await
        .unwrap()
        .task_id;
    engine.claim("billing", "w").await.unwrap().unwrap();
    engine.fail(id, None, "declined").await.unwrap();

    let copy_id = engine
        .list_tasks(&TaskFilter {
            queue_name: Some("billing-dlq".to_string()),
            limit: 1,
            ..Default::default()
        })
        .await
        .unwrap()
        .tasks[0]
        .id;

    let replayed = engine.replay(copy_id).await.unwrap();
    assert_eq!(replayed.queue_name, "billing");
    assert_eq!(replayed.status, TaskStatus::Pending);
    assert_eq!(replayed.attempt, 0);
    assert_eq!(replayed.replay_of, Some(copy_id));

    let claimed = engine.claim("billing", "w").await.unwrap().unwrap();
    assert_eq!(claimed.id, replayed.id);
}

#[tokio::test]
async fn replay_rejects_live_tasks() {
    let (engine, _clock) = memory_engine();
    let id = engine.spawn(task("q", "live")).await.unwrap().task_id;

    let err = engine.replay(id).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition { .. }));

    engine.cancel(id).await.unwrap();
    let replayed = engine.replay(id).await.unwrap();
    assert_eq!(replayed.queue_name, "q");
    assert_eq!(replayed.replay_of, Some(id));
}

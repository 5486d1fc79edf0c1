mod common;

use chrono::Duration;
use common::{memory_engine, task};
use taskflow::error::EngineError;
use taskflow::reaper::{ReapReport, Reaper, ReaperConfig};
use taskflow::tasks::store::ABANDONED_ERROR;
use taskflow::tasks::TaskStatus;

fn reaper(engine: &taskflow::Engine) -> Reaper {
    Reaper::new(
        engine.clone(),
        ReaperConfig {
            grace_secs: 600,
            ..ReaperConfig::default()
        },
    )
}

#[tokio::test]
async fn silent_claim_goes_back_to_pending() {
    let (engine, clock) = memory_engine();
    let id = engine
        .spawn(task("q", "slow").timeout_sec(30))
        .await
        .unwrap()
        .task_id;
    engine.claim("q", "dead-worker").await.unwrap().unwrap();

    clock.advance(Duration::seconds(30));
    assert_eq!(reaper(&engine).tick().await.unwrap(), ReapReport::default());

    clock.advance(Duration::seconds(1));
    let report = reaper(&engine).tick().await.unwrap();
    assert_eq!(report.requeued, 1);
    assert_eq!(report.failed, 0);

    let t = engine.get_task(id).await.unwrap().unwrap();
    assert_eq!(t.status, TaskStatus::Pending);
    assert_eq!(t.attempt, 1);
    assert_eq!(t.worker_id, None);
    assert_eq!(t.error.as_deref(), Some(ABANDONED_ERROR));

    let reclaimed = engine.claim("q", "live-worker").await.unwrap().unwrap();
    assert_eq!(reclaimed.id, id);
}

#[tokio::test]
async fn heartbeats_keep_a_claim_alive() {
    let (engine, clock) = memory_engine();
    let id = engine
        .spawn(task("q", "long").timeout_sec(30))
        .await
        .unwrap()
        .task_id;
    engine.claim("q", "w").await.unwrap().unwrap();

    for _ in 0..4 {
        clock.advance(Duration::seconds(20));
        assert!(engine.heartbeat(id, "w").await.unwrap());
        assert_eq!(reaper(&engine).tick().await.unwrap().requeued, 0);
    }

    let t = engine.get_task(id).await.unwrap().unwrap();
    assert_eq!(t.status, TaskStatus::Claimed);
}

#[tokio::test]
async fn claims_without_timeout_use_the_grace_window() {
    let (engine, clock) = memory_engine();
    let id = engine.spawn(task("q", "untimed")).await.unwrap().task_id;
    engine.claim("q", "w").await.unwrap().unwrap();

    clock.advance(Duration::seconds(599));
    assert_eq!(reaper(&engine).tick().await.unwrap().requeued, 0);

    clock.advance(Duration::seconds(2));
    assert_eq!(reaper(&engine).tick().await.unwrap().requeued, 1);
    assert_eq!(
        engine.get_task(id).await.unwrap().unwrap().status,
        TaskStatus::Pending
    );
}

#[tokio::test]
async fn exhausted_abandoned_task_fails_into_dead_letter() {
    let (engine, clock) = memory_engine();
    let id = engine
        .spawn(task("q", "doomed").timeout_sec(5).max_retries(0))
        .await
        .unwrap()
        .task_id;
    engine.claim("q", "w").await.unwrap().unwrap();

    clock.advance(Duration::seconds(10));
    let report = reaper(&engine).tick().await.unwrap();
    assert_eq!(report.failed, 1);

    let t = engine.get_task(id).await.unwrap().unwrap();
    assert_eq!(t.status, TaskStatus::Failed);
    assert_eq!(engine.queue_stats("q-dlq").await.unwrap().failed, 1);
}

#[tokio::test]
async fn late_outcome_from_reaped_worker_is_refused() {
    let (engine, clock) = memory_engine();
    let id = engine
        .spawn(task("q", "slow").timeout_sec(5))
        .await
        .unwrap()
        .task_id;
    engine.claim("q", "old").await.unwrap().unwrap();

    clock.advance(Duration::seconds(6));
    reaper(&engine).tick().await.unwrap();
    engine.claim("q", "new").await.unwrap().unwrap();

    let err = engine
        .complete(id, Some("old"), serde_json::json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotOwner { .. }));

    let done = engine
        .complete(id, Some("new"), serde_json::json!({}))
        .await
        .unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
}

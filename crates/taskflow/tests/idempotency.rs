mod common;

use common::{memory_engine, task};
use taskflow::tasks::TaskStatus;

#[tokio::test]
async fn same_key_returns_the_live_task() {
    let (engine, _clock) = memory_engine();

    let first = engine
        .spawn(task("q", "import").idempotency_key("import:42"))
        .await
        .unwrap();
    let second = engine
        .spawn(task("q", "import").idempotency_key("import:42"))
        .await
        .unwrap();

    assert!(first.created);
    assert!(!second.created);
    assert_eq!(first.task_id, second.task_id);
    assert_eq!(engine.queue_stats("q").await.unwrap().total(), 1);
}

#[tokio::test]
async fn key_is_scoped_to_the_queue() {
    let (engine, _clock) = memory_engine();

    let a = engine
        .spawn(task("a", "import").idempotency_key("k"))
        .await
        .unwrap();
    let b = engine
        .spawn(task("b", "import").idempotency_key("k"))
        .await
        .unwrap();

    assert!(a.created && b.created);
    assert_ne!(a.task_id, b.task_id);
}

#[tokio::test]
async fn key_is_free_again_once_the_task_is_terminal() {
    let (engine, _clock) = memory_engine();

    let first = engine
        .spawn(task("q", "import").idempotency_key("k"))
        .await
        .unwrap();
    engine.claim("q", "w").await.unwrap().unwrap();
    engine
        .complete(first.task_id, Some("w"), serde_json::json!(null))
        .await
        .unwrap();

    let again = engine
        .spawn(task("q", "import").idempotency_key("k"))
        .await
        .unwrap();
    assert!(again.created);
    assert_ne!(again.task_id, first.task_id);
    assert_eq!(again.status, TaskStatus::Pending);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_submissions_create_one_task() {
    let (engine, _clock) = memory_engine();

    let mut handles = Vec::new();
    for _ in 0..16 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine
                .spawn(task("q", "import").idempotency_key("race"))
                .await
                .unwrap()
        }));
    }

    let mut created = 0;
    let mut ids = std::collections::HashSet::new();
    for h in handles {
        let out = h.await.unwrap();
        created += usize::from(out.created);
        ids.insert(out.task_id);
    }

    assert_eq!(created, 1);
    assert_eq!(ids.len(), 1);
}

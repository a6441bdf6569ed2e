//! Redis store against a live server.
//!
//! Run with `TASKMILL_REDIS_URL=redis://127.0.0.1/ cargo test --features redis -- --ignored`.
#![cfg(feature = "redis")]

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use taskmill_core::{BackoffPolicy, JobFailure, JobOptions, JobState, LockToken, WorkerId};
use taskmill_events::WorkerEvent;
use taskmill_infra::processor::{JobContext, processor_fn};
use taskmill_infra::store::{FailedTransition, JobStore, NextJob, RedisJobStore, StoreError};
use taskmill_infra::worker::{Worker, WorkerConfig};

async fn store() -> RedisJobStore {
    let url = std::env::var("TASKMILL_REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".to_string());
    // A fresh queue per test keeps runs independent.
    let queue = format!("test-{}", uuid::Uuid::now_v7());
    RedisJobStore::connect(url, &queue).await.unwrap()
}

fn token() -> LockToken {
    LockToken::new(WorkerId::new(), 1)
}

#[tokio::test]
#[ignore = "needs a running Redis"]
async fn fetch_locks_a_single_holder() {
    let store = store().await;
    let job = store.add("one", json!({ "x": 1 }), JobOptions::default()).await.unwrap();

    let first = token();
    let fetched = match store.fetch_next_job(&first, Duration::from_secs(30)).await.unwrap() {
        NextJob::Job(job) => job,
        other => panic!("unexpected {other:?}"),
    };
    assert_eq!(fetched.id, job.id);
    assert_eq!(fetched.attempts_made, 1);
    assert_eq!(fetched.state, JobState::Active);

    assert!(matches!(
        store.fetch_next_job(&token(), Duration::from_secs(30)).await.unwrap(),
        NextJob::Empty
    ));
    assert!(matches!(
        store.extend_lock(&job.id, &token(), Duration::from_secs(30)).await,
        Err(StoreError::LockMismatch(_))
    ));

    store.extend_lock(&job.id, &first, Duration::from_secs(30)).await.unwrap();
    store.mark_completed(&job.id, &first, json!("ok")).await.unwrap();

    let stored = store.get(&job.id).await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::Completed);
    assert_eq!(stored.return_value, Some(json!("ok")));
}

#[tokio::test]
#[ignore = "needs a running Redis"]
async fn failures_follow_the_backoff() {
    let store = store().await;
    let opts = JobOptions::default()
        .with_attempts(2)
        .with_backoff(BackoffPolicy::fixed(Duration::from_millis(200)));
    let job = store.add("retry", json!(null), opts).await.unwrap();

    let lock = token();
    store.fetch_next_job(&lock, Duration::from_secs(30)).await.unwrap();
    let transition = store
        .mark_failed(&job.id, &lock, &JobFailure::processor("first"))
        .await
        .unwrap();
    assert!(matches!(transition, FailedTransition::Delayed { .. }));

    tokio::time::sleep(Duration::from_millis(300)).await;
    let lock = token();
    assert!(matches!(
        store.fetch_next_job(&lock, Duration::from_secs(30)).await.unwrap(),
        NextJob::Job(_)
    ));
    let transition = store
        .mark_failed(&job.id, &lock, &JobFailure::processor("second"))
        .await
        .unwrap();
    assert_eq!(transition, FailedTransition::Failed);

    let stored = store.get(&job.id).await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::Failed);
    assert_eq!(stored.failed_reason.as_deref(), Some("second"));
}

#[tokio::test]
#[ignore = "needs a running Redis"]
async fn failing_with_a_lost_lock_changes_nothing() {
    let store = store().await;
    let job = store
        .add("taken", json!(null), JobOptions::default().with_attempts(3))
        .await
        .unwrap();

    let stale = token();
    store.fetch_next_job(&stale, Duration::from_millis(50)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    store.recover_stalled(5).await.unwrap();

    let current = token();
    assert!(matches!(
        store.fetch_next_job(&current, Duration::from_secs(30)).await.unwrap(),
        NextJob::Job(_)
    ));

    assert!(matches!(
        store.mark_failed(&job.id, &stale, &JobFailure::processor("late")).await,
        Err(StoreError::LockMismatch(_))
    ));
    let stored = store.get(&job.id).await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::Active);
    assert_eq!(stored.failed_reason, None);

    let transition = store
        .mark_failed(&job.id, &current, &JobFailure::processor("real"))
        .await
        .unwrap();
    assert_eq!(transition, FailedTransition::Retrying);
}

#[tokio::test]
#[ignore = "needs a running Redis"]
async fn expired_locks_are_recovered() {
    let store = store().await;
    let job = store.add("lost", json!(null), JobOptions::default()).await.unwrap();

    store.fetch_next_job(&token(), Duration::from_millis(50)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let report = store.recover_stalled(1).await.unwrap();
    assert_eq!(report.requeued, vec![job.id.clone()]);
    let stored = store.get(&job.id).await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::Waiting);
    assert_eq!(stored.stalled_counter, 1);
}

#[tokio::test]
#[ignore = "needs a running Redis"]
async fn progress_logs_and_counts() {
    let store = store().await;
    let job = store.add("p", json!({ "a": 1 }), JobOptions::default()).await.unwrap();

    store.update_progress(&job.id, json!(33)).await.unwrap();
    assert_eq!(store.add_log(&job.id, "one".into()).await.unwrap(), 1);
    assert_eq!(store.add_log(&job.id, "two".into()).await.unwrap(), 2);
    store.update_data(&job.id, json!({ "a": 2 })).await.unwrap();

    let stored = store.get(&job.id).await.unwrap().unwrap();
    assert_eq!(stored.progress, json!(33));
    assert_eq!(stored.logs, vec!["one", "two"]);
    assert_eq!(stored.data, json!({ "a": 2 }));
    assert_eq!(store.counts().await.unwrap().waiting, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore = "needs a running Redis"]
async fn worker_drains_a_redis_queue() {
    let store = Arc::new(store().await);
    for n in 0..5 {
        store.add("sum", json!({ "n": n }), JobOptions::default()).await.unwrap();
    }

    let worker = Worker::builder(store.clone())
        .config(
            WorkerConfig::default()
                .with_autorun(false)
                .with_concurrency(2)
                .with_drain_interval(Duration::from_millis(100)),
        )
        .processor(processor_fn(|job, _ctx: JobContext| async move { Ok(job.data["n"].clone()) }))
        .build()
        .unwrap();
    worker.wait_until_ready().await.unwrap();
    let mut events = worker.subscribe();
    worker.start().unwrap();

    let mut completed = 0;
    while completed < 5 {
        match events.recv_timeout(Duration::from_secs(10)).await {
            Ok(WorkerEvent::Completed { .. }) => completed += 1,
            Ok(_) => {}
            Err(err) => panic!("no completion: {err:?}"),
        }
    }

    worker.close(false).await;
    assert_eq!(store.counts().await.unwrap().completed, 5);
}

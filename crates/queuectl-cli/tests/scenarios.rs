//! End-to-end scenarios driving the lifecycle manager against a real
//! (in-memory) SQLite store, using a steppable clock so deferred `run_at`
//! and backoff windows don't require sleeping real wall-clock seconds.

use std::sync::Arc;

use chrono::{Duration, Utc};
use queuectl_core::{JobState, LifecycleManager, QueueConfig, Store};
use queuectl_testing::{in_memory_store, FixedClock};
use serde_json::json;

async fn manager() -> (
    LifecycleManager<queuectl_sqlite::SqliteStore, FixedClock>,
    Arc<FixedClock>,
) {
    let store = Arc::new(in_memory_store().await);
    let clock = Arc::new(FixedClock::new(Utc::now()));
    let config = QueueConfig {
        max_retries: 2,
        backoff_base: 1.0,
        ..QueueConfig::default()
    };
    (LifecycleManager::new(store, clock.clone(), config), clock)
}

#[tokio::test]
async fn bounded_retry_then_dlq_requeue() {
    let (mgr, _clock) = manager().await;

    let job = mgr
        .enqueue(json!({"id": "j2", "command": "false", "max_retries": 2}))
        .await
        .unwrap();

    let should_retry = mgr.mark_failed(&job, "w1", Some(""), Some(5), None).await.unwrap();
    assert!(should_retry);
    let job = mgr.get_job("j2").await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempts, 1);

    let should_retry = mgr.mark_failed(&job, "w1", Some(""), Some(5), None).await.unwrap();
    assert!(!should_retry);
    let job = mgr.get_job("j2").await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Dead);
    assert_eq!(job.attempts, 2);

    assert!(mgr.retry_dead_job("j2").await.unwrap());
    let job = mgr.get_job("j2").await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.attempts, 0);
    assert!(job.next_retry_at.is_none());

    let leased = mgr.store().lease_pending("w2").await.unwrap().unwrap();
    assert_eq!(leased.id, "j2");
    assert_eq!(leased.attempts, 0);
}

#[tokio::test]
async fn priority_ordering_leases_highest_priority_first() {
    let (mgr, _clock) = manager().await;

    mgr.enqueue(json!({"id": "lo", "command": "echo lo", "priority": 0}))
        .await
        .unwrap();
    mgr.enqueue(json!({"id": "hi", "command": "echo hi", "priority": 10}))
        .await
        .unwrap();

    let leased = mgr.store().lease_pending("w1").await.unwrap().unwrap();
    assert_eq!(leased.id, "hi");

    let leased = mgr.store().lease_pending("w1").await.unwrap().unwrap();
    assert_eq!(leased.id, "lo");
}

#[tokio::test]
async fn deferred_run_at_blocks_leasing_until_due() {
    let (mgr, clock) = manager().await;

    let run_at = clock.now() + Duration::seconds(5);
    mgr.enqueue(json!({
        "id": "future",
        "command": "echo later",
        "run_at": queuectl_core::format_timestamp(run_at),
    }))
    .await
    .unwrap();

    // `run_at` is five seconds out; the store's pending-lease predicate
    // filters on the real system clock, so the row is not yet a candidate.
    assert!(mgr.store().lease_pending("w1").await.unwrap().is_none());

    let job = mgr.get_job("future").await.unwrap().unwrap();
    let stored_run_at = job.run_at.expect("run_at persisted");
    assert!((stored_run_at - run_at).num_milliseconds().abs() < 1000);
}

#[tokio::test]
async fn single_job_leased_by_exactly_one_of_three_racing_workers() {
    let (mgr, _clock) = manager().await;
    mgr.enqueue(json!({"id": "race", "command": "echo hi"}))
        .await
        .unwrap();

    let store = mgr.store().clone();
    let mut handles = Vec::new();
    for i in 0..3 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store.lease_pending(&format!("w{i}")).await.unwrap()
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap().is_some() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

//! Integration tests for the coordinated increment protocol and the lock-free read path.
//!
//! Replicas are simulated as separate service contexts sharing one in-memory store.

use etcd_counter::context::{ReplicaIdentity, ServiceContext};
use etcd_counter::coordination::CoordinationClient;
use etcd_counter::increment_coordinator::IncrementCoordinator;
use etcd_counter::memory_store::InMemoryCoordinationStore;
use etcd_counter::read_path::CounterReader;
use etcd_counter::CounterError;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

const KEY: &str = "key";
const LOCK: &str = "/distributed-lock/";

fn replica(store: &InMemoryCoordinationStore, pod: &str) -> Arc<ServiceContext> {
    ServiceContext::new(
        Arc::new(store.clone()),
        ReplicaIdentity::new(pod, "node-1"),
        KEY,
        LOCK,
    )
}

#[tokio::test]
async fn test_increment_from_existing_value() {
    let store = InMemoryCoordinationStore::new();
    store.insert(KEY, "3");
    let context = replica(&store, "pod-a");

    let value = IncrementCoordinator::new(Arc::clone(&context))
        .increment()
        .await
        .unwrap();

    assert_eq!(value, 4);
    assert_eq!(store.raw_value(KEY), Some(b"4".to_vec()));
    assert_eq!(context.local_value(), 4);

    let read = CounterReader::new(Arc::clone(&context)).read().await.unwrap();
    assert_eq!(read, 4);

    assert_eq!(store.lock_acquisitions(), 1);
    assert_eq!(store.unlock_count(), 1);
    assert_eq!(store.held_locks(), 0);
}

#[tokio::test]
async fn test_increment_starts_from_zero_on_absent_or_dirty_value() {
    let store = InMemoryCoordinationStore::new();
    let coordinator = IncrementCoordinator::new(replica(&store, "pod-a"));

    assert_eq!(coordinator.increment().await.unwrap(), 1);

    store.insert(KEY, "garbage");
    assert_eq!(coordinator.increment().await.unwrap(), 1);

    store.insert(KEY, "v41\n");
    assert_eq!(coordinator.increment().await.unwrap(), 42);
    assert_eq!(store.raw_value(KEY), Some(b"42".to_vec()));
}

#[tokio::test]
async fn test_concurrent_increments_across_replicas_lose_no_updates() {
    let store = InMemoryCoordinationStore::new();
    store.insert(KEY, "10");
    // Widen the window between read and write
    store.set_latency(Duration::from_millis(1));

    let replicas: Vec<Arc<IncrementCoordinator>> = (0..4)
        .map(|i| Arc::new(IncrementCoordinator::new(replica(&store, &format!("pod-{}", i)))))
        .collect();

    let mut tasks = JoinSet::new();
    for n in 0..40 {
        let coordinator = Arc::clone(&replicas[n % replicas.len()]);
        tasks.spawn(async move { coordinator.increment().await });
    }

    let mut returned = Vec::new();
    while let Some(result) = tasks.join_next().await {
        returned.push(result.unwrap().unwrap());
    }

    assert_eq!(store.raw_value(KEY), Some(b"50".to_vec()));
    assert_eq!(store.max_concurrent_holders(), 1);
    assert_eq!(store.held_locks(), 0);

    let expected: Vec<String> = (11..=50).map(|v| v.to_string()).collect();
    assert_eq!(store.write_history(KEY), expected);

    returned.sort_unstable();
    assert_eq!(returned, (11..=50).collect::<Vec<u64>>());
}

#[tokio::test]
async fn test_lock_failure_leaves_value_unchanged() {
    let store = InMemoryCoordinationStore::new();
    store.insert(KEY, "7");
    store.fail_locks(true);
    let context = replica(&store, "pod-a");

    let result = IncrementCoordinator::new(Arc::clone(&context)).increment().await;

    match result {
        Err(CounterError::LockAcquisitionFailed(msg)) => {
            assert!(msg.contains("pod-a"));
            assert!(msg.contains("node-1"));
            assert!(msg.contains("local count value is: 0"));
        }
        other => panic!("expected lock acquisition failure, got {:?}", other),
    }
    assert_eq!(store.raw_value(KEY), Some(b"7".to_vec()));
    assert_eq!(store.get_count(), 0);
    assert_eq!(store.put_count(), 0);
}

#[tokio::test]
async fn test_read_failure_releases_lock_without_writing() {
    let store = InMemoryCoordinationStore::new();
    store.insert(KEY, "7");
    store.fail_gets(true);
    let coordinator = IncrementCoordinator::new(replica(&store, "pod-a"));

    let result = coordinator.increment().await;
    assert!(matches!(result, Err(CounterError::StoreUnavailable(_))));
    assert_eq!(store.put_count(), 0);
    assert_eq!(store.unlock_count(), 1);
    assert_eq!(store.held_locks(), 0);

    store.fail_gets(false);
    assert_eq!(coordinator.increment().await.unwrap(), 8);
}

#[tokio::test]
async fn test_write_failure_releases_lock_for_other_replicas() {
    let store = InMemoryCoordinationStore::new();
    store.insert(KEY, "7");
    store.fail_puts(true);
    let failing = replica(&store, "pod-a");

    let result = IncrementCoordinator::new(Arc::clone(&failing)).increment().await;
    assert!(matches!(result, Err(CounterError::StoreUnavailable(_))));
    assert_eq!(store.raw_value(KEY), Some(b"7".to_vec()));
    assert_eq!(store.held_locks(), 0);
    // Nothing was committed, so the local value stays untouched
    assert_eq!(failing.local_value(), 0);

    store.fail_puts(false);
    let other = IncrementCoordinator::new(replica(&store, "pod-b"));
    let value = tokio::time::timeout(Duration::from_secs(1), other.increment())
        .await
        .expect("lock must be free after a failed write")
        .unwrap();
    assert_eq!(value, 8);
}

#[tokio::test]
async fn test_failed_unlock_does_not_fail_committed_increment() {
    let store = InMemoryCoordinationStore::new();
    store.insert(KEY, "1");
    store.fail_unlocks(true);
    let context = replica(&store, "pod-a");

    let value = IncrementCoordinator::new(Arc::clone(&context))
        .increment()
        .await
        .unwrap();

    assert_eq!(value, 2);
    assert_eq!(context.local_value(), 2);
    assert_eq!(store.raw_value(KEY), Some(b"2".to_vec()));
}

#[tokio::test]
async fn test_overflowing_counter_is_not_written() {
    let store = InMemoryCoordinationStore::new();
    store.insert(KEY, u64::MAX.to_string());
    let coordinator = IncrementCoordinator::new(replica(&store, "pod-a"));

    assert!(matches!(
        coordinator.increment().await,
        Err(CounterError::Internal(_))
    ));
    assert_eq!(store.put_count(), 0);
    assert_eq!(store.held_locks(), 0);
}

#[tokio::test]
async fn test_with_lock_releases_once_on_error() {
    let store = InMemoryCoordinationStore::new();
    let coordinator = IncrementCoordinator::new(replica(&store, "pod-a"));

    let result: Result<(), CounterError> = coordinator
        .with_lock(|| async { Err(CounterError::Internal("boom".to_string())) })
        .await;

    assert!(result.is_err());
    assert_eq!(store.lock_acquisitions(), 1);
    assert_eq!(store.unlock_count(), 1);
    assert_eq!(store.held_locks(), 0);
}

#[tokio::test]
async fn test_read_is_not_blocked_by_held_lock() {
    let store = InMemoryCoordinationStore::new();
    store.insert(KEY, "5");
    let reader = CounterReader::new(replica(&store, "pod-a"));

    // Another replica sits inside its critical section
    let token = store.lock(LOCK).await.unwrap();

    let value = tokio::time::timeout(Duration::from_millis(500), reader.read())
        .await
        .expect("read must not wait for the increment lock")
        .unwrap();
    assert_eq!(value, 5);

    store.unlock(token).await.unwrap();
}

#[tokio::test]
async fn test_reads_during_concurrent_increment_see_before_or_after() {
    let store = InMemoryCoordinationStore::new();
    store.insert(KEY, "3");
    store.set_latency(Duration::from_millis(20));

    let coordinator = Arc::new(IncrementCoordinator::new(replica(&store, "pod-a")));
    let reader = CounterReader::new(replica(&store, "pod-b"));

    let writer = {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move { coordinator.increment().await })
    };

    let raced = reader.read().await.unwrap();
    assert!(raced == 3 || raced == 4);

    assert_eq!(writer.await.unwrap().unwrap(), 4);
    assert_eq!(reader.read().await.unwrap(), 4);
}

#[tokio::test]
async fn test_read_failure_does_not_fall_back_to_local_value() {
    let store = InMemoryCoordinationStore::new();
    let context = replica(&store, "pod-a");
    IncrementCoordinator::new(Arc::clone(&context))
        .increment()
        .await
        .unwrap();
    assert_eq!(context.local_value(), 1);

    store.fail_gets(true);
    let result = CounterReader::new(context).read().await;
    assert!(matches!(result, Err(CounterError::StoreUnavailable(_))));
}

#[tokio::test]
async fn test_store_errors_are_not_double_wrapped() {
    let store = InMemoryCoordinationStore::new();
    store.insert(KEY, "7");
    let context = replica(&store, "pod-a");

    store.fail_gets(true);
    let read = CounterReader::new(Arc::clone(&context)).read().await.unwrap_err();
    let increment = IncrementCoordinator::new(Arc::clone(&context))
        .increment()
        .await
        .unwrap_err();

    store.fail_gets(false);
    store.fail_puts(true);
    let write = IncrementCoordinator::new(context).increment().await.unwrap_err();

    for err in [read, increment, write] {
        let text = err.to_string();
        assert!(matches!(err, CounterError::StoreUnavailable(_)), "{}", text);
        assert_eq!(text.matches("Store unavailable").count(), 1, "{}", text);
    }
}

//! In-Memory Coordination Store
//!
//! A process-local `CoordinationClient` used to run replicas without etcd. Every clone of
//! an `InMemoryCoordinationStore` shares the same keys and locks, so several service
//! contexts built from clones behave like replicas of one deployment.
//!
//! Faults can be injected per operation and every committed write is recorded, which is
//! what the lost-update tests assert against.

use crate::coordination::{CoordinationClient, LockToken};
use crate::{CounterError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Which operations should fail
#[derive(Debug, Default)]
struct FaultConfig {
    fail_get: AtomicBool,
    fail_put: AtomicBool,
    fail_lock: AtomicBool,
    fail_unlock: AtomicBool,
    fail_members: AtomicBool,
}

#[derive(Debug, Default)]
struct Counters {
    gets: AtomicUsize,
    puts: AtomicUsize,
    lock_acquisitions: AtomicUsize,
    unlocks: AtomicUsize,
    closes: AtomicUsize,
    holders: AtomicUsize,
    max_holders: AtomicUsize,
}

#[derive(Debug, Default)]
struct Inner {
    data: Mutex<HashMap<String, Vec<u8>>>,
    locks: Mutex<HashMap<String, Arc<Semaphore>>>,
    held: Mutex<HashMap<Vec<u8>, OwnedSemaphorePermit>>,
    writes: Mutex<Vec<(String, String)>>,
    next_token: AtomicU64,
    latency_ms: AtomicU64,
    members: AtomicUsize,
    closed: AtomicBool,
    faults: FaultConfig,
    counters: Counters,
}

/// Shared in-memory store; clones are handles onto the same state
#[derive(Debug, Clone)]
pub struct InMemoryCoordinationStore {
    inner: Arc<Inner>,
}

impl Default for InMemoryCoordinationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCoordinationStore {
    /// Create an empty store reporting three members
    pub fn new() -> Self {
        let inner = Inner::default();
        inner.members.store(3, Ordering::SeqCst);
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Seed a raw value
    pub fn insert(&self, key: &str, value: impl Into<Vec<u8>>) {
        self.data().insert(key.to_string(), value.into());
    }

    /// Raw value currently stored, bypassing fault injection
    pub fn raw_value(&self, key: &str) -> Option<Vec<u8>> {
        self.data().get(key).cloned()
    }

    /// Committed writes for `key`, in commit order
    pub fn write_history(&self, key: &str) -> Vec<String> {
        self.inner
            .writes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
            .collect()
    }

    /// Delay applied to every get and put, to widen race windows
    pub fn set_latency(&self, latency: Duration) {
        self.inner
            .latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_member_count(&self, members: usize) {
        self.inner.members.store(members, Ordering::SeqCst);
    }

    pub fn fail_gets(&self, fail: bool) {
        self.inner.faults.fail_get.store(fail, Ordering::SeqCst);
    }

    pub fn fail_puts(&self, fail: bool) {
        self.inner.faults.fail_put.store(fail, Ordering::SeqCst);
    }

    pub fn fail_locks(&self, fail: bool) {
        self.inner.faults.fail_lock.store(fail, Ordering::SeqCst);
    }

    pub fn fail_unlocks(&self, fail: bool) {
        self.inner.faults.fail_unlock.store(fail, Ordering::SeqCst);
    }

    pub fn fail_members(&self, fail: bool) {
        self.inner.faults.fail_members.store(fail, Ordering::SeqCst);
    }

    /// Simulate the store becoming unreachable for every operation
    pub fn set_unreachable(&self, unreachable: bool) {
        self.fail_gets(unreachable);
        self.fail_puts(unreachable);
        self.fail_locks(unreachable);
        self.fail_unlocks(unreachable);
        self.fail_members(unreachable);
    }

    pub fn get_count(&self) -> usize {
        self.inner.counters.gets.load(Ordering::SeqCst)
    }

    pub fn put_count(&self) -> usize {
        self.inner.counters.puts.load(Ordering::SeqCst)
    }

    pub fn lock_acquisitions(&self) -> usize {
        self.inner.counters.lock_acquisitions.load(Ordering::SeqCst)
    }

    pub fn unlock_count(&self) -> usize {
        self.inner.counters.unlocks.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.inner.counters.closes.load(Ordering::SeqCst)
    }

    /// Locks currently held across all names
    pub fn held_locks(&self) -> usize {
        self.inner.held.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Highest number of simultaneous holders ever observed for any single lock
    pub fn max_concurrent_holders(&self) -> usize {
        self.inner.counters.max_holders.load(Ordering::SeqCst)
    }

    fn data(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>> {
        self.inner.data.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn semaphore(&self, name: &str) -> Arc<Semaphore> {
        let mut locks = self.inner.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone()
    }

    fn check_fault(&self, flag: &AtomicBool, operation: &str) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(CounterError::StoreUnavailable(format!(
                "{}: client is closed",
                operation
            )));
        }
        if flag.load(Ordering::SeqCst) {
            return Err(CounterError::StoreUnavailable(format!(
                "{}: simulated store failure",
                operation
            )));
        }
        Ok(())
    }

    async fn simulate_latency(&self) {
        let latency = self.inner.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
    }
}

#[async_trait]
impl CoordinationClient for InMemoryCoordinationStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check_fault(&self.inner.faults.fail_get, "get")?;
        self.simulate_latency().await;
        self.inner.counters.gets.fetch_add(1, Ordering::SeqCst);
        Ok(self.data().get(key).cloned())
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        self.check_fault(&self.inner.faults.fail_put, "put")?;
        self.simulate_latency().await;
        self.inner.counters.puts.fetch_add(1, Ordering::SeqCst);

        // Record under the data lock so history order matches commit order
        let mut data = self.data();
        data.insert(key.to_string(), value.as_bytes().to_vec());
        self.inner
            .writes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((key.to_string(), value.to_string()));
        Ok(())
    }

    async fn lock(&self, name: &str) -> Result<LockToken> {
        self.check_fault(&self.inner.faults.fail_lock, "lock")?;

        let permit = self
            .semaphore(name)
            .acquire_owned()
            .await
            .map_err(|e| CounterError::StoreUnavailable(format!("lock {}: {}", name, e)))?;

        let counters = &self.inner.counters;
        let holders = counters.holders.fetch_add(1, Ordering::SeqCst) + 1;
        counters.max_holders.fetch_max(holders, Ordering::SeqCst);
        counters.lock_acquisitions.fetch_add(1, Ordering::SeqCst);

        let id = self.inner.next_token.fetch_add(1, Ordering::SeqCst);
        let key = format!("{}{:x}", name, id).into_bytes();
        self.inner
            .held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.clone(), permit);

        Ok(LockToken::new(name, key))
    }

    async fn unlock(&self, token: LockToken) -> Result<()> {
        // A failed unlock leaves the lock held, as a lost connection would until lease expiry
        self.check_fault(&self.inner.faults.fail_unlock, "unlock")?;

        let permit = self
            .inner
            .held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(token.key());

        match permit {
            Some(permit) => {
                self.inner.counters.holders.fetch_sub(1, Ordering::SeqCst);
                self.inner.counters.unlocks.fetch_add(1, Ordering::SeqCst);
                drop(permit);
                Ok(())
            }
            None => Err(CounterError::StoreUnavailable(format!(
                "unlock {}: lock is not held",
                token.name()
            ))),
        }
    }

    async fn member_count(&self) -> Result<usize> {
        self.check_fault(&self.inner.faults.fail_members, "member_list")?;
        Ok(self.inner.members.load(Ordering::SeqCst))
    }

    async fn close(&self) -> Result<()> {
        self.inner.counters.closes.fetch_add(1, Ordering::SeqCst);
        self.inner.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_clones_share_state() {
        let store = InMemoryCoordinationStore::new();
        let replica = store.clone();

        store.put("key", "5").await.unwrap();
        assert_eq!(replica.get("key").await.unwrap(), Some(b"5".to_vec()));
        assert_eq!(replica.write_history("key"), vec!["5".to_string()]);
    }

    #[tokio::test]
    async fn test_lock_excludes_second_holder() {
        let store = InMemoryCoordinationStore::new();
        let token = store.lock("/lock/").await.unwrap();

        let contender = store.clone();
        let waiting = tokio::spawn(async move { contender.lock("/lock/").await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiting.is_finished());

        store.unlock(token).await.unwrap();
        let second = tokio::time::timeout(Duration::from_secs(1), waiting)
            .await
            .expect("second holder should be granted after release")
            .unwrap()
            .unwrap();
        store.unlock(second).await.unwrap();

        assert_eq!(store.max_concurrent_holders(), 1);
        assert_eq!(store.held_locks(), 0);
    }

    #[tokio::test]
    async fn test_closed_store_rejects_operations() {
        let store = InMemoryCoordinationStore::new();
        store.close().await.unwrap();
        store.close().await.unwrap();

        assert_eq!(store.close_count(), 2);
        assert!(matches!(
            store.get("key").await,
            Err(CounterError::StoreUnavailable(_))
        ));
    }
}

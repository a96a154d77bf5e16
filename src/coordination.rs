//! Coordination Client
//!
//! The contract the counter core needs from the external coordination store: plain key
//! reads and writes, a named distributed lock, a membership probe and a close hook.
//! `etcd_store` implements it against etcd; `memory_store` implements it in-process.

use crate::Result;
use async_trait::async_trait;
use tokio::task::JoinHandle;

/// Proof of ownership of a distributed lock, handed back to `unlock`.
///
/// Dropping a token without unlocking stops any lease keep-alive attached to it, so the
/// store reclaims the lock once the lease expires.
#[derive(Debug)]
pub struct LockToken {
    name: String,
    key: Vec<u8>,
    lease_id: Option<i64>,
    keepalive: Option<JoinHandle<()>>,
}

impl LockToken {
    /// Create a token for a lock that is not bound to a lease
    pub fn new(name: impl Into<String>, key: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            key: key.into(),
            lease_id: None,
            keepalive: None,
        }
    }

    /// Bind the token to the lease that backs the lock
    pub fn with_lease(mut self, lease_id: i64, keepalive: Option<JoinHandle<()>>) -> Self {
        self.lease_id = Some(lease_id);
        self.keepalive = keepalive;
        self
    }

    /// Lock name the token was issued for
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Store-side ownership key
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn lease_id(&self) -> Option<i64> {
        self.lease_id
    }
}

impl Drop for LockToken {
    fn drop(&mut self) {
        if let Some(keepalive) = self.keepalive.take() {
            keepalive.abort();
        }
    }
}

/// Operations the counter core performs against the coordination store.
///
/// Implementations must be safe to share between concurrent requests.
#[async_trait]
pub trait CoordinationClient: Send + Sync {
    /// Read the raw value under `key`, `None` when the key does not exist
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Write `value` under `key`
    async fn put(&self, key: &str, value: &str) -> Result<()>;

    /// Block until the named lock is granted.
    ///
    /// Contention only delays the call; an error means the store could not be reached.
    async fn lock(&self, name: &str) -> Result<LockToken>;

    /// Release a lock obtained from `lock`
    async fn unlock(&self, token: LockToken) -> Result<()>;

    /// Number of members in the store cluster
    async fn member_count(&self) -> Result<usize>;

    /// Close the connection. Closing twice is not an error.
    async fn close(&self) -> Result<()>;
}

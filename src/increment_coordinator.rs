//! Increment Coordinator
//!
//! Runs the coordinated increment: take the distributed lock, read the counter, write the
//! successor, release the lock. The lock is held across the whole read-modify-write so
//! no two replicas can interleave inside it, and it is released exactly once whatever the
//! critical section returns.

use crate::context::ServiceContext;
use crate::counter_codec;
use crate::{CounterError, Result};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct IncrementCoordinator {
    context: Arc<ServiceContext>,
}

impl IncrementCoordinator {
    pub fn new(context: Arc<ServiceContext>) -> Self {
        Self { context }
    }

    /// Run `body` while holding the counter lock.
    ///
    /// The lock is released once after `body` finishes, on success and on error. A failed
    /// release is logged and does not change the result: the lease bounds the lock.
    pub async fn with_lock<T, F, Fut>(&self, body: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let identity = self.context.identity();
        let client = self.context.client();
        let lock_name = self.context.lock_name();

        debug!("Trying to acquire lock {} for {}", lock_name, identity.pod_name);
        let token = client.lock(lock_name).await.map_err(|e| {
            warn!("Cannot acquire lock {} for {}: {}", lock_name, identity.pod_name, e);
            CounterError::LockAcquisitionFailed(format!(
                "cannot acquire lock in etcd. My pod name is: `{}`, my node name is: `{}`, \
                 global counter value is unknown, local count value is: {} ({})",
                identity.pod_name,
                identity.node_name,
                self.context.local_value(),
                e
            ))
        })?;
        debug!("Acquired lock {} for {}", lock_name, identity.pod_name);

        let outcome = body().await;

        match client.unlock(token).await {
            Ok(()) => debug!("Released lock {} for {}", lock_name, identity.pod_name),
            Err(e) => warn!(
                "Failed to release lock {} for {}, leaving it to lease expiry: {}",
                lock_name, identity.pod_name, e
            ),
        }

        outcome
    }

    /// Increment the shared counter by one and return the committed value
    pub async fn increment(&self) -> Result<u64> {
        let Some(_in_flight) = self.context.lifecycle().begin_increment() else {
            return Err(CounterError::ShuttingDown(
                "replica is draining, not starting new increments".to_string(),
            ));
        };

        let client = self.context.client();
        let key = self.context.counter_key();

        let committed = self
            .with_lock(|| async move {
                let raw = client.get(key).await.map_err(|e| {
                    CounterError::StoreUnavailable(format!("error fetching counter: {}", e.message()))
                })?;
                let stored = counter_codec::parse(raw.as_deref());

                let next = stored.checked_add(1).ok_or_else(|| {
                    CounterError::Internal(format!("counter value {} cannot be incremented", stored))
                })?;

                client
                    .put(key, &counter_codec::encode(next))
                    .await
                    .map_err(|e| {
                        CounterError::StoreUnavailable(format!(
                            "increment was not committed, counter left at {}: {}",
                            stored,
                            e.message()
                        ))
                    })?;

                Ok(next)
            })
            .await?;

        self.context.set_local_value(committed);
        info!(
            "Counter incremented to {} by {}",
            committed,
            self.context.identity().pod_name
        );
        Ok(committed)
    }
}

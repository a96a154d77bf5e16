//! Service Context
//!
//! The single process-scoped object holding everything that is shared between requests:
//! the coordination client, the replica identity, the key and lock names, the local
//! cached counter value and the shutdown lifecycle.

use crate::config::Config;
use crate::coordination::CoordinationClient;
use crate::shutdown::Lifecycle;
use crate::Result;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Identity of this replica, used for response attribution and logging only
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaIdentity {
    pub pod_name: String,
    pub node_name: String,
}

impl ReplicaIdentity {
    pub fn new(pod_name: impl Into<String>, node_name: impl Into<String>) -> Self {
        Self {
            pod_name: pod_name.into(),
            node_name: node_name.into(),
        }
    }
}

impl Default for ReplicaIdentity {
    fn default() -> Self {
        Self::new("unknown", "unknown")
    }
}

pub struct ServiceContext {
    client: Arc<dyn CoordinationClient>,
    identity: ReplicaIdentity,
    counter_key: String,
    lock_name: String,
    local_value: AtomicU64,
    lifecycle: Arc<Lifecycle>,
}

impl ServiceContext {
    /// Build the context from loaded configuration and a connected client
    pub fn init(config: &Config, client: Arc<dyn CoordinationClient>) -> Arc<Self> {
        let identity = ReplicaIdentity::new(
            config.identity.pod_name.clone(),
            config.identity.node_name.clone(),
        );
        info!(
            "Replica identity: pod={}, node={}",
            identity.pod_name, identity.node_name
        );
        Self::new(
            client,
            identity,
            config.coordination.counter_key.clone(),
            config.coordination.lock_name.clone(),
        )
    }

    pub fn new(
        client: Arc<dyn CoordinationClient>,
        identity: ReplicaIdentity,
        counter_key: impl Into<String>,
        lock_name: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            client,
            identity,
            counter_key: counter_key.into(),
            lock_name: lock_name.into(),
            local_value: AtomicU64::new(0),
            lifecycle: Arc::new(Lifecycle::new()),
        })
    }

    pub fn client(&self) -> &Arc<dyn CoordinationClient> {
        &self.client
    }

    pub fn identity(&self) -> &ReplicaIdentity {
        &self.identity
    }

    pub fn counter_key(&self) -> &str {
        &self.counter_key
    }

    pub fn lock_name(&self) -> &str {
        &self.lock_name
    }

    pub fn lifecycle(&self) -> &Arc<Lifecycle> {
        &self.lifecycle
    }

    /// Last value this replica committed; best-effort display data
    pub fn local_value(&self) -> u64 {
        self.local_value.load(Ordering::Relaxed)
    }

    pub(crate) fn set_local_value(&self, value: u64) {
        self.local_value.store(value, Ordering::Relaxed);
    }

    /// Close the coordination client.
    ///
    /// Returns `Ok(false)` without touching the client when it was already closed.
    pub async fn teardown(&self) -> Result<bool> {
        if !self.lifecycle.mark_closed() {
            debug!("Service context already torn down");
            return Ok(false);
        }

        info!("Closing coordination client");
        self.client.close().await?;
        Ok(true)
    }
}

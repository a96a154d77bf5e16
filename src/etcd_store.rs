//! etcd Coordination Store
//!
//! `CoordinationClient` backed by etcd v3. Every lock is bound to a fresh lease which is
//! kept alive while the lock is held and revoked on release, so a replica that dies while
//! holding the lock only blocks others until the lease TTL runs out.

use crate::config::CoordinationConfig;
use crate::coordination::{CoordinationClient, LockToken};
use crate::{CounterError, Result};
use async_trait::async_trait;
use etcd_client::{Client, ConnectOptions, LockOptions};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Keep-alive task for a lease whose lock has not been granted yet.
///
/// Aborts the task when dropped, so an abandoned lock wait stops renewing the lease.
struct KeepAliveGuard(Option<JoinHandle<()>>);

impl KeepAliveGuard {
    fn new(handle: JoinHandle<()>) -> Self {
        Self(Some(handle))
    }

    /// Hand the task over to the lock token
    fn disarm(mut self) -> Option<JoinHandle<()>> {
        self.0.take()
    }
}

impl Drop for KeepAliveGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            handle.abort();
        }
    }
}

/// etcd-backed coordination client
pub struct EtcdCoordinationClient {
    client: RwLock<Option<Client>>,
    endpoints: Vec<String>,
    lease_ttl: Duration,
}

impl EtcdCoordinationClient {
    /// Connect to the configured endpoints
    pub async fn connect(config: &CoordinationConfig) -> Result<Self> {
        info!("Connecting to etcd endpoints: {:?}", config.endpoints);

        let mut options = ConnectOptions::new().with_connect_timeout(config.connect_timeout);
        if let Some(request_timeout) = config.request_timeout {
            options = options.with_timeout(request_timeout);
        }

        let client = Client::connect(&config.endpoints, Some(options))
            .await
            .map_err(|e| {
                CounterError::StoreUnavailable(format!(
                    "Failed to connect to etcd {:?}: {}",
                    config.endpoints, e
                ))
            })?;

        Ok(Self {
            client: RwLock::new(Some(client)),
            endpoints: config.endpoints.clone(),
            lease_ttl: config.lease_ttl,
        })
    }

    /// Clone of the live client handle; fails once the connection has been closed
    async fn handle(&self) -> Result<Client> {
        self.client.read().await.clone().ok_or_else(|| {
            CounterError::StoreUnavailable(format!(
                "etcd client for {:?} is closed",
                self.endpoints
            ))
        })
    }

    fn lease_ttl_secs(&self) -> i64 {
        self.lease_ttl.as_secs().max(1) as i64
    }

    /// Refresh the lease at a third of its TTL until aborted or the stream breaks
    async fn spawn_keepalive(&self, client: &mut Client, lease_id: i64) -> Result<JoinHandle<()>> {
        let (mut keeper, mut stream) = client.lease_keep_alive(lease_id).await?;
        let period = (self.lease_ttl / 3).max(Duration::from_millis(500));

        Ok(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately; the lease was just granted
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = keeper.keep_alive().await {
                    warn!("Lease keep-alive failed: lease={:x}, error={}", lease_id, e);
                    break;
                }
                match stream.message().await {
                    Ok(Some(resp)) if resp.ttl() > 0 => {
                        debug!("Lease refreshed: lease={:x}, ttl={}s", lease_id, resp.ttl());
                    }
                    Ok(_) => {
                        warn!("Lease expired while lock was held: lease={:x}", lease_id);
                        break;
                    }
                    Err(e) => {
                        warn!("Lease keep-alive stream failed: lease={:x}, error={}", lease_id, e);
                        break;
                    }
                }
            }
        }))
    }

    async fn revoke_lease(client: &mut Client, lease_id: i64) {
        if let Err(e) = client.lease_revoke(lease_id).await {
            warn!("Failed to revoke lease {:x}: {}", lease_id, e);
        }
    }
}

#[async_trait]
impl CoordinationClient for EtcdCoordinationClient {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut client = self.handle().await?;
        let resp = client.get(key, None).await?;

        let value = resp.kvs().first().map(|kv| kv.value().to_vec());
        if let Some(header) = resp.header() {
            debug!(
                "Read key={} value={:?} revision={}",
                key,
                value.as_deref().map(String::from_utf8_lossy),
                header.revision()
            );
        }
        Ok(value)
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        let mut client = self.handle().await?;
        let resp = client.put(key, value, None).await?;
        if let Some(header) = resp.header() {
            debug!("Wrote key={} value={} revision={}", key, value, header.revision());
        }
        Ok(())
    }

    async fn lock(&self, name: &str) -> Result<LockToken> {
        let mut client = self.handle().await?;

        let lease_id = client.lease_grant(self.lease_ttl_secs(), None).await?.id();
        let keepalive = match self.spawn_keepalive(&mut client, lease_id).await {
            Ok(handle) => KeepAliveGuard::new(handle),
            Err(e) => {
                Self::revoke_lease(&mut client, lease_id).await;
                return Err(e);
            }
        };

        match client
            .lock(name, Some(LockOptions::new().with_lease(lease_id)))
            .await
        {
            Ok(resp) => {
                Ok(LockToken::new(name, resp.key()).with_lease(lease_id, keepalive.disarm()))
            }
            Err(e) => {
                drop(keepalive);
                Self::revoke_lease(&mut client, lease_id).await;
                Err(e.into())
            }
        }
    }

    async fn unlock(&self, token: LockToken) -> Result<()> {
        let mut client = self.handle().await?;
        let result = client.unlock(token.key()).await;

        // Revoking the lease also removes the lock key if the unlock itself failed
        if let Some(lease_id) = token.lease_id() {
            Self::revoke_lease(&mut client, lease_id).await;
        }

        result.map(|_| ()).map_err(|e| {
            CounterError::StoreUnavailable(format!(
                "Failed to unlock {}: {}",
                token.name(),
                e
            ))
        })
    }

    async fn member_count(&self) -> Result<usize> {
        let mut client = self.handle().await?;
        let resp = client.member_list().await?;
        Ok(resp.members().len())
    }

    async fn close(&self) -> Result<()> {
        match self.client.write().await.take() {
            Some(_client) => {
                info!("Closing etcd client");
                Ok(())
            }
            None => {
                debug!("etcd client already closed");
                Ok(())
            }
        }
    }
}

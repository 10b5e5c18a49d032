//! PeerId to pool mapping on the client role.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use futures_util::future::join_all;
use tonic::transport::Channel;
use tracing::debug;

use crate::conn::Connection;
use crate::error::{BoxError, Error, Result};
use crate::opts::ClientConfig;
use crate::peer_id::PeerId;
use crate::pool::{Pool, PooledChannel};

/// Every peer that has ever dialed in, each with its own [`Pool`].
///
/// Pools are created on first contact and live as long as the registry.
pub struct Registry {
    pools: DashMap<PeerId, Arc<Pool>>,
    config: Arc<ClientConfig>,
}

impl Registry {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            pools: DashMap::new(),
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// File a handshaken socket under its peer, creating the pool if needed.
    pub async fn register(&self, peer_id: PeerId, conn: Connection) {
        // Clone the pool out so the map shard is not locked across the await.
        let pool = Arc::clone(
            self.pools
                .entry(peer_id.clone())
                .or_insert_with(|| Arc::new(Pool::new(peer_id, Arc::clone(&self.config))))
                .value(),
        );
        pool.put_conn(conn).await;
    }

    pub fn pool(&self, peer_id: &str) -> Option<Arc<Pool>> {
        self.pools.get(peer_id).map(|pool| Arc::clone(pool.value()))
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.pools.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    /// Acquire a channel to one peer.
    pub async fn dial(&self, peer_id: &str) -> Result<PooledChannel> {
        let pool = self
            .pool(peer_id)
            .ok_or_else(|| Error::NotFound(peer_id.to_string()))?;
        pool.get().await.map_err(|e| Error::Dial {
            peer_id: pool.peer_id().clone(),
            source: Box::new(e),
        })
    }

    /// Run `f` against every known peer concurrently and wait for all of them.
    ///
    /// Each peer gets a fresh channel that is handed back afterwards. Acquire
    /// failures and errors returned by `f` are logged, not returned.
    pub async fn each<F, Fut>(&self, f: F)
    where
        F: Fn(PeerId, Channel) -> Fut,
        Fut: Future<Output = std::result::Result<(), BoxError>>,
    {
        let pools: Vec<Arc<Pool>> = self
            .pools
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        debug!(peers = pools.len(), "Broadcasting to peers");

        let f = &f;
        join_all(pools.into_iter().map(|pool| async move {
            let channel = match pool.get().await {
                Ok(channel) => channel,
                Err(e) => {
                    log_event!(self.config.log, warn, "dial {} failed: {}", pool.peer_id(), e);
                    return;
                }
            };

            let result = f(pool.peer_id().clone(), channel.channel().clone()).await;
            if let Err(e) = &result {
                log_event!(
                    self.config.log,
                    warn,
                    "callback for {} failed: {}",
                    pool.peer_id(),
                    e
                );
            }
            pool.put(channel, result.as_ref().err().map(|e| &**e)).await;
        }))
        .await;
    }

    /// Hand a channel back to its peer's pool.
    ///
    /// Fails with [`Error::NotFound`] if the peer is unknown; the channel is
    /// dropped in that case.
    pub async fn put(
        &self,
        channel: PooledChannel,
        error: Option<&(dyn std::error::Error + Send + Sync)>,
    ) -> Result<()> {
        let pool = self
            .pool(channel.peer_id().as_str())
            .ok_or_else(|| Error::NotFound(channel.peer_id().to_string()))?;
        pool.put(channel, error).await;
        Ok(())
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("peers", &self.pools.len())
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::served_connection;
    use std::sync::Mutex;
    use std::time::Duration;
    use tonic_health::pb::health_client::HealthClient;
    use tonic_health::pb::HealthCheckRequest;

    fn fast_config() -> ClientConfig {
        ClientConfig {
            acquire_attempts: 2,
            acquire_poll_interval: Duration::from_millis(10),
            ..Default::default()
        }
    }

    fn peer(id: &str) -> PeerId {
        PeerId::new(id).unwrap()
    }

    #[tokio::test]
    async fn test_concurrent_register_shares_one_pool() {
        let registry = Arc::new(Registry::new(fast_config()));
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move {
                    let (a, b) = tokio::io::duplex(8);
                    registry.register(peer("edge-1"), Connection::new(a)).await;
                    b
                })
            })
            .collect();
        // Keep the far ends open so no socket looks closed.
        let mut peers = Vec::new();
        for task in tasks {
            peers.push(task.await.unwrap());
        }

        assert_eq!(registry.len(), 1);
        let pool = registry.pool("edge-1").unwrap();
        assert_eq!(pool.idle_counts().await, (8, 0));
    }

    #[tokio::test]
    async fn test_unknown_peer() {
        let registry = Registry::new(fast_config());
        let err = registry.dial("ghost").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(ref id) if id == "ghost"));
        assert_eq!(err.to_string(), "connection point to ghost not found");
    }

    #[tokio::test]
    async fn test_dial_wraps_exhaustion() {
        let registry = Registry::new(fast_config());
        registry
            .register(peer("edge-1"), served_connection())
            .await;
        registry.dial("edge-1").await.unwrap();

        let err = registry.dial("edge-1").await.unwrap_err();
        assert!(matches!(err, Error::Dial { .. }));
        assert!(err.is_unavailable());
        assert_eq!(err.to_string(), "dial edge-1: no connection to edge-1");
    }

    #[tokio::test]
    async fn test_put_routes_by_peer_id() {
        let registry = Registry::new(fast_config());
        registry
            .register(peer("edge-1"), served_connection())
            .await;
        let channel = registry.dial("edge-1").await.unwrap();

        registry.put(channel, None).await.unwrap();
        let pool = registry.pool("edge-1").unwrap();
        assert_eq!(pool.idle_counts().await, (0, 1));

        let other = Registry::new(fast_config());
        other
            .register(peer("edge-2"), served_connection())
            .await;
        let stray = other.dial("edge-2").await.unwrap();
        assert!(matches!(
            registry.put(stray, None).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_each_reaches_every_peer() {
        let registry = Registry::new(fast_config());
        for id in ["edge-1", "edge-2", "edge-3"] {
            registry.register(peer(id), served_connection()).await;
        }
        // A known peer with no sockets left only logs.
        registry.register(peer("edge-4"), served_connection()).await;
        registry.dial("edge-4").await.unwrap();

        let seen = Mutex::new(Vec::new());
        registry
            .each(|id, channel| {
                let seen = &seen;
                async move {
                    HealthClient::new(channel)
                        .check(HealthCheckRequest {
                            service: String::new(),
                        })
                        .await?;
                    seen.lock().unwrap().push(id.to_string());
                    Ok::<(), BoxError>(())
                }
            })
            .await;

        let mut seen = seen.into_inner().unwrap();
        seen.sort();
        assert_eq!(seen, ["edge-1", "edge-2", "edge-3"]);
        assert_eq!(registry.peer_ids().len(), 4);
    }
}

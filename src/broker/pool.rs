//! Connection Pool
//!
//! Caches one connection per broker, shared by every route that talks to
//! that broker. Each route opens its own sessions on the shared connection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::{BrokerError, BrokerId, Connection, Connector};
use crate::bridge::BridgeError;
use crate::config::Config;

struct PoolEntry {
    connector: Arc<dyn Connector>,
    connect_timeout: Duration,
    /// Fast path for already established connections
    cached: RwLock<Option<Arc<dyn Connection>>>,
    /// Serializes connection creation for this broker
    connecting: Mutex<()>,
}

impl PoolEntry {
    fn live(&self) -> Option<Arc<dyn Connection>> {
        self.cached
            .read()
            .as_ref()
            .filter(|conn| conn.is_open())
            .cloned()
    }
}

/// One cached connection per broker
pub struct ConnectionPool {
    entries: HashMap<BrokerId, PoolEntry>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Build a pool for both configured brokers
    pub fn from_config(config: &Config) -> Self {
        Self::new()
            .with_broker(
                BrokerId::A,
                super::connector_from_config(&config.broker_a),
                config.broker_a.connect_timeout,
            )
            .with_broker(
                BrokerId::B,
                super::connector_from_config(&config.broker_b),
                config.broker_b.connect_timeout,
            )
    }

    /// Register the connector used for a broker
    pub fn with_broker(
        mut self,
        broker: BrokerId,
        connector: Arc<dyn Connector>,
        connect_timeout: Duration,
    ) -> Self {
        self.entries.insert(
            broker,
            PoolEntry {
                connector,
                connect_timeout,
                cached: RwLock::new(None),
                connecting: Mutex::new(()),
            },
        );
        self
    }

    /// Name of a registered broker, for logging
    pub fn broker_name(&self, broker: BrokerId) -> String {
        self.entries
            .get(&broker)
            .map(|e| e.connector.broker_name().to_string())
            .unwrap_or_else(|| broker.to_string())
    }

    /// Get the shared connection for `broker`, connecting on first use.
    ///
    /// Concurrent callers receive the same connection. A cached connection
    /// that is no longer open is replaced.
    pub async fn acquire(&self, broker: BrokerId) -> Result<Arc<dyn Connection>, BridgeError> {
        let entry = self.entries.get(&broker).ok_or_else(|| BridgeError::Connection {
            broker,
            cause: BrokerError::Other("broker not registered with the pool".to_string()),
        })?;

        if let Some(conn) = entry.live() {
            return Ok(conn);
        }

        let _guard = entry.connecting.lock().await;

        // Another caller may have connected while we waited
        if let Some(conn) = entry.live() {
            return Ok(conn);
        }

        if entry.cached.write().take().is_some() {
            debug!(
                "Pool: evicted broken connection to '{}'",
                entry.connector.broker_name()
            );
        }

        let conn = timeout(entry.connect_timeout, entry.connector.connect())
            .await
            .map_err(|_| BrokerError::Timeout)
            .and_then(|r| r)
            .map_err(|cause| BridgeError::Connection { broker, cause })?;

        info!(
            "Pool: connected to broker {} ('{}')",
            broker,
            entry.connector.broker_name()
        );
        *entry.cached.write() = Some(conn.clone());
        Ok(conn)
    }

    /// Evict `conn` after a failed use if it is still the cached connection
    /// for `broker` and is unusable: either it reports itself closed, or
    /// `failed` says an operation on it hit a connection-level error while
    /// it still claims to be open.
    ///
    /// Returns whether anything was evicted. A newer connection established
    /// by another route, or a healthy connection whose failure was local to
    /// one queue, is left in place.
    pub async fn evict(&self, broker: BrokerId, conn: &Arc<dyn Connection>, failed: bool) -> bool {
        let Some(entry) = self.entries.get(&broker) else {
            return false;
        };

        let evicted = {
            let mut cached = entry.cached.write();
            let unusable = matches!(
                cached.as_ref(),
                Some(current) if Arc::ptr_eq(current, conn) && (failed || !current.is_open())
            );
            if unusable {
                cached.take()
            } else {
                None
            }
        };

        match evicted {
            Some(conn) => {
                warn!(
                    "Pool: evicting connection to '{}'",
                    entry.connector.broker_name()
                );
                conn.close().await;
                true
            }
            None => false,
        }
    }

    /// Whether a connection to `broker` is currently cached
    pub fn is_cached(&self, broker: BrokerId) -> bool {
        self.entries
            .get(&broker)
            .map(|e| e.cached.read().is_some())
            .unwrap_or(false)
    }

    /// Close and forget every cached connection
    pub async fn close_all(&self) {
        for (broker, entry) in &self.entries {
            let conn = entry.cached.write().take();
            if let Some(conn) = conn {
                conn.close().await;
                debug!("Pool: closed connection to broker {}", broker);
            }
        }
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;

    fn pool_for(a: &MemoryBroker, b: &MemoryBroker) -> ConnectionPool {
        ConnectionPool::new()
            .with_broker(
                BrokerId::A,
                Arc::new(a.connector(None, None)),
                Duration::from_secs(1),
            )
            .with_broker(
                BrokerId::B,
                Arc::new(b.connector(None, None)),
                Duration::from_secs(1),
            )
    }

    #[tokio::test]
    async fn test_acquire_shares_connection() {
        let a = MemoryBroker::new("a");
        let b = MemoryBroker::new("b");
        let pool = Arc::new(pool_for(&a, &b));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            tasks.push(tokio::spawn(async move {
                pool.acquire(BrokerId::A).await.unwrap()
            }));
        }

        let mut conns = Vec::new();
        for task in tasks {
            conns.push(task.await.unwrap());
        }

        assert_eq!(a.connections_opened(), 1);
        assert!(conns.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert!(!pool.is_cached(BrokerId::B));
    }

    #[tokio::test]
    async fn test_broken_connection_replaced() {
        let a = MemoryBroker::new("a");
        let b = MemoryBroker::new("b");
        let pool = pool_for(&a, &b);

        let first = pool.acquire(BrokerId::A).await.unwrap();
        a.disconnect();
        let second = pool.acquire(BrokerId::A).await.unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
        assert!(second.is_open());
        assert_eq!(a.connections_opened(), 2);
    }

    #[tokio::test]
    async fn test_evict_ignores_stale_connection() {
        let a = MemoryBroker::new("a");
        let b = MemoryBroker::new("b");
        let pool = pool_for(&a, &b);

        let stale = pool.acquire(BrokerId::B).await.unwrap();
        b.disconnect();
        let fresh = pool.acquire(BrokerId::B).await.unwrap();

        assert!(!pool.evict(BrokerId::B, &stale, true).await);
        assert!(pool.is_cached(BrokerId::B));

        // Still healthy, stays cached
        assert!(!pool.evict(BrokerId::B, &fresh, false).await);
        assert!(pool.is_cached(BrokerId::B));

        b.disconnect();
        assert!(pool.evict(BrokerId::B, &fresh, false).await);
        assert!(!pool.is_cached(BrokerId::B));
    }

    #[tokio::test]
    async fn test_evict_failed_connection_that_claims_open() {
        let a = MemoryBroker::new("a");
        let b = MemoryBroker::new("b");
        let pool = pool_for(&a, &b);

        let hung = pool.acquire(BrokerId::A).await.unwrap();
        assert!(hung.is_open());

        assert!(pool.evict(BrokerId::A, &hung, true).await);
        assert!(!pool.is_cached(BrokerId::A));
        assert!(!hung.is_open());

        let fresh = pool.acquire(BrokerId::A).await.unwrap();
        assert!(!Arc::ptr_eq(&hung, &fresh));
        assert_eq!(a.connections_opened(), 2);
    }

    #[tokio::test]
    async fn test_acquire_failure_is_connection_error() {
        let a = MemoryBroker::new("a");
        let b = MemoryBroker::new("b");
        b.set_available(false);
        let pool = pool_for(&a, &b);

        match pool.acquire(BrokerId::B).await {
            Err(BridgeError::Connection { broker, cause }) => {
                assert_eq!(broker, BrokerId::B);
                assert!(matches!(cause, BrokerError::Unreachable(_)));
            }
            other => panic!("expected connection error, got {:?}", other.map(|_| ())),
        }
        assert!(!pool.is_cached(BrokerId::B));

        b.set_available(true);
        assert!(pool.acquire(BrokerId::B).await.is_ok());
    }

    #[tokio::test]
    async fn test_close_all() {
        let a = MemoryBroker::new("a");
        let b = MemoryBroker::new("b");
        let pool = pool_for(&a, &b);

        let conn = pool.acquire(BrokerId::A).await.unwrap();
        pool.close_all().await;
        assert!(!conn.is_open());
        assert!(!pool.is_cached(BrokerId::A));
    }
}

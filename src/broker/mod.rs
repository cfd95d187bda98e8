//! Broker Client Interface
//!
//! Abstractions over the two queueing brokers the bridge talks to. A
//! [`Connector`] produces authenticated [`Connection`]s; a connection
//! multiplexes transacted [`Session`]s; a session owns the [`Consumer`]s
//! and [`Producer`]s bound through it, and its `commit`/`rollback` covers
//! every receive and send made through them since the last commit.
//!
//! Concrete clients plug in behind these traits. The in-process
//! [`MemoryBroker`] implements them for local runs and tests.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

mod error;
mod memory;
mod message;
mod pool;

pub use error::{BrokerError, Result};
pub use memory::{MemoryBroker, MemoryConnector};
pub use message::{Message, MessageBody, Payload};
pub use pool::ConnectionPool;

use crate::config::{BrokerConfig, BrokerKind};

/// Identity of one of the two bridged brokers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BrokerId {
    A,
    B,
}

impl BrokerId {
    /// The broker on the other side of the bridge
    pub fn other(self) -> BrokerId {
        match self {
            BrokerId::A => BrokerId::B,
            BrokerId::B => BrokerId::A,
        }
    }
}

impl fmt::Display for BrokerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerId::A => write!(f, "A"),
            BrokerId::B => write!(f, "B"),
        }
    }
}

/// Creates connections to one broker
#[async_trait]
pub trait Connector: Send + Sync {
    /// Human-readable broker name, used in logs
    fn broker_name(&self) -> &str;

    /// Open and authenticate a new connection
    async fn connect(&self) -> Result<Arc<dyn Connection>>;
}

/// An authenticated broker connection, shareable between routes
#[async_trait]
pub trait Connection: Send + Sync {
    /// Whether the connection is still usable
    fn is_open(&self) -> bool;

    /// Open a new transacted session on this connection
    async fn create_session(&self) -> Result<Box<dyn Session>>;

    /// Close the connection. Open sessions roll back.
    async fn close(&self);
}

/// A transacted session
///
/// Receives and sends made through the session's consumers and producers
/// become effective only on `commit`. `rollback` returns received messages
/// to their queue for redelivery and discards pending sends. Dropping a
/// session rolls back whatever is still pending.
#[async_trait]
pub trait Session: Send {
    /// Bind a consumer to `queue`
    async fn create_consumer(&mut self, queue: &str) -> Result<Box<dyn Consumer>>;

    /// Bind a producer to `queue`
    async fn create_producer(&mut self, queue: &str) -> Result<Box<dyn Producer>>;

    async fn commit(&mut self) -> Result<()>;

    async fn rollback(&mut self) -> Result<()>;
}

/// Receives messages from one queue inside its session's transaction
#[async_trait]
pub trait Consumer: Send {
    fn queue(&self) -> &str;

    /// Wait for the next message.
    ///
    /// Returns `Ok(None)` when the consumer reaches end of stream (closed by
    /// the broker). Must be cancel safe: dropping the future before it
    /// completes must not consume a message.
    async fn receive(&mut self) -> Result<Option<Message>>;
}

/// Sends payloads to one queue inside its session's transaction
#[async_trait]
pub trait Producer: Send {
    fn queue(&self) -> &str;

    async fn send(&mut self, payload: Payload) -> Result<()>;
}

/// Build a connector for a configured broker
pub fn connector_from_config(config: &BrokerConfig) -> Arc<dyn Connector> {
    match config.kind {
        BrokerKind::Memory => {
            let broker = MemoryBroker::from_config(config);
            Arc::new(broker.connector(config.username.clone(), config.password.clone()))
        }
    }
}

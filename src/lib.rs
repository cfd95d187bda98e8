//! qbridge - transactional queue-to-queue bridge between two message brokers
//!
//! Each configured queue mapping becomes a supervised forwarding route that
//! consumes from a queue on one broker and produces every message body to a
//! queue on the other broker, committing per message.

pub mod bridge;
pub mod broker;
pub mod config;

pub use bridge::{BridgeEngine, BridgeError, BridgeHandle, Direction, RouteTable};
pub use broker::{BrokerId, ConnectionPool, MemoryBroker};
pub use config::Config;

//! Queue Bridge Module
//!
//! Turns the configured queue mappings into live forwarding routes between
//! broker A and broker B.
//!
//! - [`RouteTable`]: validated `(source, target, direction)` entries
//! - [`ForwardingRoute`]: consume from the source queue, produce to the
//!   target queue, commit; one message per transaction
//! - [`BridgeEngine`]: one supervised task per route, restarts with backoff
//!   on transient failures, cooperative shutdown through [`BridgeHandle`]
//!
//! # Example Configuration
//!
//! ```toml
//! [forwarder]
//! payload = "text"
//!
//! # Consumed on broker A, produced to broker B
//! a_to_b = [
//!     { source_queue = "ORDERS.IN", target_queue = "ORDERS.OUT" },
//! ]
//!
//! # Consumed on broker B, produced to broker A
//! b_to_a = [
//!     { source_queue = "REPLIES", target_queue = "REPLIES.IN" },
//! ]
//! ```

mod engine;
mod error;
mod route;
mod table;
mod transaction;


pub use engine::{BridgeEngine, BridgeHandle, StopSummary};
pub use error::BridgeError;
pub use route::{extract_payload, ForwardingRoute, RouteState, RouteStatus};
pub use table::{Direction, RouteEntry, RouteTable};
pub use transaction::RouteTransaction;

// Re-export config types from the config module for convenience
pub use crate::config::{PayloadMode, QueueMapping};

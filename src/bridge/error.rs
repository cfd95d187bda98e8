//! Bridge error types.

use std::fmt;

use super::table::Direction;
use crate::broker::{BrokerError, BrokerId};

/// Errors raised while building or running forwarding routes
#[derive(Debug)]
pub enum BridgeError {
    /// Broker unreachable, authentication rejected, or connection lost
    Connection { broker: BrokerId, cause: BrokerError },
    /// Two mappings in the same direction consume the same source queue
    DuplicateSource { queue: String, direction: Direction },
    /// Configuration shape error
    Config(String),
    /// Message body cannot be forwarded as the expected payload type
    PayloadConversion {
        queue: String,
        message_id: String,
        expected: &'static str,
        found: &'static str,
    },
    /// Queue rejected by the broker at bind time
    Bind {
        broker: BrokerId,
        queue: String,
        cause: BrokerError,
    },
    /// Source consumer was closed by the broker
    EndOfStream { broker: BrokerId, queue: String },
    /// Commit failed on one side of the route transaction
    Transaction { broker: BrokerId, cause: BrokerError },
}

impl BridgeError {
    /// Classify a failure to bind `queue`.
    ///
    /// A retryable cause is a transient connection error; anything else
    /// means the broker rejected the queue itself.
    pub fn bind(broker: BrokerId, queue: &str, cause: BrokerError) -> Self {
        if cause.is_retryable() {
            BridgeError::Connection { broker, cause }
        } else {
            BridgeError::Bind {
                broker,
                queue: queue.to_string(),
                cause,
            }
        }
    }

    /// Classify a failed receive or send on an already bound queue
    pub fn io(broker: BrokerId, queue: &str, cause: BrokerError) -> Self {
        match cause {
            BrokerError::UnknownQueue(_) => BridgeError::bind(broker, queue, cause),
            cause => BridgeError::Connection { broker, cause },
        }
    }

    /// Broker whose connection this error shows to be unusable.
    ///
    /// Such a connection is evicted from the pool even if it still claims
    /// to be open.
    pub fn failed_broker(&self) -> Option<BrokerId> {
        match self {
            BridgeError::Connection { broker, cause }
            | BridgeError::Transaction { broker, cause }
                if cause.is_connection_level() =>
            {
                Some(*broker)
            }
            _ => None,
        }
    }

    /// Whether the route should be restarted after this error
    pub fn is_transient(&self) -> bool {
        match self {
            BridgeError::Connection { .. }
            | BridgeError::PayloadConversion { .. }
            | BridgeError::EndOfStream { .. }
            | BridgeError::Transaction { .. } => true,
            BridgeError::DuplicateSource { .. }
            | BridgeError::Config(_)
            | BridgeError::Bind { .. } => false,
        }
    }
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeError::Connection { broker, cause } => {
                write!(f, "Connection error on broker {}: {}", broker, cause)
            }
            BridgeError::DuplicateSource { queue, direction } => write!(
                f,
                "Duplicate source queue '{}' for direction {}",
                queue, direction
            ),
            BridgeError::Config(msg) => write!(f, "Invalid configuration: {}", msg),
            BridgeError::PayloadConversion {
                queue,
                message_id,
                expected,
                found,
            } => write!(
                f,
                "Cannot forward message {} from '{}': expected {} body, found {}",
                message_id, queue, expected, found
            ),
            BridgeError::Bind {
                broker,
                queue,
                cause,
            } => write!(
                f,
                "Broker {} rejected queue '{}': {}",
                broker, queue, cause
            ),
            BridgeError::EndOfStream { broker, queue } => {
                write!(f, "Consumer on '{}' (broker {}) reached end of stream", queue, broker)
            }
            BridgeError::Transaction { broker, cause } => {
                write!(f, "Transaction failed on broker {}: {}", broker, cause)
            }
        }
    }
}

impl std::error::Error for BridgeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BridgeError::Connection { cause, .. }
            | BridgeError::Bind { cause, .. }
            | BridgeError::Transaction { cause, .. } => Some(cause),
            _ => None,
        }
    }
}

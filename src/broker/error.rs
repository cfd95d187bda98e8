//! Broker client error types.

use std::fmt;

/// Errors reported by a broker client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Broker could not be reached
    Unreachable(String),
    /// Broker rejected the supplied credentials
    AuthenticationFailed(String),
    /// Connection to the broker failed or was lost
    ConnectionLost(String),
    /// Operation timed out
    Timeout,
    /// Queue name rejected by the broker
    UnknownQueue(String),
    /// Queue temporarily unusable; the connection itself is fine
    QueueUnavailable(String),
    /// Session, consumer or producer was already closed
    Closed,
    /// Other error
    Other(String),
}

impl BrokerError {
    /// Whether the error means the underlying connection is no longer usable.
    ///
    /// Connection-level errors cause the pooled connection to be evicted so
    /// the next `acquire` reconnects, even if it still reports itself open.
    pub fn is_connection_level(&self) -> bool {
        matches!(
            self,
            BrokerError::Unreachable(_)
                | BrokerError::AuthenticationFailed(_)
                | BrokerError::ConnectionLost(_)
                | BrokerError::Timeout
                | BrokerError::Closed
        )
    }

    /// Whether retrying later may succeed
    pub fn is_retryable(&self) -> bool {
        self.is_connection_level() || matches!(self, BrokerError::QueueUnavailable(_))
    }
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerError::Unreachable(msg) => write!(f, "Broker unreachable: {}", msg),
            BrokerError::AuthenticationFailed(msg) => {
                write!(f, "Authentication failed: {}", msg)
            }
            BrokerError::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            BrokerError::Timeout => write!(f, "Operation timed out"),
            BrokerError::UnknownQueue(queue) => write!(f, "Unknown queue '{}'", queue),
            BrokerError::QueueUnavailable(msg) => write!(f, "Queue unavailable: {}", msg),
            BrokerError::Closed => write!(f, "Already closed"),
            BrokerError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for BrokerError {}

/// Result type for broker client operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

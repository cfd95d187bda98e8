//! Forwarding Route
//!
//! Forwards messages from one source queue to one destination queue, one
//! message per transaction:
//!
//! ```text
//! Idle -> Receiving -> Forwarding -> Committing -> Idle
//!              \            \             \
//!               +------------+-------------+--> Failed
//! ```
//!
//! A failed route is restarted (`Failed -> Backoff -> Idle`) or stopped by
//! the engine's supervisor depending on whether the error is transient.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::error::BridgeError;
use super::table::{Direction, RouteEntry};
use super::transaction::RouteTransaction;
use crate::broker::{
    BrokerId, Connection, ConnectionPool, Consumer, Message, MessageBody, Payload, Producer,
};
use crate::config::PayloadMode;

/// Lifecycle state of a route
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteState {
    /// Bound (or about to bind), no message in flight
    Idle,
    /// Waiting for a message on the source queue
    Receiving,
    /// Converting and sending a received message
    Forwarding,
    /// Resolving the transaction
    Committing,
    /// Last attempt failed
    Failed,
    /// Waiting before a restart
    Backoff,
    /// Terminated (shutdown or non-transient failure)
    Stopped,
}

impl RouteState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteState::Idle => "idle",
            RouteState::Receiving => "receiving",
            RouteState::Forwarding => "forwarding",
            RouteState::Committing => "committing",
            RouteState::Failed => "failed",
            RouteState::Backoff => "backoff",
            RouteState::Stopped => "stopped",
        }
    }
}

/// Point-in-time view of a route
#[derive(Debug, Clone)]
pub struct RouteStatus {
    pub name: String,
    pub direction: Direction,
    pub source_queue: String,
    pub target_queue: String,
    pub state: RouteState,
    /// Messages committed to the destination
    pub forwarded: u64,
    /// Transactions rolled back
    pub rolled_back: u64,
    /// Restarts after transient failures
    pub restarts: u64,
    /// Most recent failure, if any
    pub last_error: Option<String>,
}

/// State shared between a running route and its observers
pub(crate) struct RouteShared {
    entry: RouteEntry,
    state: RwLock<RouteState>,
    forwarded: AtomicU64,
    rolled_back: AtomicU64,
    restarts: AtomicU64,
    last_error: RwLock<Option<String>>,
}

impl RouteShared {
    pub(crate) fn new(entry: RouteEntry) -> Self {
        Self {
            entry,
            state: RwLock::new(RouteState::Idle),
            forwarded: AtomicU64::new(0),
            rolled_back: AtomicU64::new(0),
            restarts: AtomicU64::new(0),
            last_error: RwLock::new(None),
        }
    }

    pub(crate) fn entry(&self) -> &RouteEntry {
        &self.entry
    }

    pub(crate) fn state(&self) -> RouteState {
        *self.state.read()
    }

    pub(crate) fn set_state(&self, state: RouteState) {
        *self.state.write() = state;
    }

    pub(crate) fn forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    pub(crate) fn record_failure(&self, error: &BridgeError) {
        *self.last_error.write() = Some(error.to_string());
        self.set_state(RouteState::Failed);
    }

    pub(crate) fn record_restart(&self) {
        self.restarts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn status(&self) -> RouteStatus {
        RouteStatus {
            name: self.entry.name(),
            direction: self.entry.direction,
            source_queue: self.entry.source_queue().to_string(),
            target_queue: self.entry.target_queue().to_string(),
            state: self.state(),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            rolled_back: self.rolled_back.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
            last_error: self.last_error.read().clone(),
        }
    }
}

/// Sessions and handles of a bound route
struct Binding {
    tx: RouteTransaction,
    consumer: Box<dyn Consumer>,
    producer: Box<dyn Producer>,
}

/// One supervised source queue → destination queue path
pub struct ForwardingRoute {
    name: String,
    entry: RouteEntry,
    payload_mode: PayloadMode,
    pool: Arc<ConnectionPool>,
    shared: Arc<RouteShared>,
}

impl ForwardingRoute {
    pub(crate) fn new(
        shared: Arc<RouteShared>,
        payload_mode: PayloadMode,
        pool: Arc<ConnectionPool>,
    ) -> Self {
        let entry = shared.entry().clone();
        Self {
            name: entry.name(),
            entry,
            payload_mode,
            pool,
            shared,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn shared(&self) -> &Arc<RouteShared> {
        &self.shared
    }

    fn source_broker(&self) -> BrokerId {
        self.entry.direction.source()
    }

    fn target_broker(&self) -> BrokerId {
        self.entry.direction.target()
    }

    /// Bind and forward until `shutdown` is signalled or an error occurs.
    ///
    /// Returns `Ok(())` only on shutdown. A stop request never interrupts a
    /// message in flight: its transaction is committed or rolled back first.
    pub async fn run(&self, shutdown: &mut watch::Receiver<bool>) -> Result<(), BridgeError> {
        let source_conn = self.pool.acquire(self.source_broker()).await?;
        let target_conn = self.pool.acquire(self.target_broker()).await?;

        // Sessions are dropped, and so rolled back, before any eviction
        let result = match self.bind(&source_conn, &target_conn).await {
            Ok(mut binding) => self.forward_loop(&mut binding, shutdown).await,
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            let failed = e.failed_broker();
            self.pool
                .evict(
                    self.source_broker(),
                    &source_conn,
                    failed == Some(self.source_broker()),
                )
                .await;
            self.pool
                .evict(
                    self.target_broker(),
                    &target_conn,
                    failed == Some(self.target_broker()),
                )
                .await;
        }
        result
    }

    async fn bind(
        &self,
        source_conn: &Arc<dyn Connection>,
        target_conn: &Arc<dyn Connection>,
    ) -> Result<Binding, BridgeError> {
        let source_session = source_conn
            .create_session()
            .await
            .map_err(|cause| BridgeError::Connection {
                broker: self.source_broker(),
                cause,
            })?;
        let target_session = target_conn
            .create_session()
            .await
            .map_err(|cause| BridgeError::Connection {
                broker: self.target_broker(),
                cause,
            })?;

        let mut tx = RouteTransaction::new(
            self.source_broker(),
            source_session,
            self.target_broker(),
            target_session,
        );
        let consumer = tx.consumer(self.entry.source_queue()).await?;
        let producer = tx.producer(self.entry.target_queue()).await?;

        debug!("Route '{}': bound", self.name);

        Ok(Binding {
            tx,
            consumer,
            producer,
        })
    }

    async fn forward_loop(
        &self,
        binding: &mut Binding,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), BridgeError> {
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            self.shared.set_state(RouteState::Receiving);
            let received = tokio::select! {
                biased;
                // A closed channel means the engine is gone: stop as well
                _ = shutdown.changed() => return Ok(()),
                received = binding.consumer.receive() => received,
            };

            let message = match received {
                Ok(Some(message)) => message,
                Ok(None) => {
                    return Err(BridgeError::EndOfStream {
                        broker: self.source_broker(),
                        queue: self.entry.source_queue().to_string(),
                    })
                }
                Err(cause) => {
                    return Err(BridgeError::io(
                        self.source_broker(),
                        self.entry.source_queue(),
                        cause,
                    ))
                }
            };

            self.forward(binding, message).await?;
            self.shared.set_state(RouteState::Idle);
        }
    }

    /// Forward one received message inside the current transaction
    async fn forward(&self, binding: &mut Binding, message: Message) -> Result<(), BridgeError> {
        self.shared.set_state(RouteState::Forwarding);
        debug!("Route '{}': received {}", self.name, message);

        let payload = match extract_payload(self.payload_mode, self.entry.source_queue(), message) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Route '{}': {}; rolling back", self.name, e);
                self.rollback(binding).await;
                return Err(e);
            }
        };

        if let Err(cause) = binding.producer.send(payload).await {
            let e = BridgeError::io(self.target_broker(), self.entry.target_queue(), cause);
            warn!("Route '{}': send failed: {}; rolling back", self.name, e);
            self.rollback(binding).await;
            return Err(e);
        }

        self.shared.set_state(RouteState::Committing);
        if let Err(e) = binding.tx.commit().await {
            // A failed source commit comes after the copy was delivered
            if matches!(e, BridgeError::Transaction { broker, .. } if broker == self.target_broker())
            {
                self.shared.rolled_back.fetch_add(1, Ordering::Relaxed);
            }
            return Err(e);
        }

        self.shared.forwarded.fetch_add(1, Ordering::Relaxed);
        debug!(
            "Route '{}': forwarded to '{}'",
            self.name,
            self.entry.target_queue()
        );
        Ok(())
    }

    async fn rollback(&self, binding: &mut Binding) {
        binding.tx.rollback().await;
        self.shared.rolled_back.fetch_add(1, Ordering::Relaxed);
    }
}

/// Take the body of `message` as the payload to forward. Headers are dropped.
pub fn extract_payload(
    mode: PayloadMode,
    queue: &str,
    message: Message,
) -> Result<Payload, BridgeError> {
    match (mode, message.body) {
        (PayloadMode::Text, MessageBody::Text(text)) => Ok(MessageBody::Text(text)),
        (PayloadMode::Text, body) => Err(BridgeError::PayloadConversion {
            queue: queue.to_string(),
            message_id: message.message_id,
            expected: "text",
            found: body.kind(),
        }),
        (PayloadMode::Verbatim, body) => Ok(body),
    }
}

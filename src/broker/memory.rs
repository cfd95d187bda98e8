//! In-Memory Broker
//!
//! An in-process queue broker implementing the client traits with real
//! transacted sessions: receives and sends stay invisible to other
//! sessions until commit, rollback returns received messages to the head
//! of their queue with an incremented delivery count.
//!
//! Used for local runs (`kind = "memory"`) and throughout the test suite.
//! It also exposes fault injection: [`MemoryBroker::disconnect`] breaks
//! every open connection, [`MemoryBroker::set_available`] refuses new
//! ones, and [`MemoryBroker::inject_fault`] makes every operation touching
//! one queue fail while its connection stays healthy.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use super::error::{BrokerError, Result};
use super::message::{Message, Payload};
use super::{Connection, Connector, Consumer, Producer, Session};
use crate::config::BrokerConfig;

struct MemoryQueue {
    name: String,
    messages: Mutex<VecDeque<Message>>,
    deleted: AtomicBool,
    notify: Notify,
}

impl MemoryQueue {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            messages: Mutex::new(VecDeque::new()),
            deleted: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    fn push_back(&self, message: Message) {
        self.messages.lock().push_back(message);
        self.notify.notify_waiters();
    }
}

struct BrokerInner {
    name: String,
    queues: DashMap<String, Arc<MemoryQueue>>,
    auto_create: AtomicBool,
    credentials: Mutex<Option<(String, String)>>,
    available: AtomicBool,
    /// Bumped by `disconnect`; connections from an older generation are dead
    generation: AtomicU64,
    faulted: DashSet<String>,
    /// Wakes blocked receivers when connection or fault state changes
    state_changed: Notify,
    next_message_id: AtomicU64,
    connections_opened: AtomicU64,
}

impl BrokerInner {
    fn queue(&self, name: &str) -> Result<Arc<MemoryQueue>> {
        if let Some(queue) = self.queues.get(name) {
            return Ok(queue.clone());
        }
        if !self.auto_create.load(Ordering::Acquire) {
            return Err(BrokerError::UnknownQueue(name.to_string()));
        }
        Ok(self
            .queues
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryQueue::new(name)))
            .clone())
    }

    fn next_message_id(&self) -> String {
        let id = self.next_message_id.fetch_add(1, Ordering::Relaxed);
        format!("ID:{}-{}", self.name, id)
    }
}

/// In-process transactional queue broker
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl MemoryBroker {
    /// Create a broker that creates queues on first use and accepts any
    /// credentials
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                name: name.into(),
                queues: DashMap::new(),
                auto_create: AtomicBool::new(true),
                credentials: Mutex::new(None),
                available: AtomicBool::new(true),
                generation: AtomicU64::new(0),
                faulted: DashSet::new(),
                state_changed: Notify::new(),
                next_message_id: AtomicU64::new(1),
                connections_opened: AtomicU64::new(0),
            }),
        }
    }

    /// Create a broker from its configuration section
    pub fn from_config(config: &BrokerConfig) -> Self {
        let broker = Self::new(config.name.clone());
        broker.set_auto_create(config.auto_create_queues);
        for queue in &config.queues {
            broker.declare_queue(queue);
        }
        if let (Some(user), Some(password)) = (&config.username, &config.password) {
            broker.set_credentials(user, password);
        }
        broker
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Require these credentials from connecting clients
    pub fn set_credentials(&self, username: &str, password: &str) {
        *self.inner.credentials.lock() = Some((username.to_string(), password.to_string()));
    }

    /// Whether binding to an undeclared queue creates it
    pub fn set_auto_create(&self, enabled: bool) {
        self.inner.auto_create.store(enabled, Ordering::Release);
    }

    /// Declare a queue so it can be bound when auto-creation is off
    pub fn declare_queue(&self, name: &str) {
        self.inner
            .queues
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryQueue::new(name)));
    }

    /// Delete a queue. Consumers bound to it reach end of stream.
    pub fn delete_queue(&self, name: &str) {
        if let Some((_, queue)) = self.inner.queues.remove(name) {
            queue.deleted.store(true, Ordering::Release);
            queue.notify.notify_waiters();
        }
    }

    /// Enqueue a message outside any transaction, as an external producer
    /// would. Returns the assigned message id.
    pub fn send(&self, queue: &str, body: impl Into<Payload>) -> Result<String> {
        let id = self.inner.next_message_id();
        self.send_message(queue, Message::new(id.clone(), body))?;
        Ok(id)
    }

    /// Enqueue a fully built message outside any transaction
    pub fn send_message(&self, queue: &str, message: Message) -> Result<()> {
        self.inner.queue(queue)?.push_back(message);
        Ok(())
    }

    /// Remove and return the head of a queue outside any transaction
    pub fn take(&self, queue: &str) -> Option<Message> {
        let queue = self.inner.queues.get(queue)?.clone();
        let message = queue.messages.lock().pop_front();
        message
    }

    /// Snapshot of the messages currently visible on a queue
    pub fn messages(&self, queue: &str) -> Vec<Message> {
        match self.inner.queues.get(queue) {
            Some(queue) => queue.messages.lock().iter().cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Number of committed messages waiting on a queue
    pub fn depth(&self, queue: &str) -> usize {
        self.inner
            .queues
            .get(queue)
            .map(|q| q.messages.lock().len())
            .unwrap_or(0)
    }

    /// Break every open connection. In-flight transactions roll back when
    /// their sessions are dropped.
    pub fn disconnect(&self) {
        self.inner.generation.fetch_add(1, Ordering::AcqRel);
        self.inner.state_changed.notify_waiters();
        debug!("Memory broker '{}': all connections dropped", self.inner.name);
    }

    /// Accept or refuse new connections
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::Release);
    }

    /// Fail every operation on `queue` without breaking the connection
    pub fn inject_fault(&self, queue: &str) {
        self.inner.faulted.insert(queue.to_string());
        self.inner.state_changed.notify_waiters();
    }

    pub fn clear_fault(&self, queue: &str) {
        self.inner.faulted.remove(queue);
        self.inner.state_changed.notify_waiters();
    }

    /// Total connections accepted since creation
    pub fn connections_opened(&self) -> u64 {
        self.inner.connections_opened.load(Ordering::Relaxed)
    }

    /// A connector presenting the given credentials
    pub fn connector(&self, username: Option<String>, password: Option<String>) -> MemoryConnector {
        MemoryConnector {
            broker: self.clone(),
            username,
            password,
        }
    }
}

/// Connects to a [`MemoryBroker`]
pub struct MemoryConnector {
    broker: MemoryBroker,
    username: Option<String>,
    password: Option<String>,
}

#[async_trait]
impl Connector for MemoryConnector {
    fn broker_name(&self) -> &str {
        self.broker.name()
    }

    async fn connect(&self) -> Result<Arc<dyn Connection>> {
        let inner = &self.broker.inner;
        if !inner.available.load(Ordering::Acquire) {
            return Err(BrokerError::Unreachable(format!(
                "{} is not accepting connections",
                inner.name
            )));
        }

        if let Some((user, password)) = inner.credentials.lock().as_ref() {
            let accepted = self.username.as_deref() == Some(user.as_str())
                && self.password.as_deref() == Some(password.as_str());
            if !accepted {
                return Err(BrokerError::AuthenticationFailed(format!(
                    "user '{}' rejected by {}",
                    self.username.as_deref().unwrap_or(""),
                    inner.name
                )));
            }
        }

        let id = inner.connections_opened.fetch_add(1, Ordering::Relaxed) + 1;
        debug!("Memory broker '{}': connection {} opened", inner.name, id);

        Ok(Arc::new(MemoryConnection {
            state: Arc::new(ConnectionState {
                broker: inner.clone(),
                generation: inner.generation.load(Ordering::Acquire),
                closed: AtomicBool::new(false),
            }),
        }))
    }
}

struct ConnectionState {
    broker: Arc<BrokerInner>,
    generation: u64,
    closed: AtomicBool,
}

impl ConnectionState {
    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
            && self.broker.generation.load(Ordering::Acquire) == self.generation
    }

    fn check(&self, queue: &str) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::Closed);
        }
        if self.broker.generation.load(Ordering::Acquire) != self.generation {
            return Err(BrokerError::ConnectionLost(format!(
                "connection to {} reset",
                self.broker.name
            )));
        }
        if self.broker.faulted.contains(queue) {
            return Err(BrokerError::QueueUnavailable(format!(
                "{} is faulted on {}",
                queue, self.broker.name
            )));
        }
        Ok(())
    }

    fn check_connection(&self) -> Result<()> {
        self.check("")
    }
}

struct MemoryConnection {
    state: Arc<ConnectionState>,
}

#[async_trait]
impl Connection for MemoryConnection {
    fn is_open(&self) -> bool {
        self.state.is_open()
    }

    async fn create_session(&self) -> Result<Box<dyn Session>> {
        self.state.check_connection()?;
        Ok(Box::new(MemorySession {
            connection: self.state.clone(),
            tx: Arc::new(Mutex::new(Transaction::default())),
        }))
    }

    async fn close(&self) {
        self.state.closed.store(true, Ordering::Release);
        self.state.broker.state_changed.notify_waiters();
    }
}

#[derive(Default)]
struct Transaction {
    received: Vec<(Arc<MemoryQueue>, Message)>,
    pending: Vec<(Arc<MemoryQueue>, Message)>,
}

impl Transaction {
    fn rollback(&mut self) {
        for (queue, mut message) in self.received.drain(..).rev() {
            message.delivery_count += 1;
            queue.messages.lock().push_front(message);
            queue.notify.notify_waiters();
        }
        self.pending.clear();
    }
}

struct MemorySession {
    connection: Arc<ConnectionState>,
    tx: Arc<Mutex<Transaction>>,
}

#[async_trait]
impl Session for MemorySession {
    async fn create_consumer(&mut self, queue: &str) -> Result<Box<dyn Consumer>> {
        self.connection.check(queue)?;
        let queue = self.connection.broker.queue(queue)?;
        Ok(Box::new(MemoryConsumer {
            connection: self.connection.clone(),
            queue,
            tx: self.tx.clone(),
        }))
    }

    async fn create_producer(&mut self, queue: &str) -> Result<Box<dyn Producer>> {
        self.connection.check(queue)?;
        let queue = self.connection.broker.queue(queue)?;
        Ok(Box::new(MemoryProducer {
            connection: self.connection.clone(),
            queue,
            tx: self.tx.clone(),
        }))
    }

    async fn commit(&mut self) -> Result<()> {
        let mut tx = self.tx.lock();
        for (queue, _) in tx.received.iter().chain(tx.pending.iter()) {
            self.connection.check(&queue.name)?;
        }
        tx.received.clear();
        for (queue, message) in tx.pending.drain(..) {
            queue.push_back(message);
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.tx.lock().rollback();
        Ok(())
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.tx.lock().rollback();
    }
}

struct MemoryConsumer {
    connection: Arc<ConnectionState>,
    queue: Arc<MemoryQueue>,
    tx: Arc<Mutex<Transaction>>,
}

#[async_trait]
impl Consumer for MemoryConsumer {
    fn queue(&self) -> &str {
        &self.queue.name
    }

    async fn receive(&mut self) -> Result<Option<Message>> {
        loop {
            // Register interest before inspecting state so no wakeup is lost
            let queue_changed = self.queue.notify.notified();
            let broker_changed = self.connection.broker.state_changed.notified();
            tokio::pin!(queue_changed);
            tokio::pin!(broker_changed);
            queue_changed.as_mut().enable();
            broker_changed.as_mut().enable();

            self.connection.check(&self.queue.name)?;
            if self.queue.deleted.load(Ordering::Acquire) {
                return Ok(None);
            }

            let next = self.queue.messages.lock().pop_front();
            if let Some(message) = next {
                self.tx
                    .lock()
                    .received
                    .push((self.queue.clone(), message.clone()));
                return Ok(Some(message));
            }

            tokio::select! {
                _ = queue_changed => {}
                _ = broker_changed => {}
            }
        }
    }
}

struct MemoryProducer {
    connection: Arc<ConnectionState>,
    queue: Arc<MemoryQueue>,
    tx: Arc<Mutex<Transaction>>,
}

#[async_trait]
impl Producer for MemoryProducer {
    fn queue(&self) -> &str {
        &self.queue.name
    }

    async fn send(&mut self, payload: Payload) -> Result<()> {
        self.connection.check(&self.queue.name)?;
        let message = Message::new(self.connection.broker.next_message_id(), payload);
        self.tx.lock().pending.push((self.queue.clone(), message));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use pretty_assertions::assert_eq;
    use tokio_test::assert_pending;

    use super::*;
    use crate::broker::MessageBody;

    async fn connect(broker: &MemoryBroker) -> Arc<dyn Connection> {
        broker.connector(None, None).connect().await.unwrap()
    }

    #[tokio::test]
    async fn test_commit_moves_message() {
        let broker = MemoryBroker::new("test");
        broker.send("IN", "hello").unwrap();

        let conn = connect(&broker).await;
        let mut session = conn.create_session().await.unwrap();
        let mut consumer = session.create_consumer("IN").await.unwrap();
        let mut producer = session.create_producer("OUT").await.unwrap();

        let message = consumer.receive().await.unwrap().unwrap();
        producer.send(message.body.clone()).await.unwrap();

        // Nothing visible before commit
        assert_eq!(broker.depth("IN"), 0);
        assert_eq!(broker.depth("OUT"), 0);

        session.commit().await.unwrap();
        assert_eq!(broker.depth("IN"), 0);
        assert_eq!(broker.depth("OUT"), 1);
        assert_eq!(broker.take("OUT").unwrap().body, MessageBody::from("hello"));
    }

    #[tokio::test]
    async fn test_rollback_redelivers_in_order() {
        let broker = MemoryBroker::new("test");
        broker.send("IN", "first").unwrap();
        broker.send("IN", "second").unwrap();

        let conn = connect(&broker).await;
        let mut session = conn.create_session().await.unwrap();
        let mut consumer = session.create_consumer("IN").await.unwrap();
        let mut producer = session.create_producer("OUT").await.unwrap();

        consumer.receive().await.unwrap().unwrap();
        consumer.receive().await.unwrap().unwrap();
        producer.send(MessageBody::from("x")).await.unwrap();
        session.rollback().await.unwrap();

        let messages = broker.messages("IN");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].body, MessageBody::from("first"));
        assert_eq!(messages[1].body, MessageBody::from("second"));
        assert!(messages.iter().all(|m| m.delivery_count == 2));
        assert_eq!(broker.depth("OUT"), 0);
    }

    #[tokio::test]
    async fn test_dropped_session_rolls_back() {
        let broker = MemoryBroker::new("test");
        broker.send("IN", "hello").unwrap();

        let conn = connect(&broker).await;
        {
            let mut session = conn.create_session().await.unwrap();
            let mut consumer = session.create_consumer("IN").await.unwrap();
            consumer.receive().await.unwrap().unwrap();
            assert_eq!(broker.depth("IN"), 0);
        }
        assert_eq!(broker.depth("IN"), 1);
        assert!(broker.messages("IN")[0].redelivered());
    }

    #[tokio::test]
    async fn test_receive_waits_for_message() {
        let broker = MemoryBroker::new("test");
        let conn = connect(&broker).await;
        let mut session = conn.create_session().await.unwrap();
        let mut consumer = session.create_consumer("IN").await.unwrap();

        let sender = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            sender
                .send("IN", Bytes::from_static(b"\x00\x01"))
                .unwrap();
        });

        let message = tokio::time::timeout(Duration::from_secs(2), consumer.receive())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(message.body.as_bytes(), b"\x00\x01");
    }

    #[tokio::test]
    async fn test_cancelled_receive_consumes_nothing() {
        let broker = MemoryBroker::new("test");
        let conn = connect(&broker).await;
        let mut session = conn.create_session().await.unwrap();
        let mut consumer = session.create_consumer("IN").await.unwrap();

        let mut receive = tokio_test::task::spawn(consumer.receive());
        assert_pending!(receive.poll());

        broker.send("IN", "later").unwrap();
        assert!(receive.is_woken());
        drop(receive);

        assert_eq!(broker.depth("IN"), 1);
    }

    #[tokio::test]
    async fn test_disconnect_wakes_receiver() {
        let broker = MemoryBroker::new("test");
        let conn = connect(&broker).await;
        let mut session = conn.create_session().await.unwrap();
        let mut consumer = session.create_consumer("IN").await.unwrap();

        let killer = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            killer.disconnect();
        });

        let err = tokio::time::timeout(Duration::from_secs(2), consumer.receive())
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, BrokerError::ConnectionLost(_)));
        assert!(!conn.is_open());
    }

    #[tokio::test]
    async fn test_deleted_queue_ends_stream() {
        let broker = MemoryBroker::new("test");
        broker.declare_queue("IN");
        let conn = connect(&broker).await;
        let mut session = conn.create_session().await.unwrap();
        let mut consumer = session.create_consumer("IN").await.unwrap();

        broker.delete_queue("IN");
        assert!(consumer.receive().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unknown_queue_rejected() {
        let broker = MemoryBroker::new("test");
        broker.set_auto_create(false);
        broker.declare_queue("KNOWN");

        let conn = connect(&broker).await;
        let mut session = conn.create_session().await.unwrap();
        assert!(session.create_consumer("KNOWN").await.is_ok());
        let err = session.create_producer("MISSING").await.err().unwrap();
        assert_eq!(err, BrokerError::UnknownQueue("MISSING".to_string()));
    }

    #[tokio::test]
    async fn test_credentials_and_availability() {
        let broker = MemoryBroker::new("secure");
        broker.set_credentials("app", "secret");

        let good = broker.connector(Some("app".into()), Some("secret".into()));
        let bad = broker.connector(Some("app".into()), Some("wrong".into()));
        assert!(good.connect().await.is_ok());
        assert!(matches!(
            bad.connect().await.err().unwrap(),
            BrokerError::AuthenticationFailed(_)
        ));

        broker.set_available(false);
        assert!(matches!(
            good.connect().await.err().unwrap(),
            BrokerError::Unreachable(_)
        ));
        assert_eq!(broker.connections_opened(), 1);
    }

    #[tokio::test]
    async fn test_fault_only_affects_its_queue() {
        let broker = MemoryBroker::new("test");
        let conn = connect(&broker).await;
        let mut session = conn.create_session().await.unwrap();
        let mut bad = session.create_producer("BAD").await.unwrap();
        let mut good = session.create_producer("GOOD").await.unwrap();

        broker.inject_fault("BAD");
        let err = bad.send(MessageBody::from("x")).await.unwrap_err();
        assert!(matches!(err, BrokerError::QueueUnavailable(_)));
        assert!(!err.is_connection_level());
        assert!(good.send(MessageBody::from("y")).await.is_ok());
        assert!(conn.is_open());

        broker.clear_fault("BAD");
        assert!(bad.send(MessageBody::from("z")).await.is_ok());
    }
}

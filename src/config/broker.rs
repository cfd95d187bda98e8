//! Broker and Forwarder Configuration
//!
//! Connection descriptors for the two bridged brokers and the queue
//! mappings forwarded between them.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;

/// Broker client implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    /// In-process broker (local runs and tests)
    #[default]
    Memory,
}

impl std::fmt::Display for BrokerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BrokerKind::Memory => write!(f, "memory"),
        }
    }
}

/// Connection descriptor for one broker
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// Name used in logs
    pub name: String,

    /// Client implementation
    #[serde(default)]
    pub kind: BrokerKind,

    /// Broker address (host:port, URL, or queue manager connection name)
    #[serde(default = "default_address")]
    pub address: String,

    /// Username for authentication
    #[serde(default, alias = "user")]
    pub username: Option<String>,

    /// Password for authentication
    #[serde(default)]
    pub password: Option<String>,

    /// Connection handshake timeout (e.g., "10s")
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Queues to declare up front (memory broker)
    #[serde(default)]
    pub queues: Vec<String>,

    /// Create queues on first bind (memory broker)
    #[serde(default = "default_true")]
    pub auto_create_queues: bool,

    /// Client-specific binding parameters (queue manager, channel, ...),
    /// passed through to the broker client untouched
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

fn default_address() -> String {
    "localhost".to_string()
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_true() -> bool {
    true
}

impl BrokerConfig {
    /// Descriptor with defaults for everything but the name
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: BrokerKind::default(),
            address: default_address(),
            username: None,
            password: None,
            connect_timeout: default_connect_timeout(),
            queues: Vec::new(),
            auto_create_queues: true,
            properties: BTreeMap::new(),
        }
    }

    /// Address safe to log (credentials are never part of it)
    pub fn describe(&self) -> String {
        match &self.username {
            Some(user) => format!("{}://{}@{}", self.kind, user, self.address),
            None => format!("{}://{}", self.kind, self.address),
        }
    }
}

/// How message bodies are converted before forwarding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadMode {
    /// Bodies must be text; binary bodies are rejected and rolled back
    #[default]
    Text,
    /// Forward text and binary bodies unchanged
    Verbatim,
}

/// One source queue forwarded to one target queue
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct QueueMapping {
    /// Queue consumed on the source broker
    #[serde(alias = "sourceQueue", alias = "source")]
    pub source_queue: String,

    /// Queue produced to on the destination broker
    #[serde(alias = "targetQueue", alias = "target")]
    pub target_queue: String,
}

impl QueueMapping {
    pub fn new(source_queue: impl Into<String>, target_queue: impl Into<String>) -> Self {
        Self {
            source_queue: source_queue.into(),
            target_queue: target_queue.into(),
        }
    }
}

/// Queue mappings for both forwarding directions
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ForwarderConfig {
    /// Payload conversion applied to every route
    pub payload: PayloadMode,

    /// Mappings consumed on broker A and produced to broker B
    #[serde(alias = "wmq_to_amq", alias = "wmqToAmq")]
    pub a_to_b: Vec<QueueMapping>,

    /// Mappings consumed on broker B and produced to broker A
    #[serde(alias = "amq_to_wmq", alias = "amqToWmq")]
    pub b_to_a: Vec<QueueMapping>,
}

impl ForwarderConfig {
    /// All mappings, A→B first
    pub fn mappings(&self) -> impl Iterator<Item = &QueueMapping> {
        self.a_to_b.iter().chain(self.b_to_a.iter())
    }
}

/// Route supervision and shutdown settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisionConfig {
    /// First restart delay after a transient route failure
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,

    /// Upper bound for the doubling restart delay
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,

    /// How long `stop` waits for routes to finish their transaction
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,

    /// Interval between route status log lines (0 disables)
    #[serde(with = "humantime_serde")]
    pub status_interval: Duration,
}

impl Default for SupervisionConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(30),
            status_interval: Duration::from_secs(60),
        }
    }
}

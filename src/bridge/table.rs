//! Route Table
//!
//! The validated, immutable set of forwarding routes derived from the
//! configured queue mappings.

use std::collections::HashSet;
use std::fmt;

use super::error::BridgeError;
use crate::broker::BrokerId;
use crate::config::{ForwarderConfig, QueueMapping};

/// Which broker is consumed and which is produced to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Consume from broker A, produce to broker B
    AToB,
    /// Consume from broker B, produce to broker A
    BToA,
}

impl Direction {
    /// Broker the route consumes from
    pub fn source(self) -> BrokerId {
        match self {
            Direction::AToB => BrokerId::A,
            Direction::BToA => BrokerId::B,
        }
    }

    /// Broker the route produces to
    pub fn target(self) -> BrokerId {
        self.source().other()
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::AToB => write!(f, "A->B"),
            Direction::BToA => write!(f, "B->A"),
        }
    }
}

/// One directional forwarding path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    pub mapping: QueueMapping,
    pub direction: Direction,
}

impl RouteEntry {
    pub fn source_queue(&self) -> &str {
        &self.mapping.source_queue
    }

    pub fn target_queue(&self) -> &str {
        &self.mapping.target_queue
    }

    /// Unique route name, e.g. `A->B:ORDERS.IN->ORDERS.OUT`
    pub fn name(&self) -> String {
        format!(
            "{}:{}->{}",
            self.direction, self.mapping.source_queue, self.mapping.target_queue
        )
    }
}

/// Validated set of routes. Built once; rebuilding means a new engine.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    entries: Vec<RouteEntry>,
}

impl RouteTable {
    /// Build the table from both directions' mappings.
    ///
    /// Fails if a queue name is empty, or if a source queue appears twice
    /// in the same direction (two consumers would split its messages).
    pub fn build(a_to_b: &[QueueMapping], b_to_a: &[QueueMapping]) -> Result<Self, BridgeError> {
        let mut seen: HashSet<(&str, Direction)> = HashSet::new();
        let mut entries = Vec::with_capacity(a_to_b.len() + b_to_a.len());

        let directed = a_to_b
            .iter()
            .map(|m| (m, Direction::AToB))
            .chain(b_to_a.iter().map(|m| (m, Direction::BToA)));

        for (mapping, direction) in directed {
            if mapping.source_queue.is_empty() || mapping.target_queue.is_empty() {
                return Err(BridgeError::Config(format!(
                    "mapping '{}' -> '{}' ({}) has an empty queue name",
                    mapping.source_queue, mapping.target_queue, direction
                )));
            }

            if !seen.insert((mapping.source_queue.as_str(), direction)) {
                return Err(BridgeError::DuplicateSource {
                    queue: mapping.source_queue.clone(),
                    direction,
                });
            }

            entries.push(RouteEntry {
                mapping: mapping.clone(),
                direction,
            });
        }

        Ok(Self { entries })
    }

    /// Build the table from the forwarder configuration section
    pub fn from_config(config: &ForwarderConfig) -> Result<Self, BridgeError> {
        Self::build(&config.a_to_b, &config.b_to_a)
    }

    pub fn entries(&self) -> &[RouteEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries forwarding in `direction`, in configured order
    pub fn in_direction(&self, direction: Direction) -> impl Iterator<Item = &RouteEntry> {
        self.entries.iter().filter(move |e| e.direction == direction)
    }
}

impl IntoIterator for RouteTable {
    type Item = RouteEntry;
    type IntoIter = std::vec::IntoIter<RouteEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

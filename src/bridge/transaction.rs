//! Route Transactions
//!
//! A route consumes on one broker and produces on the other, so no single
//! broker session can cover both sides. [`RouteTransaction`] pairs the two
//! transacted sessions and resolves them in a fixed order:
//!
//! 1. commit the destination session (the forwarded copy becomes visible)
//! 2. commit the source session (the original is acknowledged)
//!
//! If step 1 fails the source is rolled back and the broker redelivers: no
//! copy, no loss. If step 2 fails after step 1 succeeded the message is
//! redelivered and forwarded again, so delivery is at-least-once.

use tracing::warn;

use super::error::BridgeError;
use crate::broker::{BrokerId, Consumer, Producer, Session};

pub struct RouteTransaction {
    source_broker: BrokerId,
    target_broker: BrokerId,
    source: Box<dyn Session>,
    target: Box<dyn Session>,
}

impl RouteTransaction {
    pub fn new(
        source_broker: BrokerId,
        source: Box<dyn Session>,
        target_broker: BrokerId,
        target: Box<dyn Session>,
    ) -> Self {
        Self {
            source_broker,
            target_broker,
            source,
            target,
        }
    }

    /// Bind the consumer for the source queue
    pub async fn consumer(&mut self, queue: &str) -> Result<Box<dyn Consumer>, BridgeError> {
        self.source
            .create_consumer(queue)
            .await
            .map_err(|cause| BridgeError::bind(self.source_broker, queue, cause))
    }

    /// Bind the producer for the destination queue
    pub async fn producer(&mut self, queue: &str) -> Result<Box<dyn Producer>, BridgeError> {
        self.target
            .create_producer(queue)
            .await
            .map_err(|cause| BridgeError::bind(self.target_broker, queue, cause))
    }

    /// Commit destination, then source
    pub async fn commit(&mut self) -> Result<(), BridgeError> {
        if let Err(cause) = self.target.commit().await {
            self.rollback_source().await;
            return Err(BridgeError::Transaction {
                broker: self.target_broker,
                cause,
            });
        }

        self.source.commit().await.map_err(|cause| {
            warn!(
                "Source commit on broker {} failed after the destination committed; \
                 the message will be redelivered and forwarded again",
                self.source_broker
            );
            BridgeError::Transaction {
                broker: self.source_broker,
                cause,
            }
        })
    }

    /// Roll back both sides. Failures are logged; the broker still
    /// redelivers anything left unacknowledged.
    pub async fn rollback(&mut self) {
        if let Err(e) = self.target.rollback().await {
            warn!("Rollback on broker {} failed: {}", self.target_broker, e);
        }
        self.rollback_source().await;
    }

    async fn rollback_source(&mut self) {
        if let Err(e) = self.source.rollback().await {
            warn!("Rollback on broker {} failed: {}", self.source_broker, e);
        }
    }
}

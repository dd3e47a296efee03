//! # Transport Adapter
//!
//! The thin interface the correlation core consumes. An adapter is bound to
//! one publish topic and one subscription.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// A message pulled from the subscription.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Transport-assigned message id (not the correlation id).
    pub message_id: String,
    pub data: Vec<u8>,
    /// 1 on first delivery, incremented on every redelivery.
    pub attempt: u32,
}

/// What the handler wants done with a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDecision {
    /// Remove the message from the subscription.
    Ack,
    /// Return the message for later redelivery.
    Nack,
}

/// Per-message callback for [`Transport::subscribe`].
///
/// Called inline on the receive path, so it must decide quickly and hand any
/// real work to a spawned task.
pub trait DeliveryHandler: Send + Sync {
    fn handle(&self, delivery: Delivery) -> AckDecision;
}

impl<F> DeliveryHandler for F
where
    F: Fn(Delivery) -> AckDecision + Send + Sync,
{
    fn handle(&self, delivery: Delivery) -> AckDecision {
        self(delivery)
    }
}

/// Server confirmation that a publish was accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    pub message_id: String,
}

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("Publish rejected: {0}")]
    Publish(String),

    #[error("Receive failed: {0}")]
    Receive(String),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Publish one payload to the bound topic and wait for acceptance.
    async fn publish(&self, payload: Vec<u8>) -> Result<PublishReceipt, TransportError>;

    /// Drain the bound subscription into `handler` until `cancel` fires
    /// (`Ok(())`) or an unrecoverable error occurs (`Err`).
    async fn subscribe(
        &self,
        cancel: CancellationToken,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<(), TransportError>;
}

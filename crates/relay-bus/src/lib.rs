//! # Relay Bus - Envelope Transport
//!
//! The transport side of the relay: how envelopes become bytes and how bytes
//! travel between the two peers.
//!
//! ```text
//! ┌──────────────┐  publish(bytes)  ┌──────────────┐  subscribe(handler)  ┌──────────────┐
//! │   Registry   │ ───────────────→ │    Topic     │ ───────────────────→ │   Registry   │
//! │   (peer A)   │                  │ Subscription │   Ack / Nack         │   (peer B)   │
//! └──────────────┘                  └──────────────┘ ←─────────────────── └──────────────┘
//! ```
//!
//! ## Delivery Contract
//!
//! - **At-least-once**: a nacked message comes back later, possibly more than once.
//! - **Unordered**: nothing is promised about order between messages.
//! - **Synchronous publish confirmation**: `publish` returns once the channel
//!   accepted the write, not once a peer processed it.

#![allow(clippy::missing_const_for_fn)]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod codec;
#[cfg(feature = "gcp-pubsub")]
pub mod gcp;
pub mod memory;
pub mod transport;

pub use codec::{decode, encode, encode_envelope, CodecError};
#[cfg(feature = "gcp-pubsub")]
pub use gcp::{GcpPubSubConfig, GcpPubSubTransport};
pub use memory::{BrokerStats, InMemoryBroker, InMemoryTransport};
pub use transport::{
    AckDecision, Delivery, DeliveryHandler, PublishReceipt, Transport, TransportError,
};

/// Messages pulled per round trip by pulling transports.
pub const DEFAULT_PULL_BATCH: i32 = 10;

/// Delay before a nacked message becomes visible again on the in-memory broker.
pub const DEFAULT_REDELIVERY_DELAY_MS: u64 = 50;

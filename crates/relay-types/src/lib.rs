//! # Relay Types Crate
//!
//! Wire types exchanged between the two peers of a relay.
//!
//! ## Design Principles
//!
//! - **Generic Envelope**: every message on the channel is an [`Envelope`]
//!   `{id, event, body}` encoded as a JSON object. Peers written in other
//!   languages read the same three keys.
//! - **Opaque Correlation**: the `id` is the only thing tying a reply to its
//!   request. Ids minted here are UUIDs, but ids received from a peer are
//!   taken verbatim.
//! - **Typed At The Boundary**: `body` stays a `serde_json::Value` inside the
//!   correlation core. Domain code converts it into a [`BrokerRequest`] (or a
//!   typed response) exactly where it interprets it.

pub mod broker;
pub mod envelope;
pub mod errors;
pub mod rpc;

pub use broker::*;
pub use envelope::{CorrelationId, Envelope};
pub use errors::BodyError;
pub use rpc::{RemoteError, RpcRequest, RpcResponse};

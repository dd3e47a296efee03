//! # Relay Correlation
//!
//! Synchronous-looking request/response over a publish/subscribe channel
//! that delivers at least once and in no particular order.
//!
//! ## Flow
//!
//! ```text
//!  caller                      peer
//!  ──────                      ────
//!  expect(id) ─┐
//!  vent_with(id, "Provision") ───────→ Sink("Provision") fires
//!              │                          │ domain work
//!              │               ←──────── vent_with(id, "Provision", reply)
//!  wait(timeout) ← dispatch loop matches id
//! ```
//!
//! ## Guarantees
//!
//! - At most one registration per key; a duplicate fails with
//!   [`RegistryError::AlreadyRegistered`] and never replaces the holder.
//! - A delivered envelope is matched by `id` first, then by `event`. A match
//!   is acked and its handler spawned; no match is nacked for redelivery.
//! - One-shot registrations (`wait_for`) are consumed by their first match
//!   and always removed when the wait ends, however it ends.
//! - The dispatch loop runs only while registrations exist; a transport
//!   failure stops it until the next registration starts it again.

#![allow(clippy::missing_const_for_fn)]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod config;
pub mod dispatch;
pub mod error;
pub mod handler;
pub mod pending;
pub mod ports;
pub mod registry;
pub mod rpc;
pub mod table;

pub use config::RegistryConfig;
pub use dispatch::DispatchState;
pub use error::RegistryError;
pub use handler::SinkHandler;
pub use pending::{cleanup_task, poll_worker, PendingRequestTable, PendingSource, PendingTicket};
pub use ports::AwaitReply;
pub use registry::{
    CorrelationRegistry, RegistryStats, ReplyWaiter, StatsSnapshot, WeakCorrelationRegistry,
};
pub use rpc::{RpcClient, RpcError, RpcMethod, RpcServer};
pub use table::{CallbackTable, MatchedBy, RegistrationKind};

//! # Relay Node
//!
//! Runs one side (or both sides) of a relay between a public service-broker
//! proxy and a private broker that it cannot reach directly.
//!
//! ## Modular Structure
//!
//! - `config` - Environment-driven configuration
//! - `binding` - Pub/Sub service-binding bootstrap
//! - `backend` - Port to the private broker (HTTP and in-memory)
//! - `worker` - Private side: serves broker operations from the channel
//! - `proxy` - Public side: typed broker calls through the channel
//! - `runtime` - Wiring, modes, and shutdown
//!
//! ## Request Flow
//!
//! ```text
//!  BrokerProxy ──Provision──→ [requests topic] ──→ LocalWorker ──HTTP──→ private broker
//!       ↑                                               │
//!       └─────────── [replies topic] ←── {response, error}
//! ```

pub mod backend;
pub mod binding;
pub mod config;
pub mod proxy;
pub mod runtime;
pub mod worker;

pub use backend::{BackendError, BrokerBackend, HttpBrokerBackend, InMemoryBrokerBackend};
pub use binding::{BindingError, PubSubBinding};
pub use config::{ConfigError, Mode, NodeConfig, TransportKind};
pub use proxy::{BrokerProxy, ProxyError};
pub use runtime::RelayRuntime;
pub use worker::LocalWorker;

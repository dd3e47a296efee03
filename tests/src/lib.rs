//! # Relay Test Suite
//!
//! Cross-crate scenarios over the in-memory broker.
//!
//! ## Structure
//!
//! ```text
//! tests/src/
//! └── integration/
//!     ├── correlation.rs   # Vent/Sink/WaitFor contract
//!     ├── dispatch.rs      # Dispatch loop lifecycle
//!     └── broker_flow.rs   # Proxy ↔ worker over the relay
//! ```
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test -p relay-tests
//! cargo test -p relay-tests integration::dispatch::
//! ```

#![allow(unused_variables)]
#![allow(dead_code)]

pub mod integration;

//! # Error Types
//!
//! Errors raised when an envelope body is interpreted as a typed value.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BodyError {
    /// No typed request is known for this event name.
    #[error("Unknown event: {0}")]
    UnknownEvent(String),

    /// The body does not match the shape expected for the event.
    #[error("Invalid body for event {event}: {source}")]
    InvalidBody {
        event: String,
        #[source]
        source: serde_json::Error,
    },
}

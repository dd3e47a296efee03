//! Error types for the correlation layer.

use relay_bus::{CodecError, TransportError};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    /// The key already has a registration. The existing one is untouched.
    #[error("Key already registered: {0}")]
    AlreadyRegistered(String),

    /// The body could not be serialized; nothing was published.
    #[error("Failed to encode envelope {id}: {source}")]
    Encode {
        id: String,
        #[source]
        source: CodecError,
    },

    /// The transport rejected the write. Not retried.
    #[error("Publish rejected for envelope {id}: {source}")]
    Publish {
        id: String,
        #[source]
        source: TransportError,
    },

    /// No matching reply arrived in time.
    #[error("Timed out after {waited:?} waiting for {id}")]
    Timeout { id: String, waited: Duration },

    /// The wait ended without a response: the request was finished, or its
    /// registration was removed.
    #[error("Request {id} was cancelled")]
    Cancelled { id: String },

    /// The registry was shut down.
    #[error("Registry is shut down")]
    ShutDown,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl RegistryError {
    /// A plain timeout: the channel may be fine, the whole exchange can be
    /// retried with a fresh id.
    pub fn is_timeout(&self) -> bool {
        matches!(self, RegistryError::Timeout { .. })
    }

    /// The envelope never left this process.
    pub fn is_publish_failure(&self) -> bool {
        matches!(
            self,
            RegistryError::Publish { .. } | RegistryError::Encode { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_is_distinguishable() {
        let timeout = RegistryError::Timeout {
            id: "X".into(),
            waited: Duration::from_millis(100),
        };
        let publish = RegistryError::Publish {
            id: "X".into(),
            source: TransportError::Publish("denied".into()),
        };

        assert!(timeout.is_timeout());
        assert!(!timeout.is_publish_failure());
        assert!(publish.is_publish_failure());
        assert!(!publish.is_timeout());
        assert_eq!(timeout.to_string(), "Timed out after 100ms waiting for X");
    }
}

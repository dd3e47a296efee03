//! # Envelope Codec
//!
//! JSON encoding of `{id, event, body}`. A decode failure concerns one
//! message only; callers log it and move on.

use relay_types::Envelope;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    /// The body could not be rendered as JSON.
    #[error("Failed to encode envelope {id}: {source}")]
    Encoding {
        id: String,
        #[source]
        source: serde_json::Error,
    },

    /// The payload is not a well-formed envelope.
    #[error("Failed to decode envelope ({len} bytes): {source}")]
    Decoding {
        len: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// Encode an envelope from its parts.
pub fn encode<B: Serialize + ?Sized>(id: &str, event: &str, body: &B) -> Result<Vec<u8>, CodecError> {
    let body = serde_json::to_value(body).map_err(|source| CodecError::Encoding {
        id: id.to_string(),
        source,
    })?;
    encode_envelope(&Envelope::new(id, event, body))
}

pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(envelope).map_err(|source| CodecError::Encoding {
        id: envelope.id.clone(),
        source,
    })
}

pub fn decode(bytes: &[u8]) -> Result<Envelope, CodecError> {
    serde_json::from_slice(bytes).map_err(|source| CodecError::Decoding {
        len: bytes.len(),
        source,
    })
}

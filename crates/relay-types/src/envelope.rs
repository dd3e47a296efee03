//! # Envelope
//!
//! The unit of transport between correlation registries.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// The generic message envelope carried over the pub/sub channel.
///
/// JSON keys are exactly `id`, `event` and `body`. A missing `body`
/// deserializes to `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Correlation key, unique per in-flight request.
    pub id: String,
    /// Logical operation name, e.g. `Provision`. Not unique.
    pub event: String,
    /// Arbitrary JSON payload.
    #[serde(default)]
    pub body: serde_json::Value,
}

impl Envelope {
    pub fn new(
        id: impl Into<String>,
        event: impl Into<String>,
        body: serde_json::Value,
    ) -> Self {
        Self {
            id: id.into(),
            event: event.into(),
            body,
        }
    }
}

/// Opaque correlation identifier.
///
/// Locally generated ids are time-ordered UUIDs (v7), which keeps ids sortable
/// by creation time in logs. Ids arriving from a peer are wrapped as-is.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Mint a fresh, globally unique id.
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for CorrelationId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for CorrelationId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<CorrelationId> for String {
    fn from(id: CorrelationId) -> Self {
        id.0
    }
}

impl AsRef<str> for CorrelationId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

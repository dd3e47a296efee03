//! # Request/Response Framing
//!
//! RPC-style callers wrap the envelope body in `{method, request}` on the
//! way out and `{response, error}` on the way back.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Outbound RPC body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    #[serde(default)]
    pub request: serde_json::Value,
}

/// Error reported by the remote side of a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub message: String,
    /// HTTP status of the upstream failure, when there was one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
}

impl RemoteError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status_code: None,
        }
    }

    pub fn with_status(message: impl Into<String>, status_code: u16) -> Self {
        Self {
            message: message.into(),
            status_code: Some(status_code),
        }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status_code {
            Some(code) => write!(f, "{} (status {})", self.message, code),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for RemoteError {}

/// Reply body. Exactly one of `response` and `error` is meaningful; a reply
/// carrying neither is read as a `null` response.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RpcResponse {
    #[serde(default)]
    pub response: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<RemoteError>,
}

impl RpcResponse {
    pub fn ok(response: serde_json::Value) -> Self {
        Self {
            response: Some(response),
            error: None,
        }
    }

    pub fn err(error: RemoteError) -> Self {
        Self {
            response: None,
            error: Some(error),
        }
    }

    pub fn into_result(self) -> Result<serde_json::Value, RemoteError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.response.unwrap_or(serde_json::Value::Null)),
        }
    }
}

impl From<Result<serde_json::Value, RemoteError>> for RpcResponse {
    fn from(result: Result<serde_json::Value, RemoteError>) -> Self {
        match result {
            Ok(response) => Self::ok(response),
            Err(error) => Self::err(error),
        }
    }
}

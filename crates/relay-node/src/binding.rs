//! Pub/Sub service-binding bootstrap.
//!
//! A platform-provided binding file carries the channel coordinates and a
//! service-account key, each base64-encoded under `data`:
//!
//! ```json
//! { "data": { "projectId": "...", "topicId": "...",
//!             "subscriptionId": "...", "privateKeyData": "..." } }
//! ```
//!
//! The key is written to a temp file that outlives the process so the cloud
//! client can read it by path.

use std::io::Write;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum BindingError {
    #[error("failed to read binding file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("binding file is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("binding field {field} is not valid base64: {source}")]
    Decode {
        field: &'static str,
        source: base64::DecodeError,
    },

    #[error("binding field {field} is not UTF-8")]
    NotUtf8 { field: &'static str },

    #[error("failed to write credentials file: {0}")]
    Credentials(#[source] std::io::Error),
}

#[derive(Debug, Deserialize)]
struct BindingFile {
    data: BindingData,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BindingData {
    private_key_data: String,
    project_id: String,
    subscription_id: String,
    topic_id: String,
}

/// Decoded channel coordinates from a service binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubBinding {
    pub project_id: String,
    pub topic_id: String,
    pub subscription_id: String,
    /// Where the decoded service-account key was written.
    pub credentials_path: PathBuf,
}

impl PubSubBinding {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, BindingError> {
        let path = path.as_ref();
        let raw = std::fs::read(path).map_err(|source| BindingError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_slice(&raw)
    }

    pub fn from_slice(raw: &[u8]) -> Result<Self, BindingError> {
        let file: BindingFile = serde_json::from_slice(raw)?;
        let data = file.data;

        let project_id = decode_text("projectId", &data.project_id)?;
        let topic_id = decode_text("topicId", &data.topic_id)?;
        let subscription_id = decode_text("subscriptionId", &data.subscription_id)?;
        let key = decode("privateKeyData", &data.private_key_data)?;
        let credentials_path = write_credentials(&key)?;

        info!(
            project_id = %project_id,
            topic = %topic_id,
            subscription = %subscription_id,
            credentials = %credentials_path.display(),
            "Loaded Pub/Sub binding"
        );

        Ok(Self {
            project_id,
            topic_id,
            subscription_id,
            credentials_path,
        })
    }
}

fn decode(field: &'static str, value: &str) -> Result<Vec<u8>, BindingError> {
    STANDARD
        .decode(value.trim())
        .map_err(|source| BindingError::Decode { field, source })
}

fn decode_text(field: &'static str, value: &str) -> Result<String, BindingError> {
    String::from_utf8(decode(field, value)?).map_err(|_| BindingError::NotUtf8 { field })
}

fn write_credentials(key: &[u8]) -> Result<PathBuf, BindingError> {
    let mut file = tempfile::Builder::new()
        .prefix("relay-credentials-")
        .suffix(".json")
        .tempfile()
        .map_err(BindingError::Credentials)?;
    file.write_all(key).map_err(BindingError::Credentials)?;
    file.flush().map_err(BindingError::Credentials)?;
    file.into_temp_path()
        .keep()
        .map_err(|e| BindingError::Credentials(e.error))
}

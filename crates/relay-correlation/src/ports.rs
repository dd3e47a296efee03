//! Outbound port: the asynchronous correlation primitive.
//!
//! Both the callback registry and the pending-request table honor the same
//! contract (register, deliver once, remove on exit); callers that only need
//! "wait for the reply to `id`" depend on this trait instead of either one.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::RegistryError;
use crate::pending::PendingRequestTable;
use crate::registry::CorrelationRegistry;

#[async_trait]
pub trait AwaitReply: Send + Sync {
    /// Block until the reply body for `id` arrives or `timeout` elapses.
    async fn await_reply(
        &self,
        id: &str,
        timeout: Option<Duration>,
    ) -> Result<serde_json::Value, RegistryError>;
}

#[async_trait]
impl AwaitReply for CorrelationRegistry {
    async fn await_reply(
        &self,
        id: &str,
        timeout: Option<Duration>,
    ) -> Result<serde_json::Value, RegistryError> {
        self.wait_for(id, timeout).await
    }
}

#[async_trait]
impl AwaitReply for PendingRequestTable {
    async fn await_reply(
        &self,
        id: &str,
        timeout: Option<Duration>,
    ) -> Result<serde_json::Value, RegistryError> {
        self.wait_for(id, timeout).await.map(|envelope| envelope.body)
    }
}

//! Public side of the relay: typed broker calls that travel through the
//! channel to the private worker.

use std::time::Duration;

use relay_correlation::{CorrelationRegistry, RegistryError, RpcClient, RpcError};
use relay_types::{
    BindRequest, BindResponse, BrokerEvent, CatalogResponse, DeprovisionRequest,
    DeprovisionResponse, LastOperationRequest, LastOperationResponse, ProvisionRequest,
    ProvisionResponse, RemoteError, UnbindRequest, UnbindResponse, UpdateRequest, UpdateResponse,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, instrument};

#[derive(Debug, Error)]
pub enum ProxyError {
    /// The private broker rejected the operation.
    #[error("broker error: {0}")]
    Remote(RemoteError),

    #[error("no reply from the private side within {0:?}")]
    Timeout(Duration),

    #[error("relay channel unavailable: {0}")]
    Channel(#[source] RegistryError),

    #[error("unreadable reply: {0}")]
    InvalidReply(#[source] RpcError),
}

impl From<RpcError> for ProxyError {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::Remote(remote) => ProxyError::Remote(remote),
            RpcError::Registry(RegistryError::Timeout { waited, .. }) => ProxyError::Timeout(waited),
            RpcError::Registry(e) => ProxyError::Channel(e),
            other => ProxyError::InvalidReply(other),
        }
    }
}

impl ProxyError {
    /// HTTP status an OSB front end should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            ProxyError::Remote(remote) => remote.status_code.unwrap_or(500),
            ProxyError::Timeout(_) => 504,
            ProxyError::Channel(_) => 503,
            ProxyError::InvalidReply(_) => 502,
        }
    }
}

#[derive(Clone)]
pub struct BrokerProxy {
    client: RpcClient,
}

impl BrokerProxy {
    pub fn new(registry: CorrelationRegistry) -> Self {
        Self {
            client: RpcClient::new(registry),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.client = self.client.with_timeout(timeout);
        self
    }

    async fn relay<Req, Resp>(&self, event: BrokerEvent, request: &Req) -> Result<Resp, ProxyError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let response = self.client.call_typed(event.as_str(), request).await?;
        debug!(event = %event, "Relayed broker operation");
        Ok(response)
    }

    #[instrument(skip(self))]
    pub async fn get_catalog(&self) -> Result<CatalogResponse, ProxyError> {
        self.relay(BrokerEvent::GetCatalog, &serde_json::Value::Null).await
    }

    #[instrument(skip(self, request), fields(instance_id = %request.instance_id))]
    pub async fn provision(&self, request: &ProvisionRequest) -> Result<ProvisionResponse, ProxyError> {
        self.relay(BrokerEvent::Provision, request).await
    }

    #[instrument(skip(self, request), fields(instance_id = %request.instance_id))]
    pub async fn deprovision(
        &self,
        request: &DeprovisionRequest,
    ) -> Result<DeprovisionResponse, ProxyError> {
        self.relay(BrokerEvent::Deprovision, request).await
    }

    #[instrument(skip(self, request), fields(instance_id = %request.instance_id))]
    pub async fn last_operation(
        &self,
        request: &LastOperationRequest,
    ) -> Result<LastOperationResponse, ProxyError> {
        self.relay(BrokerEvent::LastOperation, request).await
    }

    #[instrument(skip(self, request), fields(instance_id = %request.instance_id, binding_id = %request.binding_id))]
    pub async fn bind(&self, request: &BindRequest) -> Result<BindResponse, ProxyError> {
        self.relay(BrokerEvent::Bind, request).await
    }

    #[instrument(skip(self, request), fields(instance_id = %request.instance_id, binding_id = %request.binding_id))]
    pub async fn unbind(&self, request: &UnbindRequest) -> Result<UnbindResponse, ProxyError> {
        self.relay(BrokerEvent::Unbind, request).await
    }

    #[instrument(skip(self, request), fields(instance_id = %request.instance_id))]
    pub async fn update(&self, request: &UpdateRequest) -> Result<UpdateResponse, ProxyError> {
        self.relay(BrokerEvent::Update, request).await
    }
}

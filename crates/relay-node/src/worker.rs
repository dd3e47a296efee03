//! Private side of the relay: answers broker operations arriving on the
//! request channel by calling the private broker.

use std::sync::Arc;

use async_trait::async_trait;
use relay_correlation::{CorrelationRegistry, RegistryError, RpcMethod, RpcServer};
use relay_types::{BrokerEvent, BrokerRequest, RemoteError};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::backend::{BackendError, BrokerBackend};

/// Serves one broker operation.
struct BrokerMethod {
    event: BrokerEvent,
    backend: Arc<dyn BrokerBackend>,
}

fn to_reply<T: Serialize>(result: Result<T, BackendError>) -> Result<serde_json::Value, RemoteError> {
    let response = result.map_err(RemoteError::from)?;
    serde_json::to_value(response)
        .map_err(|e| RemoteError::new(format!("failed to encode broker response: {}", e)))
}

#[async_trait]
impl RpcMethod for BrokerMethod {
    #[instrument(skip(self, request), fields(event = %self.event))]
    async fn call(&self, request: serde_json::Value) -> Result<serde_json::Value, RemoteError> {
        let request = BrokerRequest::from_event(self.event.as_str(), request).map_err(|e| {
            warn!(error = %e, "Rejecting broker request");
            RemoteError::with_status(e.to_string(), 400)
        })?;

        let backend = &self.backend;
        let reply = match request {
            BrokerRequest::GetCatalog => to_reply(backend.get_catalog().await),
            BrokerRequest::Provision(r) => to_reply(backend.provision(r).await),
            BrokerRequest::Deprovision(r) => to_reply(backend.deprovision(r).await),
            BrokerRequest::LastOperation(r) => to_reply(backend.last_operation(r).await),
            BrokerRequest::Bind(r) => to_reply(backend.bind(r).await),
            BrokerRequest::Unbind(r) => to_reply(backend.unbind(r).await),
            BrokerRequest::Update(r) => to_reply(backend.update(r).await),
        };

        if let Err(e) = &reply {
            warn!(error = %e, "Broker operation failed");
        }
        reply
    }
}

pub struct LocalWorker {
    server: RpcServer,
}

impl LocalWorker {
    /// Register a sink for every broker operation on `registry`.
    pub fn start(
        registry: CorrelationRegistry,
        backend: Arc<dyn BrokerBackend>,
    ) -> Result<Self, RegistryError> {
        let server = RpcServer::new(registry);
        for event in BrokerEvent::ALL {
            let method = BrokerMethod {
                event,
                backend: backend.clone(),
            };
            if let Err(e) = server.serve(event.as_str(), method) {
                server.stop();
                return Err(e);
            }
        }
        info!(operations = BrokerEvent::ALL.len(), "Local worker serving broker operations");
        Ok(Self { server })
    }

    pub fn operations(&self) -> Vec<String> {
        self.server.methods()
    }

    pub fn stop(&self) {
        self.server.stop();
        info!("Local worker stopped");
    }
}

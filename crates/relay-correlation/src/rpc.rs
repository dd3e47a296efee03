//! RPC framing over the registry.
//!
//! Requests travel as `{method, request}` under event `method`; replies
//! travel as `{response, error}` under the same event and the request's id.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use relay_types::{CorrelationId, RemoteError, RpcRequest, RpcResponse};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::error::RegistryError;
use crate::registry::CorrelationRegistry;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The peer ran the call and reported a failure.
    #[error("Remote error: {0}")]
    Remote(RemoteError),

    #[error("Failed to serialize request for {method}: {source}")]
    InvalidRequest {
        method: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid reply to {id}: {source}")]
    InvalidReply {
        id: String,
        #[source]
        source: serde_json::Error,
    },
}

impl RpcError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, RpcError::Registry(e) if e.is_timeout())
    }
}

/// Calling side: vent a request, wait for the correlated reply.
#[derive(Clone)]
pub struct RpcClient {
    registry: CorrelationRegistry,
    timeout: Option<Duration>,
}

impl RpcClient {
    pub fn new(registry: CorrelationRegistry) -> Self {
        Self {
            registry,
            timeout: None,
        }
    }

    /// Override the registry's default wait timeout for calls.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn registry(&self) -> &CorrelationRegistry {
        &self.registry
    }

    pub async fn call<Req>(&self, method: &str, request: &Req) -> Result<serde_json::Value, RpcError>
    where
        Req: Serialize + ?Sized,
    {
        self.exchange(method, request).await
    }

    pub async fn call_typed<Req, Resp>(&self, method: &str, request: &Req) -> Result<Resp, RpcError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        self.exchange(method, request).await
    }

    async fn exchange<Req, Resp>(&self, method: &str, request: &Req) -> Result<Resp, RpcError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let request = serde_json::to_value(request).map_err(|source| RpcError::InvalidRequest {
            method: method.to_string(),
            source,
        })?;
        let body = RpcRequest {
            method: method.to_string(),
            request,
        };

        let id = CorrelationId::generate();
        // Registered before publishing so the reply cannot arrive unclaimed
        let waiter = self.registry.expect(id.clone())?;
        self.registry.vent_with(id.clone(), method, &body).await?;
        debug!(correlation_id = %id, method = method, "Sent RPC request");

        let reply = waiter.wait(self.timeout).await?;
        let invalid = |source: serde_json::Error| RpcError::InvalidReply {
            id: id.to_string(),
            source,
        };
        let reply: RpcResponse = serde_json::from_value(reply).map_err(invalid)?;
        let response = reply.into_result().map_err(RpcError::Remote)?;
        serde_json::from_value(response).map_err(invalid)
    }
}

/// One served method.
#[async_trait]
pub trait RpcMethod: Send + Sync + 'static {
    async fn call(&self, request: serde_json::Value) -> Result<serde_json::Value, RemoteError>;
}

/// Serving side: one persistent sink per method name.
pub struct RpcServer {
    registry: CorrelationRegistry,
    methods: Mutex<Vec<String>>,
}

impl RpcServer {
    pub fn new(registry: CorrelationRegistry) -> Self {
        Self {
            registry,
            methods: Mutex::new(Vec::new()),
        }
    }

    /// Answer every request for `method` with `handler`. Malformed requests
    /// get an error reply instead of silence, so the caller does not wait
    /// out its timeout.
    pub fn serve<M: RpcMethod>(&self, method: &str, handler: M) -> Result<(), RegistryError> {
        let handler = Arc::new(handler);
        let registry = self.registry.downgrade();
        let name = method.to_string();

        self.registry
            .sink(method, move |id: String, body: serde_json::Value| {
                let handler = handler.clone();
                let registry = registry.clone();
                let method = name.clone();
                async move {
                    let reply: RpcResponse = match serde_json::from_value::<RpcRequest>(body) {
                        Ok(request) => {
                            if request.method != method {
                                warn!(
                                    correlation_id = %id,
                                    event = %method,
                                    body_method = %request.method,
                                    "Request method differs from event, serving event"
                                );
                            }
                            handler.call(request.request).await.into()
                        }
                        Err(e) => {
                            warn!(correlation_id = %id, method = %method, error = %e, "Malformed request");
                            RpcResponse::err(RemoteError::new(format!("malformed request: {}", e)))
                        }
                    };

                    let Some(registry) = registry.upgrade() else {
                        return;
                    };
                    if let Err(e) = registry.vent_with(id.clone(), &method, &reply).await {
                        error!(
                            correlation_id = %id,
                            method = %method,
                            error = %e,
                            "Failed to publish reply"
                        );
                    }
                }
            })?;

        self.methods.lock().push(method.to_string());
        Ok(())
    }

    pub fn methods(&self) -> Vec<String> {
        self.methods.lock().clone()
    }

    /// Remove every sink registered by this server.
    pub fn stop(&self) {
        for method in self.methods.lock().drain(..) {
            self.registry.remove_sink(&method);
        }
    }
}

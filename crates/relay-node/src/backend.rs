//! # Broker Backend
//!
//! The private side's view of the real service broker. `HttpBrokerBackend`
//! speaks the Open Service Broker v2 REST API; `InMemoryBrokerBackend` keeps
//! instances in memory for loopback runs and tests.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use relay_types::{
    BindRequest, BindResponse, CatalogResponse, DeprovisionRequest, DeprovisionResponse,
    LastOperationRequest, LastOperationResponse, LastOperationState, ProvisionRequest,
    ProvisionResponse, RemoteError, UnbindRequest, UnbindResponse, UpdateRequest, UpdateResponse,
};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, warn};

/// OSB API version sent with every request.
pub const BROKER_API_VERSION: &str = "2.13";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("broker request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The broker answered with a non-success status.
    #[error("broker returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("unreadable broker response: {0}")]
    InvalidResponse(#[from] serde_json::Error),
}

impl From<BackendError> for RemoteError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Status { status, message } => RemoteError::with_status(message, status),
            BackendError::Http(e) => match e.status() {
                Some(status) => RemoteError::with_status(e.to_string(), status.as_u16()),
                None => RemoteError::new(e.to_string()),
            },
            other => RemoteError::new(other.to_string()),
        }
    }
}

fn status_error(status: u16, message: impl Into<String>) -> BackendError {
    BackendError::Status {
        status,
        message: message.into(),
    }
}

/// Operations the worker relays to the private broker.
#[async_trait]
pub trait BrokerBackend: Send + Sync + 'static {
    async fn get_catalog(&self) -> Result<CatalogResponse, BackendError>;
    async fn provision(&self, request: ProvisionRequest) -> Result<ProvisionResponse, BackendError>;
    async fn deprovision(&self, request: DeprovisionRequest) -> Result<DeprovisionResponse, BackendError>;
    async fn last_operation(
        &self,
        request: LastOperationRequest,
    ) -> Result<LastOperationResponse, BackendError>;
    async fn bind(&self, request: BindRequest) -> Result<BindResponse, BackendError>;
    async fn unbind(&self, request: UnbindRequest) -> Result<UnbindResponse, BackendError>;
    async fn update(&self, request: UpdateRequest) -> Result<UpdateResponse, BackendError>;
}

// =============================================================================
// HTTP
// =============================================================================

/// OSB error body.
#[derive(Debug, Deserialize)]
struct BrokerErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

pub struct HttpBrokerBackend {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBrokerBackend {
    pub fn new(base_url: impl Into<String>) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn instance_url(&self, instance_id: &str) -> String {
        format!("{}/v2/service_instances/{}", self.base_url, instance_id)
    }

    fn binding_url(&self, instance_id: &str, binding_id: &str) -> String {
        format!(
            "{}/service_bindings/{}",
            self.instance_url(instance_id),
            binding_id
        )
    }

    /// Send and decode. Returns the status alongside the body so callers can
    /// tell an accepted (asynchronous) operation from a finished one.
    async fn send<T: DeserializeOwned>(
        &self,
        method: Method,
        url: String,
        query: &[(&str, String)],
        body: Option<serde_json::Value>,
    ) -> Result<(StatusCode, T), BackendError> {
        debug!(method = %method, url = %url, "Calling broker");

        let mut request = self
            .client
            .request(method, &url)
            .header("X-Broker-API-Version", BROKER_API_VERSION)
            .query(query);
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await?;
        let status = response.status();
        let bytes = response.bytes().await?;

        if !status.is_success() {
            let message = serde_json::from_slice::<BrokerErrorBody>(&bytes)
                .ok()
                .and_then(|b| b.description.or(b.error))
                .unwrap_or_else(|| String::from_utf8_lossy(&bytes).into_owned());
            warn!(status = status.as_u16(), url = %url, message = %message, "Broker call failed");
            return Err(status_error(status.as_u16(), message));
        }

        let parsed = if bytes.is_empty() {
            serde_json::from_slice(b"{}")?
        } else {
            serde_json::from_slice(&bytes)?
        };
        Ok((status, parsed))
    }
}

fn accepts_incomplete(flag: bool) -> (&'static str, String) {
    ("accepts_incomplete", flag.to_string())
}

#[async_trait]
impl BrokerBackend for HttpBrokerBackend {
    async fn get_catalog(&self) -> Result<CatalogResponse, BackendError> {
        let url = format!("{}/v2/catalog", self.base_url);
        let (_, catalog) = self.send(Method::GET, url, &[], None).await?;
        Ok(catalog)
    }

    async fn provision(&self, request: ProvisionRequest) -> Result<ProvisionResponse, BackendError> {
        let body = json!({
            "service_id": request.service_id,
            "plan_id": request.plan_id,
            "organization_guid": request.organization_guid,
            "space_guid": request.space_guid,
            "parameters": request.parameters,
            "context": request.context,
        });
        let (status, mut response): (_, ProvisionResponse) = self
            .send(
                Method::PUT,
                self.instance_url(&request.instance_id),
                &[accepts_incomplete(request.accepts_incomplete)],
                Some(body),
            )
            .await?;
        response.is_async = status == StatusCode::ACCEPTED;
        Ok(response)
    }

    async fn deprovision(&self, request: DeprovisionRequest) -> Result<DeprovisionResponse, BackendError> {
        let (status, mut response): (_, DeprovisionResponse) = self
            .send(
                Method::DELETE,
                self.instance_url(&request.instance_id),
                &[
                    ("service_id", request.service_id),
                    ("plan_id", request.plan_id),
                    accepts_incomplete(request.accepts_incomplete),
                ],
                None,
            )
            .await?;
        response.is_async = status == StatusCode::ACCEPTED;
        Ok(response)
    }

    async fn last_operation(
        &self,
        request: LastOperationRequest,
    ) -> Result<LastOperationResponse, BackendError> {
        let mut query = Vec::new();
        if let Some(service_id) = request.service_id {
            query.push(("service_id", service_id));
        }
        if let Some(plan_id) = request.plan_id {
            query.push(("plan_id", plan_id));
        }
        if let Some(operation) = request.operation {
            query.push(("operation", operation));
        }
        let url = format!("{}/last_operation", self.instance_url(&request.instance_id));
        let (_, response) = self.send(Method::GET, url, &query, None).await?;
        Ok(response)
    }

    async fn bind(&self, request: BindRequest) -> Result<BindResponse, BackendError> {
        let body = json!({
            "service_id": request.service_id,
            "plan_id": request.plan_id,
            "app_guid": request.app_guid,
            "parameters": request.parameters,
            "context": request.context,
        });
        let (status, mut response): (_, BindResponse) = self
            .send(
                Method::PUT,
                self.binding_url(&request.instance_id, &request.binding_id),
                &[],
                Some(body),
            )
            .await?;
        response.is_async = status == StatusCode::ACCEPTED;
        Ok(response)
    }

    async fn unbind(&self, request: UnbindRequest) -> Result<UnbindResponse, BackendError> {
        let (status, mut response): (_, UnbindResponse) = self
            .send(
                Method::DELETE,
                self.binding_url(&request.instance_id, &request.binding_id),
                &[
                    ("service_id", request.service_id),
                    ("plan_id", request.plan_id),
                ],
                None,
            )
            .await?;
        response.is_async = status == StatusCode::ACCEPTED;
        Ok(response)
    }

    async fn update(&self, request: UpdateRequest) -> Result<UpdateResponse, BackendError> {
        let body = json!({
            "service_id": request.service_id,
            "plan_id": request.plan_id,
            "parameters": request.parameters,
            "context": request.context,
        });
        let (status, mut response): (_, UpdateResponse) = self
            .send(
                Method::PATCH,
                self.instance_url(&request.instance_id),
                &[accepts_incomplete(request.accepts_incomplete)],
                Some(body),
            )
            .await?;
        response.is_async = status == StatusCode::ACCEPTED;
        Ok(response)
    }
}

// =============================================================================
// IN-MEMORY
// =============================================================================

#[derive(Debug, Clone)]
struct Instance {
    service_id: String,
    plan_id: String,
    bindings: Vec<String>,
}

/// Broker kept entirely in memory. Accepts every operation synchronously
/// unless built with [`InMemoryBrokerBackend::asynchronous`], in which case
/// requests that accept incomplete results are answered with an operation
/// token and report `succeeded` on the next `last_operation`.
#[derive(Default)]
pub struct InMemoryBrokerBackend {
    services: Vec<serde_json::Value>,
    asynchronous: bool,
    instances: Mutex<HashMap<String, Instance>>,
}

impl InMemoryBrokerBackend {
    pub fn new(services: Vec<serde_json::Value>) -> Self {
        Self {
            services,
            ..Self::default()
        }
    }

    /// A one-service, one-plan catalog.
    pub fn with_sample_catalog() -> Self {
        Self::new(vec![json!({
            "id": "relay-sample-service",
            "name": "relay-sample",
            "description": "Sample service served through the relay",
            "bindable": true,
            "plans": [{
                "id": "relay-sample-plan",
                "name": "default",
                "description": "The default plan",
            }],
        })])
    }

    pub fn asynchronous(mut self) -> Self {
        self.asynchronous = true;
        self
    }

    pub fn instance_count(&self) -> usize {
        self.instances.lock().len()
    }

    pub fn binding_count(&self, instance_id: &str) -> usize {
        self.instances
            .lock()
            .get(instance_id)
            .map(|i| i.bindings.len())
            .unwrap_or(0)
    }

    fn operation(&self, accepts_incomplete: bool, verb: &str, id: &str) -> (bool, Option<String>) {
        if self.asynchronous && accepts_incomplete {
            (true, Some(format!("{}-{}", verb, id)))
        } else {
            (false, None)
        }
    }
}

#[async_trait]
impl BrokerBackend for InMemoryBrokerBackend {
    async fn get_catalog(&self) -> Result<CatalogResponse, BackendError> {
        Ok(CatalogResponse {
            services: self.services.clone(),
        })
    }

    async fn provision(&self, request: ProvisionRequest) -> Result<ProvisionResponse, BackendError> {
        let mut instances = self.instances.lock();
        if let Some(existing) = instances.get(&request.instance_id) {
            if existing.service_id == request.service_id && existing.plan_id == request.plan_id {
                return Ok(ProvisionResponse::default());
            }
            return Err(status_error(409, format!("instance {} already exists", request.instance_id)));
        }
        instances.insert(
            request.instance_id.clone(),
            Instance {
                service_id: request.service_id,
                plan_id: request.plan_id,
                bindings: Vec::new(),
            },
        );
        let (is_async, operation) =
            self.operation(request.accepts_incomplete, "provision", &request.instance_id);
        Ok(ProvisionResponse {
            is_async,
            dashboard_url: None,
            operation,
        })
    }

    async fn deprovision(&self, request: DeprovisionRequest) -> Result<DeprovisionResponse, BackendError> {
        if self.instances.lock().remove(&request.instance_id).is_none() {
            return Err(status_error(410, format!("instance {} does not exist", request.instance_id)));
        }
        let (is_async, operation) =
            self.operation(request.accepts_incomplete, "deprovision", &request.instance_id);
        Ok(DeprovisionResponse { is_async, operation })
    }

    async fn last_operation(
        &self,
        request: LastOperationRequest,
    ) -> Result<LastOperationResponse, BackendError> {
        let exists = self.instances.lock().contains_key(&request.instance_id);
        let deprovisioning = request
            .operation
            .as_deref()
            .is_some_and(|op| op.starts_with("deprovision-"));
        if !exists && !deprovisioning {
            return Err(status_error(410, format!("instance {} does not exist", request.instance_id)));
        }
        Ok(LastOperationResponse {
            state: LastOperationState::Succeeded,
            description: request.operation,
        })
    }

    async fn bind(&self, request: BindRequest) -> Result<BindResponse, BackendError> {
        let mut instances = self.instances.lock();
        let Some(instance) = instances.get_mut(&request.instance_id) else {
            return Err(status_error(404, format!("instance {} does not exist", request.instance_id)));
        };
        if !instance.bindings.contains(&request.binding_id) {
            instance.bindings.push(request.binding_id.clone());
        }
        Ok(BindResponse {
            credentials: Some(json!({
                "instance_id": request.instance_id,
                "binding_id": request.binding_id,
            })),
            ..BindResponse::default()
        })
    }

    async fn unbind(&self, request: UnbindRequest) -> Result<UnbindResponse, BackendError> {
        let mut instances = self.instances.lock();
        let removed = instances.get_mut(&request.instance_id).and_then(|instance| {
            let position = instance.bindings.iter().position(|b| *b == request.binding_id)?;
            Some(instance.bindings.remove(position))
        });
        if removed.is_none() {
            return Err(status_error(410, format!("binding {} does not exist", request.binding_id)));
        }
        Ok(UnbindResponse::default())
    }

    async fn update(&self, request: UpdateRequest) -> Result<UpdateResponse, BackendError> {
        let mut instances = self.instances.lock();
        let Some(instance) = instances.get_mut(&request.instance_id) else {
            return Err(status_error(404, format!("instance {} does not exist", request.instance_id)));
        };
        if let Some(plan_id) = request.plan_id {
            instance.plan_id = plan_id;
        }
        let (is_async, operation) =
            self.operation(request.accepts_incomplete, "update", &request.instance_id);
        Ok(UpdateResponse {
            is_async,
            dashboard_url: None,
            operation,
        })
    }
}

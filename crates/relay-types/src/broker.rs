//! # Broker Operations
//!
//! Typed bodies for the Open Service Broker operations relayed between the
//! public proxy and the private worker. The event name of an envelope selects
//! the variant; the body is converted explicitly where domain code reads it.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::BodyError;

/// Event names for every relayed broker operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BrokerEvent {
    GetCatalog,
    Provision,
    Deprovision,
    LastOperation,
    Bind,
    Unbind,
    Update,
}

impl BrokerEvent {
    pub const ALL: [BrokerEvent; 7] = [
        BrokerEvent::GetCatalog,
        BrokerEvent::Provision,
        BrokerEvent::Deprovision,
        BrokerEvent::LastOperation,
        BrokerEvent::Bind,
        BrokerEvent::Unbind,
        BrokerEvent::Update,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BrokerEvent::GetCatalog => "GetCatalog",
            BrokerEvent::Provision => "Provision",
            BrokerEvent::Deprovision => "Deprovision",
            BrokerEvent::LastOperation => "LastOperation",
            BrokerEvent::Bind => "Bind",
            BrokerEvent::Unbind => "Unbind",
            BrokerEvent::Update => "Update",
        }
    }
}

impl fmt::Display for BrokerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BrokerEvent {
    type Err = BodyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BrokerEvent::ALL
            .into_iter()
            .find(|event| event.as_str() == s)
            .ok_or_else(|| BodyError::UnknownEvent(s.to_string()))
    }
}

// =============================================================================
// REQUESTS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisionRequest {
    pub instance_id: String,
    pub service_id: String,
    pub plan_id: String,
    #[serde(default)]
    pub organization_guid: String,
    #[serde(default)]
    pub space_guid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
    #[serde(default)]
    pub accepts_incomplete: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeprovisionRequest {
    pub instance_id: String,
    pub service_id: String,
    pub plan_id: String,
    #[serde(default)]
    pub accepts_incomplete: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastOperationRequest {
    pub instance_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,
    /// Operation token returned by an asynchronous provision/update/deprovision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BindRequest {
    pub instance_id: String,
    pub binding_id: String,
    pub service_id: String,
    pub plan_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_guid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnbindRequest {
    pub instance_id: String,
    pub binding_id: String,
    pub service_id: String,
    pub plan_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateRequest {
    pub instance_id: String,
    pub service_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
    #[serde(default)]
    pub accepts_incomplete: bool,
}

/// A broker operation, keyed by event name.
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerRequest {
    GetCatalog,
    Provision(ProvisionRequest),
    Deprovision(DeprovisionRequest),
    LastOperation(LastOperationRequest),
    Bind(BindRequest),
    Unbind(UnbindRequest),
    Update(UpdateRequest),
}

impl BrokerRequest {
    pub fn event(&self) -> BrokerEvent {
        match self {
            BrokerRequest::GetCatalog => BrokerEvent::GetCatalog,
            BrokerRequest::Provision(_) => BrokerEvent::Provision,
            BrokerRequest::Deprovision(_) => BrokerEvent::Deprovision,
            BrokerRequest::LastOperation(_) => BrokerEvent::LastOperation,
            BrokerRequest::Bind(_) => BrokerEvent::Bind,
            BrokerRequest::Unbind(_) => BrokerEvent::Unbind,
            BrokerRequest::Update(_) => BrokerEvent::Update,
        }
    }

    /// Render the variant payload as an envelope body.
    pub fn to_body(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            BrokerRequest::GetCatalog => Ok(serde_json::Value::Null),
            BrokerRequest::Provision(r) => serde_json::to_value(r),
            BrokerRequest::Deprovision(r) => serde_json::to_value(r),
            BrokerRequest::LastOperation(r) => serde_json::to_value(r),
            BrokerRequest::Bind(r) => serde_json::to_value(r),
            BrokerRequest::Unbind(r) => serde_json::to_value(r),
            BrokerRequest::Update(r) => serde_json::to_value(r),
        }
    }

    /// Interpret `body` according to `event`.
    pub fn from_event(event: &str, body: serde_json::Value) -> Result<Self, BodyError> {
        let event = event.parse::<BrokerEvent>()?;
        Ok(match event {
            BrokerEvent::GetCatalog => BrokerRequest::GetCatalog,
            BrokerEvent::Provision => BrokerRequest::Provision(typed_body(event, body)?),
            BrokerEvent::Deprovision => BrokerRequest::Deprovision(typed_body(event, body)?),
            BrokerEvent::LastOperation => BrokerRequest::LastOperation(typed_body(event, body)?),
            BrokerEvent::Bind => BrokerRequest::Bind(typed_body(event, body)?),
            BrokerEvent::Unbind => BrokerRequest::Unbind(typed_body(event, body)?),
            BrokerEvent::Update => BrokerRequest::Update(typed_body(event, body)?),
        })
    }
}

/// Deserialize a body for `event`, tagging failures with the event name.
pub fn typed_body<T: DeserializeOwned>(
    event: BrokerEvent,
    body: serde_json::Value,
) -> Result<T, BodyError> {
    serde_json::from_value(body).map_err(|source| BodyError::InvalidBody {
        event: event.to_string(),
        source,
    })
}

// =============================================================================
// RESPONSES
// =============================================================================

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CatalogResponse {
    /// Service offerings, passed through untouched.
    #[serde(default)]
    pub services: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProvisionResponse {
    #[serde(rename = "async", default)]
    pub is_async: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dashboard_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DeprovisionResponse {
    #[serde(rename = "async", default)]
    pub is_async: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LastOperationState {
    #[serde(rename = "in progress")]
    InProgress,
    #[serde(rename = "succeeded")]
    Succeeded,
    #[serde(rename = "failed")]
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastOperationResponse {
    pub state: LastOperationState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BindResponse {
    #[serde(rename = "async", default)]
    pub is_async: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub syslog_drain_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route_service_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UnbindResponse {
    #[serde(rename = "async", default)]
    pub is_async: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UpdateResponse {
    #[serde(rename = "async", default)]
    pub is_async: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dashboard_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
}

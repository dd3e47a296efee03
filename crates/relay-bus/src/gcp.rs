//! # Google Cloud Pub/Sub Transport
//!
//! Binds one topic for publishing and one subscription for receiving.
//! Both must already exist; they are provisioned out of band together with
//! the service binding that names them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use google_cloud_googleapis::pubsub::v1::PubsubMessage;
use google_cloud_pubsub::client::google_cloud_auth::credentials::CredentialsFile;
use google_cloud_pubsub::client::{Client, ClientConfig};
use google_cloud_pubsub::publisher::Publisher;
use google_cloud_pubsub::subscription::Subscription;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::transport::{
    AckDecision, Delivery, DeliveryHandler, PublishReceipt, Transport, TransportError,
};
use crate::DEFAULT_PULL_BATCH;

/// Connection settings for [`GcpPubSubTransport`].
#[derive(Debug, Clone)]
pub struct GcpPubSubConfig {
    pub project_id: String,
    pub topic: String,
    pub subscription: String,
    /// Service account key file. Application Default Credentials when unset.
    pub credentials_path: Option<String>,
    /// Pause after an empty pull before asking again.
    pub idle_backoff: Duration,
}

impl GcpPubSubConfig {
    pub fn new(
        project_id: impl Into<String>,
        topic: impl Into<String>,
        subscription: impl Into<String>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            topic: topic.into(),
            subscription: subscription.into(),
            credentials_path: None,
            idle_backoff: Duration::from_millis(250),
        }
    }

    pub fn with_credentials_path(mut self, path: impl Into<String>) -> Self {
        self.credentials_path = Some(path.into());
        self
    }
}

pub struct GcpPubSubTransport {
    config: GcpPubSubConfig,
    publisher: Publisher,
    subscription: Subscription,
}

impl GcpPubSubTransport {
    /// Authenticate, then check that both the topic and the subscription exist.
    pub async fn connect(config: GcpPubSubConfig) -> Result<Self, TransportError> {
        let client_config = match &config.credentials_path {
            Some(path) => {
                let credentials = CredentialsFile::new_from_file(path.clone())
                    .await
                    .map_err(|e| {
                        TransportError::Connection(format!("Failed to read credentials {}: {}", path, e))
                    })?;
                ClientConfig::default()
                    .with_credentials(credentials)
                    .await
                    .map_err(|e| {
                        TransportError::Connection(format!("Failed to configure Pub/Sub auth: {}", e))
                    })?
            }
            None => ClientConfig::default().with_auth().await.map_err(|e| {
                TransportError::Connection(format!("Failed to configure Pub/Sub auth: {}", e))
            })?,
        };
        let client_config = ClientConfig {
            project_id: Some(config.project_id.clone()),
            ..client_config
        };

        let client = Client::new(client_config)
            .await
            .map_err(|e| TransportError::Connection(format!("Failed to create Pub/Sub client: {}", e)))?;

        let topic = client.topic(&config.topic);
        if !topic
            .exists(None)
            .await
            .map_err(|e| TransportError::Connection(format!("Failed to check topic existence: {}", e)))?
        {
            return Err(TransportError::NotFound {
                kind: "topic",
                name: config.topic.clone(),
            });
        }

        let subscription = client.subscription(&config.subscription);
        if !subscription.exists(None).await.map_err(|e| {
            TransportError::Connection(format!("Failed to check subscription existence: {}", e))
        })? {
            return Err(TransportError::NotFound {
                kind: "subscription",
                name: config.subscription.clone(),
            });
        }

        info!(
            project_id = %config.project_id,
            topic = %config.topic,
            subscription = %config.subscription,
            "Connected to Google Pub/Sub"
        );

        Ok(Self {
            publisher: topic.new_publisher(None),
            subscription,
            config,
        })
    }
}

#[async_trait]
impl Transport for GcpPubSubTransport {
    async fn publish(&self, payload: Vec<u8>) -> Result<PublishReceipt, TransportError> {
        let message = PubsubMessage {
            data: payload.into(),
            ..Default::default()
        };

        let awaiter = self.publisher.publish(message).await;
        let message_id = awaiter
            .get()
            .await
            .map_err(|e| TransportError::Publish(format!("Failed to publish to Pub/Sub: {}", e)))?;

        debug!(topic = %self.config.topic, message_id = %message_id, "Published to Pub/Sub");
        Ok(PublishReceipt { message_id })
    }

    async fn subscribe(
        &self,
        cancel: CancellationToken,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<(), TransportError> {
        info!(subscription = %self.config.subscription, "Starting Pub/Sub pull");

        loop {
            let pulled = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                pulled = self.subscription.pull(DEFAULT_PULL_BATCH, None) => pulled,
            };

            let messages = pulled.map_err(|e| {
                error!(subscription = %self.config.subscription, error = %e, "Pull failed");
                TransportError::Receive(e.to_string())
            })?;

            if messages.is_empty() {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(self.config.idle_backoff) => {}
                }
                continue;
            }

            // Everything pulled in this batch is answered, even after cancel,
            // so nothing is left waiting for its ack deadline.
            for message in messages {
                let delivery = Delivery {
                    message_id: message.message.message_id.clone(),
                    data: message.message.data.clone(),
                    attempt: message.delivery_attempt().map(|n| n as u32).unwrap_or(1),
                };

                let outcome = match handler.handle(delivery) {
                    AckDecision::Ack => message.ack().await,
                    AckDecision::Nack => message.nack().await,
                };
                if let Err(e) = outcome {
                    warn!(
                        subscription = %self.config.subscription,
                        error = %e,
                        "Failed to answer Pub/Sub message, it will be redelivered"
                    );
                }
            }
        }
    }
}

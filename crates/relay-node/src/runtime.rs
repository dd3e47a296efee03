//! Relay runtime: builds transports and registries from configuration, runs
//! the selected mode, and shuts everything down in order.
//!
//! ## Channel Layout
//!
//! Each side publishes to one topic and receives from a subscription on the
//! other side's topic:
//!
//! ```text
//!   proxy  ──publish──→ relay-requests ──→ relay-requests-worker ──→ worker
//!   proxy  ←── relay-replies-proxy ←── relay-replies ←──publish── worker
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use relay_bus::{InMemoryBroker, Transport};
use relay_correlation::{CorrelationRegistry, DispatchState};
use relay_telemetry::{observe_registry, RegistryMetrics};
use relay_types::{
    BindRequest, DeprovisionRequest, LastOperationRequest, ProvisionRequest, UnbindRequest,
    UpdateRequest,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::backend::{BrokerBackend, HttpBrokerBackend, InMemoryBrokerBackend};
use crate::binding::PubSubBinding;
use crate::config::{Mode, NodeConfig};
use crate::proxy::{BrokerProxy, ProxyError};
use crate::worker::LocalWorker;

pub const REQUESTS_TOPIC: &str = "relay-requests";
pub const REQUESTS_SUBSCRIPTION: &str = "relay-requests-worker";
pub const REPLIES_TOPIC: &str = "relay-replies";
pub const REPLIES_SUBSCRIPTION: &str = "relay-replies-proxy";

/// One registry and the role it plays.
struct Side {
    role: &'static str,
    registry: CorrelationRegistry,
}

pub struct RelayRuntime {
    config: NodeConfig,
    sides: Vec<Side>,
    worker: Option<LocalWorker>,
    proxy: Option<BrokerProxy>,
    shutdown: CancellationToken,
    metrics_task: Mutex<Option<JoinHandle<()>>>,
}

impl RelayRuntime {
    /// Resolve the binding file (if any), validate, and wire the mode.
    pub async fn new(mut config: NodeConfig) -> Result<Self> {
        if let Some(path) = config.binding_file.clone() {
            let binding = PubSubBinding::load(&path)
                .with_context(|| format!("failed to load binding file {}", path))?;
            config.apply_binding(&binding);
        }
        config.validate().context("invalid relay configuration")?;

        info!(mode = %config.mode, "Creating relay runtime");

        match config.mode {
            Mode::Loopback => {
                let broker = InMemoryBroker::new();
                let backend = Arc::new(InMemoryBrokerBackend::with_sample_catalog().asynchronous());
                Self::loopback(config, &broker, backend)
            }
            Mode::Local => {
                let transport = cloud_transport(&config).await?;
                let registry = CorrelationRegistry::new(transport, config.registry_config("worker"))?;
                let backend = Arc::new(
                    HttpBrokerBackend::new(config.broker_url.clone())
                        .context("failed to build broker client")?,
                );
                let worker = LocalWorker::start(registry.clone(), backend)?;
                Ok(Self::assemble(
                    config,
                    vec![Side {
                        role: "worker",
                        registry,
                    }],
                    Some(worker),
                    None,
                ))
            }
            Mode::Ping => {
                let transport = cloud_transport(&config).await?;
                let registry = CorrelationRegistry::new(transport, config.registry_config("proxy"))?;
                let proxy = BrokerProxy::new(registry.clone()).with_timeout(config.wait_timeout);
                Ok(Self::assemble(
                    config,
                    vec![Side {
                        role: "proxy",
                        registry,
                    }],
                    None,
                    Some(proxy),
                ))
            }
        }
    }

    /// Both sides in-process over `broker`, with `backend` behind the worker.
    pub fn loopback(
        config: NodeConfig,
        broker: &InMemoryBroker,
        backend: Arc<dyn BrokerBackend>,
    ) -> Result<Self> {
        broker.create_channel(REQUESTS_TOPIC, REQUESTS_SUBSCRIPTION)?;
        broker.create_channel(REPLIES_TOPIC, REPLIES_SUBSCRIPTION)?;

        let worker_registry = CorrelationRegistry::new(
            Arc::new(broker.transport(REPLIES_TOPIC, REQUESTS_SUBSCRIPTION)),
            config.registry_config("worker"),
        )?;
        let proxy_registry = CorrelationRegistry::new(
            Arc::new(broker.transport(REQUESTS_TOPIC, REPLIES_SUBSCRIPTION)),
            config.registry_config("proxy"),
        )?;

        let worker = LocalWorker::start(worker_registry.clone(), backend)?;
        let proxy = BrokerProxy::new(proxy_registry.clone()).with_timeout(config.wait_timeout);

        Ok(Self::assemble(
            config,
            vec![
                Side {
                    role: "worker",
                    registry: worker_registry,
                },
                Side {
                    role: "proxy",
                    registry: proxy_registry,
                },
            ],
            Some(worker),
            Some(proxy),
        ))
    }

    fn assemble(
        config: NodeConfig,
        sides: Vec<Side>,
        worker: Option<LocalWorker>,
        proxy: Option<BrokerProxy>,
    ) -> Self {
        Self {
            config,
            sides,
            worker,
            proxy,
            shutdown: CancellationToken::new(),
            metrics_task: Mutex::new(None),
        }
    }

    /// Start publishing registry statistics as metrics.
    pub fn start(&self) {
        let mut task = self.metrics_task.lock();
        if task.is_some() {
            return;
        }

        let registries: Vec<(&'static str, CorrelationRegistry)> = self
            .sides
            .iter()
            .map(|side| (side.role, side.registry.clone()))
            .collect();
        let shutdown = self.shutdown.clone();
        let period = self.config.poll_interval;

        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        for (role, registry) in &registries {
                            observe_registry(role, &registry_metrics(registry));
                        }
                    }
                }
            }
        }));

        info!(mode = %self.config.mode, sides = self.sides.len(), "Relay runtime started");
    }

    /// Run the configured mode to completion.
    pub async fn run(&self) -> Result<()> {
        match self.config.mode {
            Mode::Local => {
                info!("Worker is running. Press Ctrl+C to stop.");
                tokio::select! {
                    signal = tokio::signal::ctrl_c() => signal.context("failed to listen for Ctrl+C")?,
                    _ = self.shutdown.cancelled() => {}
                }
                Ok(())
            }
            Mode::Ping => {
                let proxy = self.proxy.as_ref().context("ping mode has no proxy")?;
                let catalog = proxy.get_catalog().await?;
                info!(services = catalog.services.len(), "Ping succeeded");
                Ok(())
            }
            Mode::Loopback => {
                let proxy = self.proxy.as_ref().context("loopback mode has no proxy")?;
                exercise_broker(proxy).await?;
                info!("Loopback round trip of every broker operation succeeded");
                Ok(())
            }
        }
    }

    /// Stop the worker, shut every registry down, and log final figures.
    pub async fn shutdown(&self) {
        info!("Initiating graceful shutdown...");
        self.shutdown.cancel();

        if let Some(worker) = &self.worker {
            worker.stop();
        }

        for side in &self.sides {
            side.registry.shutdown();
            observe_registry(side.role, &registry_metrics(&side.registry));
            let stats = side.registry.stats().snapshot();
            info!(
                role = side.role,
                vented = stats.vented,
                dispatched = stats.dispatched,
                nacked = stats.nacked,
                decode_failures = stats.decode_failures,
                wait_timeouts = stats.wait_timeouts,
                "Registry summary"
            );
        }

        let task = self.metrics_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("Metrics task failed: {}", e);
            }
        }

        info!("Shutdown complete");
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn proxy(&self) -> Option<&BrokerProxy> {
        self.proxy.as_ref()
    }

    pub fn worker(&self) -> Option<&LocalWorker> {
        self.worker.as_ref()
    }

    pub fn registry(&self, role: &str) -> Option<&CorrelationRegistry> {
        self.sides
            .iter()
            .find(|side| side.role == role)
            .map(|side| &side.registry)
    }
}

pub fn registry_metrics(registry: &CorrelationRegistry) -> RegistryMetrics {
    let stats = registry.stats().snapshot();
    RegistryMetrics {
        vented: stats.vented,
        dispatched: stats.dispatched,
        nacked: stats.nacked,
        decode_failures: stats.decode_failures,
        wait_timeouts: stats.wait_timeouts,
        registrations: registry.registration_count(),
        dispatch_running: registry.dispatch_state() != DispatchState::Idle,
    }
}

/// Drive one instance through its whole lifecycle.
pub async fn exercise_broker(proxy: &BrokerProxy) -> Result<(), ProxyError> {
    let catalog = proxy.get_catalog().await?;
    let (service_id, plan_id) = catalog
        .services
        .first()
        .map(|service| {
            let service_id = service["id"].as_str().unwrap_or_default().to_string();
            let plan_id = service["plans"][0]["id"].as_str().unwrap_or_default().to_string();
            (service_id, plan_id)
        })
        .unwrap_or_default();
    let instance_id = "relay-loopback-instance".to_string();
    let binding_id = "relay-loopback-binding".to_string();

    let provisioned = proxy
        .provision(&ProvisionRequest {
            instance_id: instance_id.clone(),
            service_id: service_id.clone(),
            plan_id: plan_id.clone(),
            organization_guid: "relay-org".into(),
            space_guid: "relay-space".into(),
            parameters: None,
            context: None,
            accepts_incomplete: true,
        })
        .await?;

    if provisioned.is_async {
        let state = proxy
            .last_operation(&LastOperationRequest {
                instance_id: instance_id.clone(),
                service_id: Some(service_id.clone()),
                plan_id: Some(plan_id.clone()),
                operation: provisioned.operation.clone(),
            })
            .await?;
        info!(state = ?state.state, "Provision finished");
    }

    let bound = proxy
        .bind(&BindRequest {
            instance_id: instance_id.clone(),
            binding_id: binding_id.clone(),
            service_id: service_id.clone(),
            plan_id: plan_id.clone(),
            app_guid: None,
            parameters: None,
            context: None,
        })
        .await?;
    if bound.credentials.is_none() {
        warn!(binding_id = %binding_id, "Binding returned no credentials");
    }

    proxy
        .unbind(&UnbindRequest {
            instance_id: instance_id.clone(),
            binding_id,
            service_id: service_id.clone(),
            plan_id: plan_id.clone(),
        })
        .await?;

    proxy
        .update(&UpdateRequest {
            instance_id: instance_id.clone(),
            service_id: service_id.clone(),
            plan_id: Some(plan_id.clone()),
            parameters: None,
            context: None,
            accepts_incomplete: false,
        })
        .await?;

    proxy
        .deprovision(&DeprovisionRequest {
            instance_id,
            service_id,
            plan_id,
            accepts_incomplete: false,
        })
        .await?;

    Ok(())
}

#[cfg(feature = "gcp-pubsub")]
async fn cloud_transport(config: &NodeConfig) -> Result<Arc<dyn Transport>> {
    use crate::config::TransportKind;
    use relay_bus::{GcpPubSubConfig, GcpPubSubTransport};

    if config.transport != TransportKind::GcpPubSub {
        anyhow::bail!("{} mode needs the gcp-pubsub transport", config.mode);
    }
    let project_id = config.project_id.clone().context("RELAY_PROJECT_ID is not set")?;
    let topic = config.topic.clone().context("RELAY_TOPIC is not set")?;
    let subscription = config.subscription.clone().context("RELAY_SUBSCRIPTION is not set")?;

    let mut settings = GcpPubSubConfig::new(project_id, topic, subscription);
    if let Some(path) = &config.credentials_path {
        settings = settings.with_credentials_path(path.clone());
    }
    let transport = GcpPubSubTransport::connect(settings)
        .await
        .context("failed to connect to Pub/Sub")?;
    Ok(Arc::new(transport))
}

#[cfg(not(feature = "gcp-pubsub"))]
async fn cloud_transport(config: &NodeConfig) -> Result<Arc<dyn Transport>> {
    anyhow::bail!(
        "{} mode needs the gcp-pubsub transport, which this build does not include",
        config.mode
    )
}

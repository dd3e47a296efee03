//! # Correlation Registry
//!
//! The public API: `vent`, `vent_with`, `sink`, `remove_sink`, `wait_for`.
//! A registry is an explicit handle; clones share one callback table and
//! one dispatch loop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use relay_bus::{codec, Transport};
use relay_types::CorrelationId;
use serde::Serialize;
use tokio::sync::{oneshot, watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RegistryConfig;
use crate::dispatch::{DispatchLoop, DispatchRouter, DispatchState};
use crate::error::RegistryError;
use crate::handler::SinkHandler;
use crate::table::{CallbackTable, RegistrationKind};

/// Registry counters.
#[derive(Debug, Default)]
pub struct RegistryStats {
    pub vented: AtomicU64,
    pub publish_failures: AtomicU64,
    pub dispatched: AtomicU64,
    pub nacked: AtomicU64,
    pub decode_failures: AtomicU64,
    pub wait_timeouts: AtomicU64,
    pub handlers_completed: AtomicU64,
    pub loop_starts: AtomicU64,
    pub loop_stops: AtomicU64,
}

/// Plain copy of [`RegistryStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub vented: u64,
    pub publish_failures: u64,
    pub dispatched: u64,
    pub nacked: u64,
    pub decode_failures: u64,
    pub wait_timeouts: u64,
    pub handlers_completed: u64,
    pub loop_starts: u64,
    pub loop_stops: u64,
}

impl RegistryStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            vented: self.vented.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            nacked: self.nacked.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            wait_timeouts: self.wait_timeouts.load(Ordering::Relaxed),
            handlers_completed: self.handlers_completed.load(Ordering::Relaxed),
            loop_starts: self.loop_starts.load(Ordering::Relaxed),
            loop_stops: self.loop_stops.load(Ordering::Relaxed),
        }
    }
}

struct RegistryInner {
    name: Arc<str>,
    transport: Arc<dyn Transport>,
    table: Arc<CallbackTable>,
    router: Arc<DispatchRouter>,
    stats: Arc<RegistryStats>,
    config: RegistryConfig,
    shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct CorrelationRegistry {
    inner: Arc<RegistryInner>,
}

/// Non-owning registry handle, for handlers that must not keep their own
/// registry alive.
#[derive(Clone)]
pub struct WeakCorrelationRegistry {
    inner: Weak<RegistryInner>,
}

impl WeakCorrelationRegistry {
    pub fn upgrade(&self) -> Option<CorrelationRegistry> {
        self.inner
            .upgrade()
            .map(|inner| CorrelationRegistry { inner })
    }
}

impl CorrelationRegistry {
    pub fn new(transport: Arc<dyn Transport>, config: RegistryConfig) -> Result<Self, RegistryError> {
        config.validate()?;
        Ok(Self::build(transport, config))
    }

    pub fn with_default_config(transport: Arc<dyn Transport>) -> Self {
        Self::build(transport, RegistryConfig::default())
    }

    fn build(transport: Arc<dyn Transport>, config: RegistryConfig) -> Self {
        let name: Arc<str> = Arc::from(config.name.as_str());
        let table = Arc::new(CallbackTable::new());
        let stats = Arc::new(RegistryStats::default());
        let router = Arc::new(DispatchRouter {
            name: name.clone(),
            table: table.clone(),
            stats: stats.clone(),
            limiter: config
                .max_inflight_handlers
                .map(|limit| Arc::new(Semaphore::new(limit))),
        });

        Self {
            inner: Arc::new(RegistryInner {
                name,
                transport,
                table,
                router,
                stats,
                config,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Publish `body` under `event` with a freshly minted id.
    pub async fn vent<B>(&self, event: &str, body: &B) -> Result<CorrelationId, RegistryError>
    where
        B: Serialize + ?Sized,
    {
        self.vent_with(CorrelationId::generate(), event, body).await
    }

    /// Publish `body` under `event` with a caller-supplied id, typically the
    /// id of the request being answered. Returns once the transport has
    /// accepted the write.
    pub async fn vent_with<B>(
        &self,
        id: impl Into<CorrelationId>,
        event: &str,
        body: &B,
    ) -> Result<CorrelationId, RegistryError>
    where
        B: Serialize + ?Sized,
    {
        let id = id.into();
        let payload = codec::encode(id.as_str(), event, body).map_err(|source| {
            self.inner.stats.publish_failures.fetch_add(1, Ordering::Relaxed);
            RegistryError::Encode {
                id: id.to_string(),
                source,
            }
        })?;

        let receipt = self.inner.transport.publish(payload).await.map_err(|source| {
            self.inner.stats.publish_failures.fetch_add(1, Ordering::Relaxed);
            warn!(
                registry = %self.inner.name,
                correlation_id = %id,
                event = event,
                error = %source,
                "Publish rejected"
            );
            RegistryError::Publish {
                id: id.to_string(),
                source,
            }
        })?;

        self.inner.stats.vented.fetch_add(1, Ordering::Relaxed);
        debug!(
            registry = %self.inner.name,
            correlation_id = %id,
            event = event,
            message_id = %receipt.message_id,
            "Vented envelope"
        );
        Ok(id)
    }

    /// Register a persistent handler for envelopes whose `id` or `event`
    /// equals `key`.
    pub fn sink<H: SinkHandler>(&self, key: &str, handler: H) -> Result<(), RegistryError> {
        self.register(key, Arc::new(handler), RegistrationKind::Persistent)?;
        debug!(registry = %self.inner.name, key = key, "Sink registered");
        Ok(())
    }

    /// Unregister `key`. Absent keys are a no-op.
    pub fn remove_sink(&self, key: &str) {
        if self.inner.table.remove(key) {
            debug!(registry = %self.inner.name, key = key, "Sink removed");
        }
    }

    /// Register a one-shot handler for `id` without blocking yet.
    ///
    /// The registration lives as long as the returned waiter. Register
    /// before publishing the request so the reply cannot outrun it.
    pub fn expect(&self, id: impl Into<CorrelationId>) -> Result<ReplyWaiter, RegistryError> {
        let id = id.into();
        let (tx, rx) = oneshot::channel();
        let slot = Mutex::new(Some(tx));
        let handler = move |_id: String, body: serde_json::Value| {
            let sender = slot.lock().take();
            async move {
                if let Some(sender) = sender {
                    let _ = sender.send(body);
                }
            }
        };

        let token = self.register(id.as_str(), Arc::new(handler), RegistrationKind::OneShot)?;
        Ok(ReplyWaiter {
            id: id.clone(),
            reply: rx,
            default_timeout: self.inner.config.wait_for_timeout,
            stats: self.inner.stats.clone(),
            shutdown: self.inner.shutdown.clone(),
            _guard: RegistrationGuard {
                table: self.inner.table.clone(),
                key: id.into_inner(),
                token,
            },
        })
    }

    /// Block until an envelope with `id` arrives or `timeout` elapses
    /// (`None` uses the configured default). The registration for `id` is
    /// gone when this returns, whatever the outcome.
    pub async fn wait_for(
        &self,
        id: impl Into<CorrelationId>,
        timeout: Option<Duration>,
    ) -> Result<serde_json::Value, RegistryError> {
        self.expect(id)?.wait(timeout).await
    }

    fn register(
        &self,
        key: &str,
        handler: Arc<dyn SinkHandler>,
        kind: RegistrationKind,
    ) -> Result<u64, RegistryError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(RegistryError::ShutDown);
        }

        let registered = self.inner.table.register(key, handler, kind)?;
        if registered.start_dispatch {
            self.spawn_dispatch();
        }
        Ok(registered.token)
    }

    fn spawn_dispatch(&self) {
        self.inner.stats.loop_starts.fetch_add(1, Ordering::Relaxed);
        let dispatch = DispatchLoop {
            name: self.inner.name.clone(),
            transport: self.inner.transport.clone(),
            table: self.inner.table.clone(),
            router: self.inner.router.clone(),
            stats: self.inner.stats.clone(),
            poll_interval: self.inner.config.poll_interval,
            shutdown: self.inner.shutdown.clone(),
        };
        tokio::spawn(dispatch.run());
    }

    /// Stop the dispatch loop and drop every registration. Blocked waiters
    /// return [`RegistryError::ShutDown`]; later registrations fail with it.
    pub fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        self.inner.shutdown.cancel();
        let dropped = self.inner.table.clear();
        info!(
            registry = %self.inner.name,
            dropped_registrations = dropped,
            "Registry shut down"
        );
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    pub fn dispatch_state(&self) -> DispatchState {
        self.inner.table.dispatch_state()
    }

    pub fn watch_dispatch_state(&self) -> watch::Receiver<DispatchState> {
        self.inner.table.watch_dispatch_state()
    }

    pub fn is_registered(&self, key: &str) -> bool {
        self.inner.table.contains(key)
    }

    pub fn registration_count(&self) -> usize {
        self.inner.table.len()
    }

    pub fn stats(&self) -> &RegistryStats {
        &self.inner.stats
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn downgrade(&self) -> WeakCorrelationRegistry {
        WeakCorrelationRegistry {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

/// Removes one registration when dropped, unless it was already consumed
/// or replaced.
struct RegistrationGuard {
    table: Arc<CallbackTable>,
    key: String,
    token: u64,
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        self.table.remove_registration(&self.key, self.token);
    }
}

/// A registered one-shot waiter. Dropping it unregisters.
pub struct ReplyWaiter {
    id: CorrelationId,
    reply: oneshot::Receiver<serde_json::Value>,
    default_timeout: Duration,
    stats: Arc<RegistryStats>,
    shutdown: CancellationToken,
    _guard: RegistrationGuard,
}

impl ReplyWaiter {
    pub fn id(&self) -> &CorrelationId {
        &self.id
    }

    pub async fn wait(self, timeout: Option<Duration>) -> Result<serde_json::Value, RegistryError> {
        let waited = timeout.unwrap_or(self.default_timeout);
        let ReplyWaiter {
            id,
            reply,
            stats,
            shutdown,
            _guard: guard,
            ..
        } = self;

        let outcome = tokio::time::timeout(waited, reply).await;
        drop(guard);

        match outcome {
            Ok(Ok(body)) => Ok(body),
            // The registration went away without firing
            Ok(Err(_)) if shutdown.is_cancelled() => Err(RegistryError::ShutDown),
            Ok(Err(_)) => {
                debug!(correlation_id = %id, "Registration removed while waiting");
                Err(RegistryError::Cancelled {
                    id: id.into_inner(),
                })
            }
            Err(_) => {
                stats.wait_timeouts.fetch_add(1, Ordering::Relaxed);
                debug!(correlation_id = %id, waited_ms = waited.as_millis(), "Wait timed out");
                Err(RegistryError::Timeout {
                    id: id.into_inner(),
                    waited,
                })
            }
        }
    }
}

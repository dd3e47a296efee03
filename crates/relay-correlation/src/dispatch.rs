//! # Dispatch Loop
//!
//! One loop per registry. It runs only while the callback table has
//! entries:
//!
//! ```text
//!            register (first)            tick, table non-empty
//!   Idle ──────────────────────→ Polling ─────────────────────→ Receiving
//!    ↑                            │  ↑                              │
//!    └──── tick, table empty ─────┘  └─ tick, table empty: cancel ──┤
//!    ↑                                  the receive                 │
//!    └──────────────────── transport error / shutdown ──────────────┘
//! ```
//!
//! The loop never restarts itself after a transport error; the next
//! registration does.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use relay_bus::{codec, AckDecision, Delivery, DeliveryHandler, Transport};
use tokio::sync::Semaphore;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::registry::RegistryStats;
use crate::table::CallbackTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    /// Not running; no registrations.
    Idle,
    /// Running, between receives.
    Polling,
    /// Draining the transport.
    Receiving,
}

/// Routes each delivery to its registration.
pub(crate) struct DispatchRouter {
    pub(crate) name: Arc<str>,
    pub(crate) table: Arc<CallbackTable>,
    pub(crate) stats: Arc<RegistryStats>,
    pub(crate) limiter: Option<Arc<Semaphore>>,
}

impl DeliveryHandler for DispatchRouter {
    fn handle(&self, delivery: Delivery) -> AckDecision {
        let envelope = match codec::decode(&delivery.data) {
            Ok(envelope) => envelope,
            Err(e) => {
                // Redelivering a malformed payload cannot help
                self.stats.decode_failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    registry = %self.name,
                    message_id = %delivery.message_id,
                    error = %e,
                    "Dropping undecodable message"
                );
                return AckDecision::Ack;
            }
        };

        let permit = match &self.limiter {
            Some(limiter) => match limiter.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    self.stats.nacked.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        registry = %self.name,
                        correlation_id = %envelope.id,
                        event = %envelope.event,
                        "Handler limit reached, nacking"
                    );
                    return AckDecision::Nack;
                }
            },
            None => None,
        };

        let Some(claimed) = self.table.claim(&envelope.id, &envelope.event) else {
            self.stats.nacked.fetch_add(1, Ordering::Relaxed);
            debug!(
                registry = %self.name,
                correlation_id = %envelope.id,
                event = %envelope.event,
                attempt = delivery.attempt,
                "No registration matched, nacking"
            );
            return AckDecision::Nack;
        };

        self.stats.dispatched.fetch_add(1, Ordering::Relaxed);
        debug!(
            registry = %self.name,
            correlation_id = %envelope.id,
            event = %envelope.event,
            key = %claimed.key,
            matched_by = ?claimed.matched_by,
            attempt = delivery.attempt,
            "Dispatching envelope"
        );

        let stats = self.stats.clone();
        let invocation = claimed.handler.call(envelope.id, envelope.body);
        tokio::spawn(async move {
            invocation.await;
            stats.handlers_completed.fetch_add(1, Ordering::Relaxed);
            drop(permit);
        });

        AckDecision::Ack
    }
}

pub(crate) struct DispatchLoop {
    pub(crate) name: Arc<str>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) table: Arc<CallbackTable>,
    pub(crate) router: Arc<DispatchRouter>,
    pub(crate) stats: Arc<RegistryStats>,
    pub(crate) poll_interval: Duration,
    pub(crate) shutdown: CancellationToken,
}

impl DispatchLoop {
    pub(crate) async fn run(self) {
        info!(registry = %self.name, "Dispatch loop started");
        self.cycle().await;
        self.stats.loop_stops.fetch_add(1, Ordering::Relaxed);
    }

    async fn cycle(&self) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            // Polling
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    self.table.mark_dispatch_stopped();
                    info!(registry = %self.name, "Dispatch loop shut down");
                    return;
                }
                _ = ticker.tick() => {}
            }

            if self.table.try_stop_dispatch() {
                debug!(registry = %self.name, "No registrations, dispatch loop idle");
                return;
            }

            // Receiving
            self.table.set_dispatch_state(DispatchState::Receiving);
            let receive_cancel = self.shutdown.child_token();
            let handler: Arc<dyn DeliveryHandler> = self.router.clone();
            let mut receive = self.transport.subscribe(receive_cancel.clone(), handler);

            let finished = loop {
                tokio::select! {
                    result = &mut receive => break Some(result),
                    _ = ticker.tick() => {
                        if self.table.is_empty() {
                            trace!(registry = %self.name, "Table empty, cancelling receive");
                            receive_cancel.cancel();
                            break None;
                        }
                    }
                }
            };
            let result = match finished {
                Some(result) => result,
                None => receive.await,
            };

            match result {
                Err(e) => {
                    self.table.mark_dispatch_stopped();
                    error!(
                        registry = %self.name,
                        error = %e,
                        "Transport failed, dispatch loop stopped"
                    );
                    return;
                }
                Ok(()) if self.shutdown.is_cancelled() => {
                    self.table.mark_dispatch_stopped();
                    info!(registry = %self.name, "Dispatch loop shut down");
                    return;
                }
                Ok(()) if !receive_cancel.is_cancelled() => {
                    self.table.mark_dispatch_stopped();
                    warn!(
                        registry = %self.name,
                        "Subscription ended unexpectedly, dispatch loop stopped"
                    );
                    return;
                }
                Ok(()) => {
                    self.table.set_dispatch_state(DispatchState::Polling);
                    if self.table.try_stop_dispatch() {
                        debug!(registry = %self.name, "No registrations, dispatch loop idle");
                        return;
                    }
                    // A registration slipped in while the receive was being
                    // cancelled; resume on the next tick.
                }
            }
        }
    }
}

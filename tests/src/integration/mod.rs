//! Integration scenarios.

pub mod broker_flow;
pub mod correlation;
pub mod dispatch;

#[cfg(test)]
pub(crate) mod support {
    use std::sync::Arc;
    use std::time::Duration;

    use relay_bus::InMemoryBroker;
    use relay_correlation::{CorrelationRegistry, DispatchState, RegistryConfig};
    use tokio::sync::mpsc;

    pub const POLL: Duration = Duration::from_millis(20);

    pub fn config(name: &str) -> RegistryConfig {
        RegistryConfig::named(name)
            .with_poll_interval(POLL)
            .with_wait_for_timeout(Duration::from_secs(2))
    }

    /// A registry that receives its own publishes.
    pub fn looped(broker: &InMemoryBroker, name: &str) -> CorrelationRegistry {
        let topic = format!("{}-topic", name);
        let subscription = format!("{}-sub", name);
        broker.create_channel(&topic, &subscription).unwrap();
        CorrelationRegistry::new(Arc::new(broker.transport(&topic, &subscription)), config(name)).unwrap()
    }

    /// Two registries wired back to back: what one vents, the other receives.
    pub fn peers(broker: &InMemoryBroker) -> (CorrelationRegistry, CorrelationRegistry) {
        broker.create_channel("a-to-b", "b-inbox").unwrap();
        broker.create_channel("b-to-a", "a-inbox").unwrap();
        let a = CorrelationRegistry::new(Arc::new(broker.transport("a-to-b", "a-inbox")), config("a")).unwrap();
        let b = CorrelationRegistry::new(Arc::new(broker.transport("b-to-a", "b-inbox")), config("b")).unwrap();
        (a, b)
    }

    /// A sink handler forwarding `(id, body)` to a channel.
    pub fn forwarding() -> (
        impl Fn(String, serde_json::Value) -> futures::future::Ready<()> + Send + Sync + 'static,
        mpsc::UnboundedReceiver<(String, serde_json::Value)>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = move |id: String, body: serde_json::Value| {
            let _ = tx.send((id, body));
            futures::future::ready(())
        };
        (handler, rx)
    }

    pub async fn wait_state(registry: &CorrelationRegistry, state: DispatchState) -> bool {
        let mut rx = registry.watch_dispatch_state();
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if *rx.borrow_and_update() == state {
                    return;
                }
                if rx.changed().await.is_err() {
                    // Sender gone; fall back to polling the current value
                    tokio::time::sleep(POLL).await;
                }
            }
        })
        .await
        .is_ok()
    }
}

//! # Dispatch Loop Lifecycle
//!
//! The loop runs only while something is registered:
//!
//! ```text
//! Idle ──sink──→ Polling ──tick──→ Receiving ──remove, tick──→ Polling ──→ Idle
//! ```
//!
//! Also covers transport failure (loop stops, next registration restarts
//! it), undecodable payloads, and the handler concurrency bound.

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use parking_lot::Mutex;
    use relay_bus::{InMemoryBroker, Transport};
    use relay_correlation::{CorrelationRegistry, DispatchState};
    use serde_json::json;

    use crate::integration::support::{config, forwarding, looped, peers, wait_state, POLL};

    #[tokio::test]
    async fn test_loop_follows_registrations() {
        let broker = InMemoryBroker::new();
        let registry = looped(&broker, "lifecycle");

        // Record every state the watch channel reports
        let observed = Arc::new(Mutex::new(vec![registry.dispatch_state()]));
        let mut rx = registry.watch_dispatch_state();
        let recorder = observed.clone();
        let recording = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let state = *rx.borrow_and_update();
                recorder.lock().push(state);
            }
        });

        assert_eq!(registry.dispatch_state(), DispatchState::Idle);

        registry
            .sink("Ping", |_id: String, _body: serde_json::Value| async {})
            .unwrap();
        assert_eq!(registry.dispatch_state(), DispatchState::Polling);
        assert!(wait_state(&registry, DispatchState::Receiving).await);

        registry.remove_sink("Ping");
        assert!(wait_state(&registry, DispatchState::Idle).await);

        // Stays idle with nothing registered
        tokio::time::sleep(POLL * 5).await;
        assert_eq!(registry.dispatch_state(), DispatchState::Idle);

        let stats = registry.stats().snapshot();
        assert_eq!(stats.loop_starts, 1);
        assert_eq!(stats.loop_stops, 1);

        let states = observed.lock().clone();
        assert_eq!(states.first(), Some(&DispatchState::Idle));
        assert_eq!(states.last(), Some(&DispatchState::Idle));
        assert!(states.contains(&DispatchState::Receiving));

        registry.shutdown();
        recording.abort();
    }

    #[tokio::test]
    async fn test_loop_restarts_for_new_registration() {
        let broker = InMemoryBroker::new();
        let registry = looped(&broker, "restart");

        for round in 1..=3u64 {
            registry
                .sink("Ping", |_id: String, _body: serde_json::Value| async {})
                .unwrap();
            assert!(wait_state(&registry, DispatchState::Receiving).await);
            registry.remove_sink("Ping");
            assert!(wait_state(&registry, DispatchState::Idle).await);
            // loop_stops is bumped just after the state flips
            tokio::time::sleep(POLL).await;

            let stats = registry.stats().snapshot();
            assert_eq!(stats.loop_starts, round);
            assert_eq!(stats.loop_stops, round);
        }
        registry.shutdown();
    }

    #[tokio::test]
    async fn test_transport_failure_stops_loop_until_next_registration() {
        let broker = InMemoryBroker::new();
        let (a, b) = peers(&broker);
        let (handler, mut seen) = forwarding();
        b.sink("Ping", handler).unwrap();
        assert!(wait_state(&b, DispatchState::Receiving).await);

        broker.fail_subscription("b-inbox", "connection reset").unwrap();
        assert!(wait_state(&b, DispatchState::Idle).await);
        // The registration survives the failure
        assert!(b.is_registered("Ping"));

        // Published while stopped: waits on the subscription
        a.vent("Ping", &json!({"n": 1})).await.unwrap();
        tokio::time::sleep(POLL * 3).await;
        assert!(seen.try_recv().is_err());

        // Any new registration restarts the loop, which drains the backlog
        b.sink("Other", |_id: String, _body: serde_json::Value| async {})
            .unwrap();
        let (_, body) = tokio::time::timeout(Duration::from_secs(2), seen.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(body, json!({"n": 1}));
        assert_eq!(b.stats().snapshot().loop_starts, 2);

        a.shutdown();
        b.shutdown();
    }

    #[tokio::test]
    async fn test_undecodable_message_is_dropped() {
        let broker = InMemoryBroker::new();
        let (a, b) = peers(&broker);
        let (handler, mut seen) = forwarding();
        b.sink("Ping", handler).unwrap();

        // Write raw bytes past the registry's codec
        let raw = broker.transport("a-to-b", "a-inbox");
        raw.publish(b"not an envelope".to_vec()).await.unwrap();
        a.vent("Ping", &json!("valid")).await.unwrap();

        let (_, body) = tokio::time::timeout(Duration::from_secs(2), seen.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(body, json!("valid"));
        assert_eq!(b.stats().snapshot().decode_failures, 1);

        // Acked, so it does not come back
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(b.stats().snapshot().decode_failures, 1);

        a.shutdown();
        b.shutdown();
    }

    #[tokio::test]
    async fn test_handlers_run_detached() {
        let broker = InMemoryBroker::new();
        let (a, b) = peers(&broker);
        let started = Arc::new(AtomicUsize::new(0));
        let release = Arc::new(tokio::sync::Notify::new());

        let counter = started.clone();
        let gate = release.clone();
        b.sink("Slow", move |_id: String, _body: serde_json::Value| {
            let counter = counter.clone();
            let gate = gate.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                gate.notified().await;
            }
        })
        .unwrap();

        for n in 0..3 {
            a.vent("Slow", &json!(n)).await.unwrap();
        }

        // All three start although none has finished
        tokio::time::timeout(Duration::from_secs(2), async {
            while started.load(Ordering::SeqCst) < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(b.stats().snapshot().handlers_completed, 0);

        release.notify_waiters();
        a.shutdown();
        b.shutdown();
    }

    #[tokio::test]
    async fn test_handler_bound_defers_excess_deliveries() {
        let broker = InMemoryBroker::new();
        broker.create_channel("bounded-in", "bounded-sub").unwrap();
        let registry = CorrelationRegistry::new(
            Arc::new(broker.transport("bounded-out", "bounded-sub")),
            config("bounded").with_max_inflight_handlers(1),
        )
        .unwrap();
        let publisher = broker.transport("bounded-in", "unused");

        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));
        let (r, p, d) = (running.clone(), peak.clone(), done.clone());
        registry
            .sink("Work", move |_id: String, _body: serde_json::Value| {
                let (r, p, d) = (r.clone(), p.clone(), d.clone());
                async move {
                    let now = r.fetch_add(1, Ordering::SeqCst) + 1;
                    p.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    r.fetch_sub(1, Ordering::SeqCst);
                    d.fetch_add(1, Ordering::SeqCst);
                }
            })
            .unwrap();

        for n in 0..3 {
            let payload = relay_bus::encode(&format!("work-{n}"), "Work", &json!(n)).unwrap();
            publisher.publish(payload).await.unwrap();
        }

        tokio::time::timeout(Duration::from_secs(3), async {
            while done.load(Ordering::SeqCst) < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert!(registry.stats().snapshot().nacked >= 1);

        registry.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_stops_loop_and_clears_table() {
        let broker = InMemoryBroker::new();
        let registry = looped(&broker, "stop");
        registry
            .sink("Ping", |_id: String, _body: serde_json::Value| async {})
            .unwrap();
        assert!(wait_state(&registry, DispatchState::Receiving).await);

        registry.shutdown();
        assert!(wait_state(&registry, DispatchState::Idle).await);
        assert_eq!(registry.registration_count(), 0);
        assert!(registry.is_shut_down());
    }
}

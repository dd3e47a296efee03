//! # Correlation Contract
//!
//! Vent, Sink, RemoveSink and WaitFor between peers sharing one broker.
//!
//! ## Flows Tested:
//!
//! 1. **Vent → Sink**: an event-keyed sink fires exactly once per envelope
//! 2. **WaitFor timeout**: nothing arrives, nothing is left registered
//! 3. **One-shot consumption**: a second reply with the same id is nacked
//! 4. **Registration boundary**: replies consumed before a WaitFor are not
//!    replayed; replies nacked before it are
//! 5. **Pending table**: an event sink feeds request-response waiters

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use relay_bus::InMemoryBroker;
    use relay_correlation::{
        AwaitReply, DispatchState, PendingRequestTable, RegistryError, RpcClient,
    };
    use serde_json::json;

    use crate::integration::support::{forwarding, looped, peers, wait_state, POLL};

    // =============================================================================
    // VENT → SINK
    // =============================================================================

    #[tokio::test]
    async fn test_vent_reaches_peer_sink_once() {
        let broker = InMemoryBroker::new();
        let (a, b) = peers(&broker);
        let (handler, mut seen) = forwarding();
        b.sink("Ping", handler).unwrap();

        let id = a.vent("Ping", &json!({"n": 1})).await.unwrap();

        let (got_id, body) = tokio::time::timeout(Duration::from_secs(2), seen.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got_id, id.as_str());
        assert_eq!(body, json!({"n": 1}));

        // Exactly once
        tokio::time::sleep(POLL * 5).await;
        assert!(seen.try_recv().is_err());
        assert_eq!(b.stats().snapshot().dispatched, 1);

        let err = b
            .sink("Ping", |_id: String, _body: serde_json::Value| async {})
            .unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyRegistered(ref key) if key == "Ping"));

        a.shutdown();
        b.shutdown();
    }

    #[tokio::test]
    async fn test_sink_matches_id_before_event() {
        let broker = InMemoryBroker::new();
        let (a, b) = peers(&broker);
        let (by_event, mut event_seen) = forwarding();
        let (by_id, mut id_seen) = forwarding();
        b.sink("Reply", by_event).unwrap();
        b.sink("req-1", by_id).unwrap();

        a.vent_with("req-1", "Reply", &json!("first")).await.unwrap();
        a.vent_with("req-2", "Reply", &json!("second")).await.unwrap();

        let (id, _) = tokio::time::timeout(Duration::from_secs(2), id_seen.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(id, "req-1");
        let (id, _) = tokio::time::timeout(Duration::from_secs(2), event_seen.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(id, "req-2");

        a.shutdown();
        b.shutdown();
    }

    #[tokio::test]
    async fn test_remove_sink_is_idempotent_and_frees_key() {
        let broker = InMemoryBroker::new();
        let registry = looped(&broker, "remove");

        registry
            .sink("Ping", |_id: String, _body: serde_json::Value| async {})
            .unwrap();
        registry.remove_sink("Ping");
        registry.remove_sink("Ping");
        registry.remove_sink("never-registered");
        assert!(!registry.is_registered("Ping"));

        registry
            .sink("Ping", |_id: String, _body: serde_json::Value| async {})
            .unwrap();
        assert_eq!(registry.registration_count(), 1);
        registry.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_duplicate_sinks_admit_one() {
        let broker = InMemoryBroker::new();
        let registry = looped(&broker, "race");

        let attempts: Vec<_> = (0..16)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move {
                    registry.sink("Ping", |_id: String, _body: serde_json::Value| async {})
                })
            })
            .collect();

        let mut admitted = 0;
        let mut rejected = 0;
        for attempt in attempts {
            match attempt.await.unwrap() {
                Ok(()) => admitted += 1,
                Err(RegistryError::AlreadyRegistered(_)) => rejected += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(admitted, 1);
        assert_eq!(rejected, 15);
        assert_eq!(registry.stats().snapshot().loop_starts, 1);
        registry.shutdown();
    }

    // =============================================================================
    // WAIT FOR
    // =============================================================================

    #[tokio::test]
    async fn test_wait_for_times_out_and_leaves_nothing_behind() {
        let broker = InMemoryBroker::new();
        let registry = looped(&broker, "timeout");

        let started = Instant::now();
        let err = registry
            .wait_for("X", Some(Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert!(!registry.is_registered("X"));
        assert_eq!(registry.stats().snapshot().wait_timeouts, 1);

        registry
            .sink("X", |_id: String, _body: serde_json::Value| async {})
            .unwrap();
        registry.shutdown();
    }

    #[tokio::test]
    async fn test_second_reply_after_one_shot_is_nacked() {
        let broker = InMemoryBroker::new();
        let (a, b) = peers(&broker);
        let waiter = b.expect("X").unwrap();

        let (copy_one, copy_two) = (json!({"copy": 1}), json!({"copy": 2}));
        let (first, second) = tokio::join!(
            a.vent_with("X", "Reply", &copy_one),
            a.vent_with("X", "Reply", &copy_two),
        );
        first.unwrap();
        second.unwrap();

        let body = waiter.wait(None).await.unwrap();
        assert!(body == json!({"copy": 1}) || body == json!({"copy": 2}));

        // The unmatched copy goes back to the subscription, it is not acked away
        assert!(wait_state(&b, DispatchState::Idle).await);
        let stats = b.stats().snapshot();
        assert_eq!(stats.dispatched, 1);
        assert!(stats.nacked >= 1);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(broker.backlog("b-inbox"), 1);

        a.shutdown();
        b.shutdown();
    }

    #[tokio::test]
    async fn test_reply_consumed_before_registration_is_not_replayed() {
        let broker = InMemoryBroker::new();
        let (a, b) = peers(&broker);
        let (catch_all, mut caught) = forwarding();
        b.sink("Reply", catch_all).unwrap();

        a.vent_with("late", "Reply", &json!("gone")).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), caught.recv())
            .await
            .unwrap()
            .unwrap();

        let err = b
            .wait_for("late", Some(Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(err.is_timeout());

        a.shutdown();
        b.shutdown();
    }

    #[tokio::test]
    async fn test_nacked_reply_reaches_later_registration() {
        let broker = InMemoryBroker::new();
        let (a, b) = peers(&broker);
        // Keeps the loop receiving without matching the reply
        b.sink("Unrelated", |_id: String, _body: serde_json::Value| async {})
            .unwrap();

        a.vent_with("early", "Reply", &json!("kept")).await.unwrap();
        tokio::time::sleep(POLL * 3).await;
        assert!(b.stats().snapshot().nacked >= 1);

        let body = b.wait_for("early", None).await.unwrap();
        assert_eq!(body, json!("kept"));
        assert!(!b.is_registered("early"));

        a.shutdown();
        b.shutdown();
    }

    #[tokio::test]
    async fn test_backlog_waits_for_first_registration() {
        let broker = InMemoryBroker::new();
        let (a, b) = peers(&broker);

        // Nobody is listening yet: the reply waits on the subscription
        a.vent_with("queued", "Reply", &json!(1)).await.unwrap();
        assert_eq!(b.dispatch_state(), DispatchState::Idle);
        assert_eq!(broker.backlog("b-inbox"), 1);

        let body = b.wait_for("queued", None).await.unwrap();
        assert_eq!(body, json!(1));

        a.shutdown();
        b.shutdown();
    }

    // =============================================================================
    // PENDING TABLE
    // =============================================================================

    #[tokio::test]
    async fn test_event_sink_feeds_pending_table() {
        let broker = InMemoryBroker::new();
        let (a, b) = peers(&broker);
        let table = Arc::new(PendingRequestTable::new(Duration::from_secs(2)));
        b.sink("Reply", table.sink_handler("Reply")).unwrap();

        let ticket = table.issue("req-9").unwrap();
        a.vent_with("req-9", "Reply", &json!({"ok": true})).await.unwrap();

        let envelope = table.wait(ticket, None).await.unwrap();
        assert_eq!(envelope.id, "req-9");
        assert_eq!(envelope.event, "Reply");
        assert_eq!(envelope.body, json!({"ok": true}));
        assert!(!table.is_pending("req-9"));

        // Same contract through the shared port
        let waiter: Arc<dyn AwaitReply> = table.clone();
        let sender = a.clone();
        tokio::spawn(async move {
            tokio::time::sleep(POLL * 2).await;
            sender.vent_with("req-10", "Reply", &json!(10)).await
        });
        let body = waiter.await_reply("req-10", None).await.unwrap();
        assert_eq!(body, json!(10));
        assert_eq!(table.pending_count(), 0);

        a.shutdown();
        b.shutdown();
    }

    // =============================================================================
    // FAILURES
    // =============================================================================

    #[tokio::test]
    async fn test_publish_failure_surfaces_to_caller() {
        let broker = InMemoryBroker::new();
        let (a, b) = peers(&broker);
        broker.set_publish_failure(Some("broker unavailable"));

        let err = a.vent("Ping", &json!({})).await.unwrap_err();
        assert!(err.is_publish_failure());
        assert_eq!(a.stats().snapshot().publish_failures, 1);

        // An RPC call that cannot publish leaves no pending registration
        let client = RpcClient::new(a.clone());
        let err = client.call("Ping", &json!({})).await.unwrap_err();
        assert!(matches!(err, relay_correlation::RpcError::Registry(ref e) if e.is_publish_failure()));
        assert_eq!(a.registration_count(), 0);

        broker.set_publish_failure(None);
        a.vent("Ping", &json!({})).await.unwrap();

        a.shutdown();
        b.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_wakes_waiters() {
        let broker = InMemoryBroker::new();
        let registry = looped(&broker, "shutdown");
        let waiter = registry.expect("never").unwrap();

        let handle = registry.clone();
        tokio::spawn(async move {
            tokio::time::sleep(POLL).await;
            handle.shutdown();
        });

        let err = waiter.wait(Some(Duration::from_secs(5))).await.unwrap_err();
        assert!(matches!(err, RegistryError::ShutDown));
        assert!(matches!(
            registry.sink("after", |_id: String, _body: serde_json::Value| async {}),
            Err(RegistryError::ShutDown)
        ));
    }
}

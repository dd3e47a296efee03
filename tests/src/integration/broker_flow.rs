//! # Broker Relay Flow
//!
//! The public proxy drives broker operations through the channel; the
//! private worker answers them from a backend.
//!
//! ## Flows Tested:
//!
//! 1. **Full lifecycle**: catalog, provision, poll, bind, unbind, update, deprovision
//! 2. **Remote failure**: backend errors reach the proxy with their status
//! 3. **No worker**: the proxy times out and cleans up
//! 4. **Binding bootstrap**: a mounted binding file configures the channel

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use relay_bus::InMemoryBroker;
    use relay_correlation::CorrelationRegistry;
    use relay_node::runtime::{exercise_broker, REPLIES_SUBSCRIPTION, REPLIES_TOPIC, REQUESTS_TOPIC};
    use relay_node::{BrokerProxy, InMemoryBrokerBackend, NodeConfig, ProxyError, RelayRuntime};
    use relay_types::{BindRequest, LastOperationState, LastOperationRequest, ProvisionRequest};
    use serde_json::json;

    use crate::integration::support::config;

    fn node_config() -> NodeConfig {
        NodeConfig {
            wait_timeout: Duration::from_secs(2),
            poll_interval: Duration::from_millis(20),
            ..NodeConfig::default()
        }
    }

    fn provision(instance_id: &str) -> ProvisionRequest {
        ProvisionRequest {
            instance_id: instance_id.into(),
            service_id: "relay-sample-service".into(),
            plan_id: "relay-sample-plan".into(),
            organization_guid: "org".into(),
            space_guid: "space".into(),
            parameters: Some(json!({"size": "small"})),
            context: None,
            accepts_incomplete: true,
        }
    }

    #[tokio::test]
    async fn test_full_lifecycle_through_relay() {
        let broker = InMemoryBroker::new();
        let backend = Arc::new(InMemoryBrokerBackend::with_sample_catalog().asynchronous());
        let runtime = RelayRuntime::loopback(node_config(), &broker, backend.clone()).unwrap();
        let proxy = runtime.proxy().unwrap();

        exercise_broker(proxy).await.unwrap();
        assert_eq!(backend.instance_count(), 0);

        // Every request was answered and nothing is left waiting
        let proxy_registry = runtime.registry("proxy").unwrap();
        assert_eq!(proxy_registry.registration_count(), 0);
        assert_eq!(proxy_registry.stats().snapshot().dispatched, 7);

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_async_provision_reports_operation() {
        let broker = InMemoryBroker::new();
        let backend = Arc::new(InMemoryBrokerBackend::with_sample_catalog().asynchronous());
        let runtime = RelayRuntime::loopback(node_config(), &broker, backend.clone()).unwrap();
        let proxy = runtime.proxy().unwrap();

        let provisioned = proxy.provision(&provision("i-async")).await.unwrap();
        assert!(provisioned.is_async);
        assert_eq!(provisioned.operation.as_deref(), Some("provision-i-async"));
        assert_eq!(backend.instance_count(), 1);

        let last = proxy
            .last_operation(&LastOperationRequest {
                instance_id: "i-async".into(),
                service_id: None,
                plan_id: None,
                operation: provisioned.operation,
            })
            .await
            .unwrap();
        assert_eq!(last.state, LastOperationState::Succeeded);

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_backend_error_reaches_proxy_with_status() {
        let broker = InMemoryBroker::new();
        let runtime = RelayRuntime::loopback(
            node_config(),
            &broker,
            Arc::new(InMemoryBrokerBackend::with_sample_catalog()),
        )
        .unwrap();
        let proxy = runtime.proxy().unwrap();

        let err = proxy
            .bind(&BindRequest {
                instance_id: "missing".into(),
                binding_id: "b-1".into(),
                service_id: "relay-sample-service".into(),
                plan_id: "relay-sample-plan".into(),
                app_guid: None,
                parameters: None,
                context: None,
            })
            .await
            .unwrap_err();
        match &err {
            ProxyError::Remote(remote) => assert_eq!(remote.status_code, Some(404)),
            other => panic!("expected remote error, got {other}"),
        }
        assert_eq!(err.status_code(), 404);

        // A conflict comes back the same way
        proxy.provision(&provision("i-1")).await.unwrap();
        let mut conflicting = provision("i-1");
        conflicting.plan_id = "another-plan".into();
        let err = proxy.provision(&conflicting).await.unwrap_err();
        assert_eq!(err.status_code(), 409);

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_proxy_times_out_without_worker() {
        let broker = InMemoryBroker::new();
        broker.create_channel(REQUESTS_TOPIC, "nobody-listens").unwrap();
        broker.create_channel(REPLIES_TOPIC, REPLIES_SUBSCRIPTION).unwrap();
        let registry = CorrelationRegistry::new(
            Arc::new(broker.transport(REQUESTS_TOPIC, REPLIES_SUBSCRIPTION)),
            config("proxy"),
        )
        .unwrap();
        let proxy = BrokerProxy::new(registry.clone()).with_timeout(Duration::from_millis(100));

        let err = proxy.get_catalog().await.unwrap_err();
        assert!(matches!(err, ProxyError::Timeout(d) if d == Duration::from_millis(100)));
        assert_eq!(err.status_code(), 504);
        assert_eq!(registry.registration_count(), 0);
        assert_eq!(broker.backlog("nobody-listens"), 1);

        registry.shutdown();
    }

    #[tokio::test]
    async fn test_concurrent_proxy_calls_are_correlated() {
        let broker = InMemoryBroker::new();
        let backend = Arc::new(InMemoryBrokerBackend::with_sample_catalog());
        let runtime = RelayRuntime::loopback(node_config(), &broker, backend.clone()).unwrap();
        let proxy = runtime.proxy().unwrap().clone();

        let calls: Vec<_> = (0..8)
            .map(|n| {
                let proxy = proxy.clone();
                tokio::spawn(async move { proxy.provision(&provision(&format!("i-{n}"))).await })
            })
            .collect();
        for call in calls {
            let response = call.await.unwrap().unwrap();
            assert!(!response.is_async);
        }
        assert_eq!(backend.instance_count(), 8);

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_binding_file_configures_channel() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("binding.json");
        let binding = json!({
            "data": {
                "privateKeyData": STANDARD.encode("{\"type\":\"service_account\"}"),
                "projectId": STANDARD.encode("bound-project"),
                "subscriptionId": STANDARD.encode("bound-subscription"),
                "topicId": STANDARD.encode("bound-topic"),
            }
        });
        std::fs::write(&path, serde_json::to_vec(&binding).unwrap()).unwrap();

        let config = NodeConfig {
            binding_file: Some(path.display().to_string()),
            ..node_config()
        };
        let runtime = RelayRuntime::new(config).await.unwrap();

        let resolved = runtime.config();
        assert_eq!(resolved.project_id.as_deref(), Some("bound-project"));
        assert_eq!(resolved.topic.as_deref(), Some("bound-topic"));
        assert_eq!(resolved.subscription.as_deref(), Some("bound-subscription"));
        let key_path = resolved.credentials_path.clone().unwrap();
        assert_eq!(
            std::fs::read_to_string(&key_path).unwrap(),
            "{\"type\":\"service_account\"}"
        );

        runtime.shutdown().await;
        std::fs::remove_file(key_path).unwrap();
    }

    #[tokio::test]
    async fn test_broken_binding_file_fails_startup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("binding.json");
        std::fs::write(&path, br#"{"data": {"projectId": "???"}}"#).unwrap();

        let config = NodeConfig {
            binding_file: Some(path.display().to_string()),
            ..node_config()
        };
        assert!(RelayRuntime::new(config).await.is_err());
    }
}

use command_bridge::bridge::ExternalBridgeConfig;
use async_trait::async_trait;
use command_bridge::{CommandBridge, CommandBridgeConfig, ForwardingMode};
use common::bus::{BusSubscription, InMemoryMessageBus, MessageBus, SubscriptionId};
use common::domain::{
    Device, DeviceProfile, DeviceResource, DeviceService, DomainError, DomainResult,
    MessageEnvelope, MockDeviceRegistry, ResourceProperties, CONTENT_TYPE_JSON,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(2);

fn registry() -> MockDeviceRegistry {
    let mut registry = MockDeviceRegistry::new();
    registry.expect_device_by_name().returning(|name| match name {
        "dev1" => Ok(Device {
            name: name.to_string(),
            service_name: "svcA".to_string(),
            profile_name: "thermostat".to_string(),
        }),
        other => Err(DomainError::DeviceNotFound(other.to_string())),
    });
    registry.expect_device_service_by_name().returning(|name| {
        Ok(DeviceService {
            name: name.to_string(),
            base_address: "http://svc-a:59900".to_string(),
        })
    });
    registry.expect_device_profile_by_name().returning(|name| {
        Ok(DeviceProfile {
            name: name.to_string(),
            device_resources: vec![DeviceResource {
                name: "temp".to_string(),
                is_hidden: false,
                properties: ResourceProperties {
                    value_type: "Float32".to_string(),
                    read_write: "RW".to_string(),
                },
            }],
            device_commands: vec![],
        })
    });
    registry
}

fn config(forwarding_mode: ForwardingMode, external: bool) -> CommandBridgeConfig {
    CommandBridgeConfig {
        base_topic: "edgex".to_string(),
        command_request_topic: "core/command/request/#".to_string(),
        command_query_request_topic: "core/commandquery/request/#".to_string(),
        device_command_request_topic_prefix: "device/command/request".to_string(),
        response_topic_prefix: "response".to_string(),
        service_key: "core-command".to_string(),
        request_timeout: Duration::from_millis(300),
        service_url: "http://localhost:59882".to_string(),
        forwarding_mode,
        external: external.then(|| ExternalBridgeConfig {
            command_request_topic: "edgex/command/request/#".to_string(),
            command_response_topic_prefix: "edgex/command/response".to_string(),
            query_request_topic: "edgex/commandquery/request/#".to_string(),
            query_response_topic: "edgex/commandquery/response".to_string(),
        }),
    }
}

async fn wait_for_subscriptions(bus: &InMemoryMessageBus, count: usize) {
    tokio::time::timeout(WAIT, async {
        while bus.subscription_count().await < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("bridge subscriptions not established");
}

struct Harness {
    internal: Arc<InMemoryMessageBus>,
    external: Arc<InMemoryMessageBus>,
    ctx: CancellationToken,
}

/// Internal bus as seen by the bridge; records every device command it
/// forwards and every response it publishes, in publish order.
struct RecordingBus {
    inner: Arc<dyn MessageBus>,
    log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl MessageBus for RecordingBus {
    async fn publish(&self, envelope: &MessageEnvelope, topic: &str) -> DomainResult<()> {
        if topic.starts_with("edgex/device/command/request/") {
            self.log
                .lock()
                .await
                .push(format!("forwarded {}", envelope.request_id));
        } else if topic.starts_with("edgex/response/core-command/") {
            self.log
                .lock()
                .await
                .push(format!("responded {}", envelope.request_id));
        }
        self.inner.publish(envelope, topic).await
    }

    async fn subscribe(&self, topic: &str) -> DomainResult<BusSubscription> {
        self.inner.subscribe(topic).await
    }

    async fn unsubscribe(&self, topic: &str, id: SubscriptionId) -> DomainResult<()> {
        self.inner.unsubscribe(topic, id).await
    }

    async fn request(
        &self,
        envelope: &MessageEnvelope,
        request_topic: &str,
        response_topic_prefix: &str,
        timeout: Duration,
    ) -> DomainResult<MessageEnvelope> {
        common::bus::do_request(self, envelope, request_topic, response_topic_prefix, timeout)
            .await
    }
}

impl Harness {
    async fn start(forwarding_mode: ForwardingMode, external: bool) -> Self {
        Self::start_with_internal(forwarding_mode, external, |bus| bus).await
    }

    /// Start the bridge with the bridge-side internal bus wrapped by `wrap`
    async fn start_with_internal(
        forwarding_mode: ForwardingMode,
        external: bool,
        wrap: impl FnOnce(Arc<dyn MessageBus>) -> Arc<dyn MessageBus>,
    ) -> Self {
        let internal = Arc::new(InMemoryMessageBus::new());
        let external_bus = Arc::new(InMemoryMessageBus::new());
        let ctx = CancellationToken::new();

        let bridge = CommandBridge::new(
            wrap(internal.clone() as Arc<dyn MessageBus>),
            external.then(|| external_bus.clone() as Arc<dyn MessageBus>),
            Arc::new(registry()),
            config(forwarding_mode, external),
        )
        .unwrap();
        let internal_processes = bridge
            .process_names()
            .iter()
            .filter(|name| !name.starts_with("external"))
            .count();
        let external_processes = bridge.process_names().len() - internal_processes;

        for (_, process) in bridge.into_runner_processes() {
            tokio::spawn(process(ctx.clone()));
        }
        wait_for_subscriptions(&internal, internal_processes).await;
        wait_for_subscriptions(&external_bus, external_processes).await;

        Self {
            internal,
            external: external_bus,
            ctx,
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.ctx.cancel();
    }
}

/// Fake device service: answers every command after `delay`, echoing the
/// request topic it saw. Each reply runs on its own task so the service never
/// serializes requests itself.
async fn spawn_device_service(bus: Arc<InMemoryMessageBus>, delay: Duration) {
    let mut subscription = bus
        .subscribe("edgex/device/command/request/svcA/#")
        .await
        .unwrap();
    tokio::spawn(async move {
        while let Some(request) = subscription.messages.recv().await {
            let bus = bus.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let reply = MessageEnvelope::for_response(
                    request.received_topic.clone().into_bytes(),
                    &request.request_id,
                    &request.correlation_id,
                    CONTENT_TYPE_JSON,
                );
                let topic = format!("edgex/response/svcA/{}", request.request_id);
                bus.publish(&reply, &topic).await.unwrap();
            });
        }
    });
}

fn request(request_id: &str) -> MessageEnvelope {
    let mut envelope = MessageEnvelope::for_request(Vec::new(), HashMap::new());
    envelope.request_id = request_id.to_string();
    envelope
}

async fn next(subscription: &mut BusSubscription) -> MessageEnvelope {
    tokio::time::timeout(WAIT, subscription.messages.recv())
        .await
        .expect("no response published")
        .expect("subscription closed")
}

#[tokio::test]
async fn test_internal_command_round_trip() {
    let harness = Harness::start(ForwardingMode::RequestReply, false).await;
    spawn_device_service(harness.internal.clone(), Duration::ZERO).await;

    let mut responses = harness
        .internal
        .subscribe("edgex/response/core-command/#")
        .await
        .unwrap();
    let command = request("r1");
    harness
        .internal
        .publish(&command, "edgex/core/command/request/dev1/temp/get")
        .await
        .unwrap();

    let response = next(&mut responses).await;
    assert_eq!(response.received_topic, "edgex/response/core-command/r1");
    assert_eq!(response.request_id, "r1");
    assert_eq!(response.correlation_id, command.correlation_id);
    assert!(!response.is_error());
    assert_eq!(
        response.payload_text(),
        "edgex/device/command/request/svcA/dev1/temp/get"
    );
}

#[tokio::test]
async fn test_requests_on_one_subscription_are_forwarded_sequentially() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let recorder_log = log.clone();
    let harness = Harness::start_with_internal(ForwardingMode::RequestReply, false, |bus| {
        Arc::new(RecordingBus {
            inner: bus,
            log: recorder_log,
        })
    })
    .await;
    spawn_device_service(harness.internal.clone(), Duration::from_millis(50)).await;

    let mut responses = harness
        .internal
        .subscribe("edgex/response/core-command/#")
        .await
        .unwrap();
    for id in ["r1", "r2"] {
        harness
            .internal
            .publish(&request(id), "edgex/core/command/request/dev1/temp/get")
            .await
            .unwrap();
    }

    assert_eq!(next(&mut responses).await.request_id, "r1");
    assert_eq!(next(&mut responses).await.request_id, "r2");
    // r2 is only forwarded once r1 has been answered
    assert_eq!(
        *log.lock().await,
        vec!["forwarded r1", "responded r1", "forwarded r2", "responded r2"]
    );
}

#[tokio::test]
async fn test_internal_unknown_device_gets_error_response() {
    let harness = Harness::start(ForwardingMode::RequestReply, false).await;
    let mut responses = harness
        .internal
        .subscribe("edgex/response/core-command/#")
        .await
        .unwrap();

    harness
        .internal
        .publish(&request("r1"), "edgex/core/command/request/ghost/temp/get")
        .await
        .unwrap();

    let response = next(&mut responses).await;
    assert!(response.is_error());
    assert!(response.payload_text().contains("ghost"));
}

#[tokio::test]
async fn test_external_command_round_trip() {
    let harness = Harness::start(ForwardingMode::RequestReply, true).await;
    spawn_device_service(harness.internal.clone(), Duration::ZERO).await;

    let mut responses = harness
        .external
        .subscribe("edgex/command/response/#")
        .await
        .unwrap();
    harness
        .external
        .publish(&request("r1"), "edgex/command/request/dev1/temp/set")
        .await
        .unwrap();

    let response = next(&mut responses).await;
    assert_eq!(response.received_topic, "edgex/command/response/dev1/temp/set");
    assert!(!response.is_error());
    assert_eq!(
        response.payload_text(),
        "edgex/device/command/request/svcA/dev1/temp/set"
    );
}

#[tokio::test(start_paused = true)]
async fn test_external_timeout_yields_error_response() {
    // no device service is listening
    let harness = Harness::start(ForwardingMode::RequestReply, true).await;
    let mut responses = harness
        .external
        .subscribe("edgex/command/response/#")
        .await
        .unwrap();

    harness
        .external
        .publish(&request("r1"), "edgex/command/request/dev1/temp/get")
        .await
        .unwrap();

    let response = next(&mut responses).await;
    assert!(response.is_error());
    assert!(response
        .payload_text()
        .starts_with("failed to send device command request with internal message bus"));
}

#[tokio::test(start_paused = true)]
async fn test_internal_timeout_publishes_nothing() {
    let harness = Harness::start(ForwardingMode::RequestReply, false).await;
    let mut responses = harness
        .internal
        .subscribe("edgex/response/core-command/#")
        .await
        .unwrap();

    harness
        .internal
        .publish(&request("r1"), "edgex/core/command/request/dev1/temp/get")
        .await
        .unwrap();

    let outcome = tokio::time::timeout(Duration::from_millis(600), responses.messages.recv()).await;
    assert!(outcome.is_err());
}

#[tokio::test]
async fn test_internal_query_single_device() {
    let harness = Harness::start(ForwardingMode::RequestReply, false).await;
    let mut responses = harness
        .internal
        .subscribe("edgex/response/core-command/#")
        .await
        .unwrap();

    harness
        .internal
        .publish(&request("q1"), "edgex/core/commandquery/request/dev1")
        .await
        .unwrap();

    let response = next(&mut responses).await;
    assert_eq!(response.received_topic, "edgex/response/core-command/q1");
    let body: serde_json::Value = serde_json::from_slice(&response.payload).unwrap();
    assert_eq!(body["deviceCoreCommand"]["profileName"], "thermostat");
    assert_eq!(
        body["deviceCoreCommand"]["coreCommands"][0]["url"],
        "http://localhost:59882"
    );
    assert_eq!(body["deviceCoreCommand"]["coreCommands"][0]["set"], true);
}

#[tokio::test]
async fn test_external_query_uses_fixed_response_topic() {
    let harness = Harness::start(ForwardingMode::RequestReply, true).await;
    let mut responses = harness
        .external
        .subscribe("edgex/commandquery/response")
        .await
        .unwrap();

    harness
        .external
        .publish(&request("q1"), "edgex/commandquery/request/ghost")
        .await
        .unwrap();

    let response = next(&mut responses).await;
    assert_eq!(response.received_topic, "edgex/commandquery/response");
    assert_eq!(response.request_id, "q1");
    assert!(response.is_error());
}

#[tokio::test]
async fn test_correlation_registry_mode_relays_replies() {
    let harness = Harness::start(
        ForwardingMode::CorrelationRegistry {
            capacity: 16,
            max_age: Duration::from_secs(5),
        },
        true,
    )
    .await;
    spawn_device_service(harness.internal.clone(), Duration::ZERO).await;

    let mut internal_responses = harness
        .internal
        .subscribe("edgex/response/core-command/#")
        .await
        .unwrap();
    let mut external_responses = harness
        .external
        .subscribe("edgex/command/response/#")
        .await
        .unwrap();

    harness
        .internal
        .publish(&request("r1"), "edgex/core/command/request/dev1/temp/get")
        .await
        .unwrap();
    harness
        .external
        .publish(&request("r2"), "edgex/command/request/dev1/temp/get")
        .await
        .unwrap();

    let internal_response = next(&mut internal_responses).await;
    assert_eq!(internal_response.request_id, "r1");
    assert_eq!(
        internal_response.received_topic,
        "edgex/response/core-command/r1"
    );

    let external_response = next(&mut external_responses).await;
    assert_eq!(external_response.request_id, "r2");
    assert_eq!(
        external_response.received_topic,
        "edgex/command/response/dev1/temp/get"
    );
}

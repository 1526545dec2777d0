use crate::bridge::{publish_response, EnvelopeHandler, SubscriptionProcess};
use crate::domain::CorrelationRegistry;
use async_trait::async_trait;
use common::bus::{build_topic, topic_matches, MessageBus, MULTI_LEVEL_WILDCARD};
use common::domain::MessageEnvelope;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Routes device-service replies recorded by the registry forwarder back to
/// the original caller
pub struct ResponseRelay {
    internal_bus: Arc<dyn MessageBus>,
    external_bus: Option<Arc<dyn MessageBus>>,
    registry: Arc<CorrelationRegistry>,
    /// `<base>/<response>/#`
    subscribe_topic: String,
    /// `<base>/<response>/<service key>/#`, replies this service produced itself
    own_topic_pattern: String,
}

impl ResponseRelay {
    /// `response_topic_root` is `<base>/<response>`; `own_response_prefix` is
    /// the prefix this service publishes its own responses under
    pub fn new(
        internal_bus: Arc<dyn MessageBus>,
        external_bus: Option<Arc<dyn MessageBus>>,
        registry: Arc<CorrelationRegistry>,
        response_topic_root: &str,
        own_response_prefix: &str,
    ) -> Self {
        Self {
            internal_bus,
            external_bus,
            registry,
            subscribe_topic: build_topic(response_topic_root, &[MULTI_LEVEL_WILDCARD]),
            own_topic_pattern: build_topic(own_response_prefix, &[MULTI_LEVEL_WILDCARD]),
        }
    }

    pub fn into_process(self) -> SubscriptionProcess {
        let bus = self.internal_bus.clone();
        let topic = self.subscribe_topic.clone();
        SubscriptionProcess::new("response_relay", bus, topic, Arc::new(self))
    }

    #[instrument(
        name = "relay_response",
        skip_all,
        fields(request_id = %envelope.request_id, topic = %envelope.received_topic)
    )]
    async fn relay(&self, mut envelope: MessageEnvelope) {
        if topic_matches(&self.own_topic_pattern, &envelope.received_topic) {
            return;
        }

        let Some(pending) = self.registry.response_topic(&envelope.request_id) else {
            warn!("no pending command for response, dropping");
            return;
        };

        let bus = if pending.is_external {
            match &self.external_bus {
                Some(bus) => bus.as_ref(),
                None => {
                    warn!("response belongs to external caller but no external broker is configured");
                    return;
                }
            }
        } else {
            self.internal_bus.as_ref()
        };

        debug!(response_topic = %pending.topic, external = pending.is_external, "relaying response");
        envelope.received_topic = pending.topic.clone();
        publish_response(bus, &envelope, &pending.topic).await;
    }
}

#[async_trait]
impl EnvelopeHandler for ResponseRelay {
    async fn handle(&self, envelope: MessageEnvelope) {
        self.relay(envelope).await
    }
}

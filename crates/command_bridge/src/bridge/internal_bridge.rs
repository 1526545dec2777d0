use crate::bridge::{publish_response, EnvelopeHandler, SubscriptionProcess};
use crate::domain::{
    parse_query_topic, CommandAddressing, CommandQueryDispatcher, CommandRequestDispatcher,
    DispatchOutcome, ResponseAddress, Transport,
};
use async_trait::async_trait;
use common::bus::{build_topic, topic_prefix_len, MessageBus};
use common::domain::MessageEnvelope;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalBridgeConfig {
    /// e.g. `edgex/core/command/request/#`
    pub command_request_topic: String,
    /// e.g. `edgex/core/commandquery/request/#`
    pub command_query_request_topic: String,
    /// e.g. `edgex/response/core-command`; responses go to `<prefix>/<RequestID>`
    pub response_topic_prefix: String,
}

/// Serves command requests and queries arriving on the internal bus
pub struct InternalBridge {
    bus: Arc<dyn MessageBus>,
    request_dispatcher: Arc<CommandRequestDispatcher>,
    query_dispatcher: Arc<CommandQueryDispatcher>,
    config: InternalBridgeConfig,
}

impl InternalBridge {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        request_dispatcher: Arc<CommandRequestDispatcher>,
        query_dispatcher: Arc<CommandQueryDispatcher>,
        config: InternalBridgeConfig,
    ) -> Self {
        Self {
            bus,
            request_dispatcher,
            query_dispatcher,
            config,
        }
    }

    pub fn addressing(&self) -> CommandAddressing {
        CommandAddressing {
            transport: Transport::Internal,
            request_prefix_len: topic_prefix_len(&self.config.command_request_topic),
            response: ResponseAddress::ByRequestId {
                prefix: self.config.response_topic_prefix.clone(),
            },
        }
    }

    pub fn into_processes(self) -> Vec<SubscriptionProcess> {
        let request_handler = CommandRequestHandler {
            bus: self.bus.clone(),
            dispatcher: self.request_dispatcher.clone(),
            addressing: self.addressing(),
        };
        let query_handler = InternalQueryHandler {
            bus: self.bus.clone(),
            dispatcher: self.query_dispatcher,
            response_topic_prefix: self.config.response_topic_prefix,
        };

        vec![
            SubscriptionProcess::new(
                "internal_command_requests",
                self.bus.clone(),
                self.config.command_request_topic,
                Arc::new(request_handler),
            ),
            SubscriptionProcess::new(
                "internal_command_queries",
                self.bus,
                self.config.command_query_request_topic,
                Arc::new(query_handler),
            ),
        ]
    }
}

/// Dispatches command requests and publishes the outcome back on the same bus
pub(crate) struct CommandRequestHandler {
    pub(crate) bus: Arc<dyn MessageBus>,
    pub(crate) dispatcher: Arc<CommandRequestDispatcher>,
    pub(crate) addressing: CommandAddressing,
}

#[async_trait]
impl EnvelopeHandler for CommandRequestHandler {
    async fn handle(&self, envelope: MessageEnvelope) {
        match self.dispatcher.dispatch(envelope, &self.addressing).await {
            DispatchOutcome::Respond { envelope, topic } => {
                publish_response(self.bus.as_ref(), &envelope, &topic).await
            }
            DispatchOutcome::Deferred => debug!("command response deferred to relay"),
            DispatchOutcome::Dropped => {}
        }
    }
}

struct InternalQueryHandler {
    bus: Arc<dyn MessageBus>,
    dispatcher: Arc<CommandQueryDispatcher>,
    response_topic_prefix: String,
}

#[async_trait]
impl EnvelopeHandler for InternalQueryHandler {
    async fn handle(&self, envelope: MessageEnvelope) {
        let target = parse_query_topic(&envelope.received_topic);
        if let Some(mut response) = self.dispatcher.handle_query(&envelope, target).await {
            let topic = build_topic(&self.response_topic_prefix, &[envelope.request_id.as_str()]);
            response.received_topic = topic.clone();
            publish_response(self.bus.as_ref(), &response, &topic).await;
        }
    }
}

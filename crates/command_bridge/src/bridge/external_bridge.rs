use crate::bridge::internal_bridge::CommandRequestHandler;
use crate::bridge::{publish_response, EnvelopeHandler, SubscriptionProcess};
use crate::domain::{
    parse_query_topic, CommandAddressing, CommandQueryDispatcher, CommandRequestDispatcher,
    ResponseAddress, Transport,
};
use async_trait::async_trait;
use common::bus::{topic_prefix_len, MessageBus};
use common::domain::MessageEnvelope;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalBridgeConfig {
    /// e.g. `edgex/command/request/#`
    pub command_request_topic: String,
    /// responses go to `<prefix>/<device>/<command>/<method>`
    pub command_response_topic_prefix: String,
    /// e.g. `edgex/commandquery/request/#`
    pub query_request_topic: String,
    /// every query response is published here
    pub query_response_topic: String,
}

/// Serves command requests and queries arriving on the external broker.
///
/// Commands are still forwarded over the internal bus; only the inbound
/// request and its response use the broker.
pub struct ExternalBridge {
    bus: Arc<dyn MessageBus>,
    request_dispatcher: Arc<CommandRequestDispatcher>,
    query_dispatcher: Arc<CommandQueryDispatcher>,
    config: ExternalBridgeConfig,
}

impl ExternalBridge {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        request_dispatcher: Arc<CommandRequestDispatcher>,
        query_dispatcher: Arc<CommandQueryDispatcher>,
        config: ExternalBridgeConfig,
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
            transport: Transport::External,
            request_prefix_len: topic_prefix_len(&self.config.command_request_topic),
            response: ResponseAddress::ByCommandPath {
                prefix: self.config.command_response_topic_prefix.clone(),
            },
        }
    }

    pub fn into_processes(self) -> Vec<SubscriptionProcess> {
        let request_handler = CommandRequestHandler {
            bus: self.bus.clone(),
            dispatcher: self.request_dispatcher.clone(),
            addressing: self.addressing(),
        };
        let query_handler = ExternalQueryHandler {
            bus: self.bus.clone(),
            dispatcher: self.query_dispatcher,
            response_topic: self.config.query_response_topic,
        };

        vec![
            SubscriptionProcess::new(
                "external_command_requests",
                self.bus.clone(),
                self.config.command_request_topic,
                Arc::new(request_handler),
            ),
            SubscriptionProcess::new(
                "external_command_queries",
                self.bus,
                self.config.query_request_topic,
                Arc::new(query_handler),
            ),
        ]
    }
}

struct ExternalQueryHandler {
    bus: Arc<dyn MessageBus>,
    dispatcher: Arc<CommandQueryDispatcher>,
    response_topic: String,
}

#[async_trait]
impl EnvelopeHandler for ExternalQueryHandler {
    async fn handle(&self, envelope: MessageEnvelope) {
        let target = parse_query_topic(&envelope.received_topic);
        if let Some(mut response) = self.dispatcher.handle_query(&envelope, target).await {
            response.received_topic = self.response_topic.clone();
            publish_response(self.bus.as_ref(), &response, &self.response_topic).await;
        }
    }
}

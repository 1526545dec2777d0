use crate::domain::CorrelationRegistry;
use async_trait::async_trait;
use common::bus::MessageBus;
use common::domain::{DomainResult, MessageEnvelope};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Transport a request arrived on, and that its response goes back over
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Internal,
    External,
}

impl Transport {
    pub fn is_external(&self) -> bool {
        matches!(self, Transport::External)
    }
}

/// Final destination of a command response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyRoute {
    pub topic: String,
    pub transport: Transport,
}

/// A command request addressed to its owning device service
#[derive(Debug, Clone)]
pub struct ForwardRequest {
    pub envelope: MessageEnvelope,
    pub request_topic: String,
    pub response_topic_prefix: String,
    pub timeout: Duration,
    pub reply_to: ReplyRoute,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ForwardOutcome {
    /// The device service replied within the timeout
    Replied(MessageEnvelope),
    /// The reply will be routed later by the response relay
    Deferred,
}

/// Strategy for correlating a forwarded command with its reply
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait CommandForwarder: Send + Sync {
    async fn forward(&self, request: ForwardRequest) -> DomainResult<ForwardOutcome>;
}

/// Forwards with the bounded request-reply primitive of the internal bus
pub struct RequestReplyForwarder {
    internal_bus: Arc<dyn MessageBus>,
}

impl RequestReplyForwarder {
    pub fn new(internal_bus: Arc<dyn MessageBus>) -> Self {
        Self { internal_bus }
    }
}

#[async_trait]
impl CommandForwarder for RequestReplyForwarder {
    async fn forward(&self, request: ForwardRequest) -> DomainResult<ForwardOutcome> {
        let reply = self
            .internal_bus
            .request(
                &request.envelope,
                &request.request_topic,
                &request.response_topic_prefix,
                request.timeout,
            )
            .await?;
        Ok(ForwardOutcome::Replied(reply))
    }
}

/// Publishes the request and records its reply route in a [`CorrelationRegistry`].
///
/// Replies are matched up by the `ResponseRelay` process.
pub struct RegistryForwarder {
    internal_bus: Arc<dyn MessageBus>,
    registry: Arc<CorrelationRegistry>,
}

impl RegistryForwarder {
    pub fn new(internal_bus: Arc<dyn MessageBus>, registry: Arc<CorrelationRegistry>) -> Self {
        Self {
            internal_bus,
            registry,
        }
    }
}

#[async_trait]
impl CommandForwarder for RegistryForwarder {
    async fn forward(&self, request: ForwardRequest) -> DomainResult<ForwardOutcome> {
        let request_id = &request.envelope.request_id;

        // registered first so a fast reply cannot beat the entry
        self.registry.set_response_topic(
            request_id,
            &request.reply_to.topic,
            request.reply_to.transport.is_external(),
        );

        if let Err(e) = self
            .internal_bus
            .publish(&request.envelope, &request.request_topic)
            .await
        {
            self.registry.response_topic(request_id);
            return Err(e);
        }

        debug!(
            request_id = %request_id,
            request_topic = %request.request_topic,
            "command request published, reply deferred to relay"
        );
        Ok(ForwardOutcome::Deferred)
    }
}

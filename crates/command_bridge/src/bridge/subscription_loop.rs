use anyhow::Context;
use async_trait::async_trait;
use common::bus::{BusSubscription, MessageBus};
use common::domain::MessageEnvelope;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Handles one inbound envelope to completion
#[async_trait]
pub trait EnvelopeHandler: Send + Sync {
    async fn handle(&self, envelope: MessageEnvelope);
}

/// A long-lived subscription served by a single task
pub struct SubscriptionProcess {
    pub name: String,
    bus: Arc<dyn MessageBus>,
    topic: String,
    handler: Arc<dyn EnvelopeHandler>,
}

impl SubscriptionProcess {
    pub fn new(
        name: impl Into<String>,
        bus: Arc<dyn MessageBus>,
        topic: impl Into<String>,
        handler: Arc<dyn EnvelopeHandler>,
    ) -> Self {
        Self {
            name: name.into(),
            bus,
            topic: topic.into(),
            handler,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Subscribe and serve until `ctx` is cancelled
    pub async fn run(self, ctx: CancellationToken) -> anyhow::Result<()> {
        let subscription = self
            .bus
            .subscribe(&self.topic)
            .await
            .with_context(|| format!("failed to subscribe to {}", self.topic))?;
        info!(process = %self.name, topic = %self.topic, "subscribed");
        let subscription_id = subscription.id;

        let result = serve_subscription(subscription, self.handler.as_ref(), &ctx).await;

        if let Err(e) = self.bus.unsubscribe(&self.topic, subscription_id).await {
            warn!(topic = %self.topic, error = %e, "failed to unsubscribe");
        }
        result
    }
}

/// Drain `subscription` one message at a time.
///
/// Each envelope is handled to completion before the next is received, so
/// messages on one subscription are processed strictly in delivery order.
/// Cancellation is observed between messages and never interrupts a handler.
pub async fn serve_subscription(
    mut subscription: BusSubscription,
    handler: &dyn EnvelopeHandler,
    ctx: &CancellationToken,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            biased;
            _ = ctx.cancelled() => {
                debug!(topic = %subscription.topic, "subscription loop cancelled");
                return Ok(());
            }
            message = subscription.messages.recv() => {
                match message {
                    Some(envelope) => handler.handle(envelope).await,
                    None => anyhow::bail!("subscription on {} closed", subscription.topic),
                }
            }
            Some(err) = subscription.errors.recv() => {
                error!(topic = %subscription.topic, error = %err, "failed to receive message");
                warn!("not publishing error message back due to insufficient information on response topic");
            }
        }
    }
}

/// Publish a response; failures are logged and not retried
pub async fn publish_response(bus: &dyn MessageBus, envelope: &MessageEnvelope, topic: &str) {
    match bus.publish(envelope, topic).await {
        Ok(()) => debug!(
            topic = %topic,
            request_id = %envelope.request_id,
            error_code = envelope.error_code,
            "published response"
        ),
        Err(e) => error!(
            topic = %topic,
            request_id = %envelope.request_id,
            error = %e,
            "failed to publish response"
        ),
    }
}

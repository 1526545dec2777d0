use crate::bus::{
    do_request, subject_to_topic, topic_to_subject, BusSubscription, MessageBus, SubscriptionId,
    SubscriptionSender,
};
use crate::domain::{DomainResult, MessageEnvelope};
use anyhow::Context;
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Internal message bus backed by core NATS publish/subscribe.
///
/// '/' topics are mapped to '.' subjects on the way out and back on receipt.
pub struct NatsMessageBus {
    client: async_nats::Client,
    subscriptions: Mutex<HashMap<String, Vec<(SubscriptionId, CancellationToken)>>>,
}

impl NatsMessageBus {
    pub async fn connect(url: &str, timeout: Duration) -> anyhow::Result<Self> {
        info!(url = %url, timeout_ms = timeout.as_millis(), "Connecting to NATS");

        let client = async_nats::ConnectOptions::new()
            .connection_timeout(timeout)
            .connect(url)
            .await
            .context("Failed to connect to NATS")?;

        info!("Successfully connected to NATS");
        Ok(Self::new(client))
    }

    pub fn new(client: async_nats::Client) -> Self {
        Self {
            client,
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    /// Stop every forwarding task and flush pending publishes
    pub async fn close(&self) -> anyhow::Result<()> {
        info!("Closing NATS connection");
        for (_, tokens) in self.subscriptions.lock().await.drain() {
            tokens.iter().for_each(|(_, token)| token.cancel());
        }
        self.client
            .flush()
            .await
            .context("Failed to flush NATS connection")?;
        Ok(())
    }
}

#[async_trait]
impl MessageBus for NatsMessageBus {
    #[instrument(skip(self, envelope), fields(request_id = %envelope.request_id))]
    async fn publish(&self, envelope: &MessageEnvelope, topic: &str) -> DomainResult<()> {
        let payload = envelope.encode()?;
        self.client
            .publish(topic_to_subject(topic), payload.into())
            .await
            .with_context(|| format!("Failed to publish to {}", topic))?;
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> DomainResult<BusSubscription> {
        let subject = topic_to_subject(topic);
        let subscriber = self
            .client
            .subscribe(subject.clone())
            .await
            .with_context(|| format!("Failed to subscribe to {}", subject))?;

        let (sender, subscription) = BusSubscription::channel(topic);
        let token = CancellationToken::new();
        tokio::spawn(forward_messages(subscriber, sender, token.clone()));

        self.subscriptions
            .lock()
            .await
            .entry(topic.to_string())
            .or_default()
            .push((subscription.id, token));

        debug!(topic = %topic, subject = %subject, "subscribed");
        Ok(subscription)
    }

    async fn unsubscribe(&self, topic: &str, id: SubscriptionId) -> DomainResult<()> {
        let mut subscriptions = self.subscriptions.lock().await;
        if let Some(tokens) = subscriptions.get_mut(topic) {
            tokens.retain(|(subscription_id, token)| {
                if *subscription_id == id {
                    token.cancel();
                }
                *subscription_id != id
            });
            if tokens.is_empty() {
                subscriptions.remove(topic);
            }
        }
        Ok(())
    }

    async fn request(
        &self,
        envelope: &MessageEnvelope,
        request_topic: &str,
        response_topic_prefix: &str,
        timeout: Duration,
    ) -> DomainResult<MessageEnvelope> {
        do_request(self, envelope, request_topic, response_topic_prefix, timeout).await
    }
}

async fn forward_messages(
    mut subscriber: async_nats::Subscriber,
    sender: SubscriptionSender,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                if let Err(e) = subscriber.unsubscribe().await {
                    warn!(error = %e, "Failed to unsubscribe from NATS");
                }
                break;
            }
            message = subscriber.next() => {
                let Some(message) = message else {
                    debug!("NATS subscription ended");
                    break;
                };

                match MessageEnvelope::decode(&message.payload) {
                    Ok(mut envelope) => {
                        envelope.received_topic = subject_to_topic(message.subject.as_str());
                        if sender.messages.send(envelope).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        error!(subject = %message.subject, error = %e, "Dropping undecodable message");
                        if let Err(send_err) = sender.errors.try_send(e) {
                            warn!(error = %send_err, "Subscription error queue unavailable");
                        }
                    }
                }
            }
        }
    }
}


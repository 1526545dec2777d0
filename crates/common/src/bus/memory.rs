use crate::bus::{
    do_request, topic_matches, BusSubscription, MessageBus, SubscriptionId, SubscriptionSender,
};
use crate::domain::{DomainResult, MessageEnvelope};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

/// In-process bus with MQTT style wildcard matching.
///
/// Used by tests and by single-process deployments. Once `subscribe` returns,
/// every later matching publish is delivered. Subscriptions whose receiver was
/// dropped are pruned on the next publish.
#[derive(Default)]
pub struct InMemoryMessageBus {
    subscriptions: RwLock<HashMap<String, Vec<SubscriptionSender>>>,
}

impl InMemoryMessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of patterns with at least one live subscriber
    pub async fn subscription_count(&self) -> usize {
        self.subscriptions.read().await.len()
    }
}

#[async_trait]
impl MessageBus for InMemoryMessageBus {
    async fn publish(&self, envelope: &MessageEnvelope, topic: &str) -> DomainResult<()> {
        let targets: Vec<SubscriptionSender> = {
            let subscriptions = self.subscriptions.read().await;
            subscriptions
                .iter()
                .filter(|(pattern, _)| topic_matches(pattern, topic))
                .flat_map(|(_, senders)| senders.iter().cloned())
                .collect()
        };

        debug!(topic = %topic, subscribers = targets.len(), "publishing to in-memory bus");

        let mut closed = false;
        for target in targets {
            let mut delivered = envelope.clone();
            delivered.received_topic = topic.to_string();
            if target.messages.send(delivered).await.is_err() {
                closed = true;
            }
        }

        if closed {
            let mut subscriptions = self.subscriptions.write().await;
            subscriptions.retain(|_, senders| {
                senders.retain(|s| !s.messages.is_closed());
                !senders.is_empty()
            });
        }

        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> DomainResult<BusSubscription> {
        let (sender, subscription) = BusSubscription::channel(topic);
        self.subscriptions
            .write()
            .await
            .entry(topic.to_string())
            .or_default()
            .push(sender);
        Ok(subscription)
    }

    async fn unsubscribe(&self, topic: &str, id: SubscriptionId) -> DomainResult<()> {
        let mut subscriptions = self.subscriptions.write().await;
        if let Some(senders) = subscriptions.get_mut(topic) {
            senders.retain(|s| s.id != id);
            if senders.is_empty() {
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

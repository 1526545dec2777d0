use crate::domain::{DomainError, DomainResult, MessageEnvelope};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

/// Default capacity of the per-subscription delivery queues
pub const SUBSCRIPTION_QUEUE_CAPACITY: usize = 256;

/// Identifies one subscriber among those sharing a topic pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Inbound side of a subscription.
///
/// `messages` yields decoded envelopes with `received_topic` set; `errors`
/// yields delivery failures (undecodable payloads, transport faults) that do
/// not end the subscription.
#[derive(Debug)]
pub struct BusSubscription {
    pub id: SubscriptionId,
    pub topic: String,
    pub messages: mpsc::Receiver<MessageEnvelope>,
    pub errors: mpsc::Receiver<DomainError>,
}

/// Sending half handed to the transport that feeds a [`BusSubscription`]
#[derive(Debug, Clone)]
pub struct SubscriptionSender {
    pub id: SubscriptionId,
    pub messages: mpsc::Sender<MessageEnvelope>,
    pub errors: mpsc::Sender<DomainError>,
}

impl BusSubscription {
    /// Create a subscription and the sender the transport feeds it through
    pub fn channel(topic: impl Into<String>) -> (SubscriptionSender, BusSubscription) {
        let (message_tx, message_rx) = mpsc::channel(SUBSCRIPTION_QUEUE_CAPACITY);
        let (error_tx, error_rx) = mpsc::channel(SUBSCRIPTION_QUEUE_CAPACITY);
        let id = SubscriptionId::next();
        (
            SubscriptionSender {
                id,
                messages: message_tx,
                errors: error_tx,
            },
            BusSubscription {
                id,
                topic: topic.into(),
                messages: message_rx,
                errors: error_rx,
            },
        )
    }
}

/// Bus Gateway contract consumed by the command bridges.
///
/// Topics are always '/'-delimited with MQTT style wildcards (`+`, `#`);
/// transports translate to their native subject syntax internally.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish an envelope to a concrete topic
    async fn publish(&self, envelope: &MessageEnvelope, topic: &str) -> DomainResult<()>;

    /// Subscribe to a topic pattern
    async fn subscribe(&self, topic: &str) -> DomainResult<BusSubscription>;

    /// Drop the subscription `id` registered for `topic`; other subscribers
    /// of the same pattern keep receiving
    async fn unsubscribe(&self, topic: &str, id: SubscriptionId) -> DomainResult<()>;

    /// Publish to `request_topic` and wait up to `timeout` for the reply on
    /// `<response_topic_prefix>/<RequestID>`.
    ///
    /// Implementations delegate to [`crate::bus::do_request`].
    async fn request(
        &self,
        envelope: &MessageEnvelope,
        request_topic: &str,
        response_topic_prefix: &str,
        timeout: Duration,
    ) -> DomainResult<MessageEnvelope>;
}

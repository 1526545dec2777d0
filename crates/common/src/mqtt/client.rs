use crate::bus::{do_request, BusSubscription, MessageBus, SubscriptionId, SubscriptionSender};
use crate::domain::{DomainError, DomainResult, MessageEnvelope};
use crate::mqtt::MqttConnection;
use async_trait::async_trait;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};

const DEFAULT_MQTT_PORT: u16 = 1883;
const REQUEST_CHANNEL_CAPACITY: usize = 100;

/// Subscription patterns and the queues fed from them
pub(crate) type Routes = Arc<RwLock<HashMap<String, Vec<SubscriptionSender>>>>;

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub url: String,
    pub client_id: String,
    pub qos: u8,
    pub retain: bool,
    pub keep_alive: Duration,
}

/// External message bus backed by an MQTT broker.
///
/// Network IO happens in the paired [`MqttConnection`], which must be running
/// for publishes to leave the process and for subscriptions to receive.
pub struct MqttMessageBus {
    client: AsyncClient,
    routes: Routes,
    qos: QoS,
    retain: bool,
}

impl MqttMessageBus {
    /// Build the bus and its connection driver
    pub fn connect(config: &MqttConfig) -> DomainResult<(Self, MqttConnection)> {
        let (host, port) = parse_broker_url(&config.url)?;
        let qos = qos_from_level(config.qos)?;

        info!(
            host = %host,
            port = port,
            client_id = %config.client_id,
            "configuring MQTT client"
        );

        let mut mqtt_options = MqttOptions::new(&config.client_id, host, port);
        mqtt_options.set_keep_alive(config.keep_alive);
        mqtt_options.set_clean_session(true);

        let (client, eventloop) = AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY);
        let routes: Routes = Arc::new(RwLock::new(HashMap::new()));

        let connection = MqttConnection::new(eventloop, client.clone(), routes.clone(), qos);
        Ok((
            Self {
                client,
                routes,
                qos,
                retain: config.retain,
            },
            connection,
        ))
    }

    pub async fn disconnect(&self) -> DomainResult<()> {
        self.client
            .disconnect()
            .await
            .map_err(|e| DomainError::Transport(anyhow::anyhow!("Failed to disconnect: {}", e)))
    }
}

#[async_trait]
impl MessageBus for MqttMessageBus {
    #[instrument(skip(self, envelope), fields(request_id = %envelope.request_id))]
    async fn publish(&self, envelope: &MessageEnvelope, topic: &str) -> DomainResult<()> {
        let payload = envelope.encode()?;
        self.client
            .publish(topic, self.qos, self.retain, payload)
            .await
            .map_err(|e| {
                DomainError::Transport(anyhow::anyhow!("Failed to publish to {}: {}", topic, e))
            })
    }

    async fn subscribe(&self, topic: &str) -> DomainResult<BusSubscription> {
        let (sender, subscription) = BusSubscription::channel(topic);
        self.routes
            .write()
            .await
            .entry(topic.to_string())
            .or_default()
            .push(sender);

        self.client.subscribe(topic, self.qos).await.map_err(|e| {
            DomainError::Transport(anyhow::anyhow!("Failed to subscribe to {}: {}", topic, e))
        })?;

        debug!(topic = %topic, "subscribed to MQTT topic");
        Ok(subscription)
    }

    /// The broker subscription is only dropped once its last local
    /// subscriber is gone
    async fn unsubscribe(&self, topic: &str, id: SubscriptionId) -> DomainResult<()> {
        {
            let mut routes = self.routes.write().await;
            match routes.get_mut(topic) {
                Some(senders) => {
                    senders.retain(|s| s.id != id);
                    if !senders.is_empty() {
                        return Ok(());
                    }
                    routes.remove(topic);
                }
                None => return Ok(()),
            }
        }
        self.client.unsubscribe(topic).await.map_err(|e| {
            DomainError::Transport(anyhow::anyhow!(
                "Failed to unsubscribe from {}: {}",
                topic,
                e
            ))
        })
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

/// Parse broker URL in format mqtt://host:port or tcp://host:port or host:port
pub fn parse_broker_url(url: &str) -> DomainResult<(&str, u16)> {
    let url = url.trim_start_matches("mqtt://");
    let url = url.trim_start_matches("tcp://");

    let parts: Vec<&str> = url.split(':').collect();
    match *parts.as_slice() {
        [host] if !host.is_empty() => Ok((host, DEFAULT_MQTT_PORT)),
        [host, port] if !host.is_empty() => {
            let port = port.parse::<u16>().map_err(|_| {
                DomainError::Transport(anyhow::anyhow!("Invalid port in broker URL: {}", port))
            })?;
            Ok((host, port))
        }
        _ => Err(DomainError::Transport(anyhow::anyhow!(
            "Invalid broker URL format: {}",
            url
        ))),
    }
}

fn qos_from_level(level: u8) -> DomainResult<QoS> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(DomainError::Transport(anyhow::anyhow!(
            "Invalid MQTT QoS level: {}",
            other
        ))),
    }
}

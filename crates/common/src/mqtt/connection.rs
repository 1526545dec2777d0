use crate::bus::topic_matches;
use crate::domain::{DomainError, MessageEnvelope};
use crate::mqtt::client::Routes;
use rumqttc::{AsyncClient, Event, EventLoop, Packet, QoS};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Drives the MQTT event loop and fans incoming publishes out to subscribers
pub struct MqttConnection {
    eventloop: EventLoop,
    client: AsyncClient,
    routes: Routes,
    qos: QoS,
}

impl MqttConnection {
    pub(crate) fn new(eventloop: EventLoop, client: AsyncClient, routes: Routes, qos: QoS) -> Self {
        Self {
            eventloop,
            client,
            routes,
            qos,
        }
    }

    /// Poll the broker connection until cancelled.
    ///
    /// Connection errors are logged and retried after a short delay; the
    /// event loop reconnects on the next poll and every registered pattern is
    /// subscribed again once the broker acknowledges the connection.
    #[instrument(name = "mqtt_connection", skip_all)]
    pub async fn run(mut self, ctx: CancellationToken) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                _ = ctx.cancelled() => {
                    debug!("MQTT connection cancelled");
                    let _ = self.client.try_disconnect();
                    return Ok(());
                }
                event = self.eventloop.poll() => {
                    match event {
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            deliver(&self.routes, &publish.topic, &publish.payload).await;
                        }
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            info!("connected to MQTT broker");
                            self.resubscribe().await;
                        }
                        Ok(Event::Incoming(Packet::SubAck(_))) => {
                            debug!("subscription acknowledged");
                        }
                        Ok(_) => {}
                        Err(e) => {
                            error!(error = %e, "MQTT event loop error");
                            tokio::select! {
                                _ = ctx.cancelled() => return Ok(()),
                                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                            }
                        }
                    }
                }
            }
        }
    }

    async fn resubscribe(&mut self) {
        let patterns: Vec<String> = self.routes.read().await.keys().cloned().collect();
        for pattern in patterns {
            // try_subscribe: the event loop is not being polled while we are here
            if let Err(e) = self.client.try_subscribe(&pattern, self.qos) {
                warn!(topic = %pattern, error = %e, "failed to restore MQTT subscription");
            }
        }
    }
}

/// Decode an incoming publish and hand it to every matching subscriber.
///
/// A subscriber whose queue is full gets the message from a spawned task
/// instead, so a slow subscriber never stalls the connection.
pub(crate) async fn deliver(routes: &Routes, topic: &str, payload: &[u8]) {
    let decoded = MessageEnvelope::decode(payload).map_err(|e| match e {
        DomainError::EnvelopeDecode(reason) => reason,
        other => other.to_string(),
    });
    let mut closed = false;

    {
        let routes = routes.read().await;
        for sender in routes
            .iter()
            .filter(|(pattern, _)| topic_matches(pattern, topic))
            .flat_map(|(_, senders)| senders.iter())
        {
            if sender.messages.is_closed() {
                closed = true;
                continue;
            }
            match &decoded {
                Ok(envelope) => {
                    let mut envelope = envelope.clone();
                    envelope.received_topic = topic.to_string();
                    match sender.messages.try_send(envelope) {
                        Ok(()) => {}
                        Err(TrySendError::Full(envelope)) => {
                            error!(
                                topic = %topic,
                                request_id = %envelope.request_id,
                                "subscriber queue full, delivery deferred"
                            );
                            let queue = sender.messages.clone();
                            tokio::spawn(async move {
                                if let Err(e) = queue.send(envelope).await {
                                    warn!(request_id = %e.0.request_id, "subscriber gone before deferred delivery");
                                }
                            });
                        }
                        Err(TrySendError::Closed(_)) => closed = true,
                    }
                }
                Err(reason) => {
                    let err = DomainError::EnvelopeDecode(reason.clone());
                    if let Err(send_err) = sender.errors.try_send(err) {
                        warn!(topic = %topic, error = %send_err, "subscription error queue unavailable");
                    }
                }
            }
        }
    }

    if closed {
        routes.write().await.retain(|_, senders| {
            senders.retain(|s| !s.messages.is_closed());
            !senders.is_empty()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusSubscription, SUBSCRIPTION_QUEUE_CAPACITY};
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio::sync::RwLock;

    fn routes_with(patterns: &[&str]) -> (Routes, Vec<BusSubscription>) {
        let mut map = HashMap::new();
        let mut subscriptions = Vec::new();
        for pattern in patterns {
            let (sender, subscription) = BusSubscription::channel(*pattern);
            map.entry(pattern.to_string()).or_insert_with(Vec::new).push(sender);
            subscriptions.push(subscription);
        }
        (Arc::new(RwLock::new(map)), subscriptions)
    }

    #[tokio::test]
    async fn test_deliver_stamps_received_topic() {
        let (routes, mut subs) = routes_with(&["edgex/command/request/#", "other/#"]);
        let envelope = MessageEnvelope::for_request(b"{}".to_vec(), HashMap::new());

        deliver(&routes, "edgex/command/request/dev1/cmd1/get", &envelope.encode().unwrap()).await;

        let received = subs[0].messages.recv().await.unwrap();
        assert_eq!(received.received_topic, "edgex/command/request/dev1/cmd1/get");
        assert_eq!(received.request_id, envelope.request_id);
        assert!(subs[1].messages.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_deliver_reports_decode_errors() {
        let (routes, mut subs) = routes_with(&["edgex/#"]);

        deliver(&routes, "edgex/a", b"not an envelope").await;

        assert!(subs[0].messages.try_recv().is_err());
        assert!(matches!(
            subs[0].errors.recv().await,
            Some(DomainError::EnvelopeDecode(_))
        ));
    }

    #[tokio::test]
    async fn test_deliver_to_full_queue_is_deferred_not_dropped() {
        let (routes, mut subs) = routes_with(&["edgex/command/request/#"]);
        let topic = "edgex/command/request/dev1/cmd1/get";
        for _ in 0..SUBSCRIPTION_QUEUE_CAPACITY {
            let envelope = MessageEnvelope::for_request(Vec::new(), HashMap::new());
            deliver(&routes, topic, &envelope.encode().unwrap()).await;
        }

        let mut overflow = MessageEnvelope::for_request(Vec::new(), HashMap::new());
        overflow.request_id = "overflow".to_string();
        deliver(&routes, topic, &overflow.encode().unwrap()).await;

        let mut last = None;
        for _ in 0..=SUBSCRIPTION_QUEUE_CAPACITY {
            last = subs[0].messages.recv().await;
        }
        assert_eq!(last.unwrap().request_id, "overflow");
    }

    #[tokio::test]
    async fn test_deliver_prunes_closed_subscribers() {
        let (routes, subs) = routes_with(&["edgex/#"]);
        drop(subs);
        let envelope = MessageEnvelope::for_request(Vec::new(), HashMap::new());

        deliver(&routes, "edgex/a", &envelope.encode().unwrap()).await;

        assert!(routes.read().await.is_empty());
    }
}

use crate::bus::{build_topic, BusSubscription, MessageBus};
use crate::domain::{DomainError, DomainResult, MessageEnvelope};
use std::time::Duration;
use tracing::{debug, warn};

/// Request-reply over publish/subscribe.
///
/// Subscribes to `<response_topic_prefix>/<RequestID>` before publishing so a
/// fast responder cannot be missed, then waits for the first envelope on that
/// topic. Delivery errors on the response subscription are logged and the
/// wait continues. The response subscription is removed on every exit path.
pub async fn do_request<B: MessageBus + ?Sized>(
    bus: &B,
    envelope: &MessageEnvelope,
    request_topic: &str,
    response_topic_prefix: &str,
    timeout: Duration,
) -> DomainResult<MessageEnvelope> {
    let response_topic = build_topic(response_topic_prefix, &[envelope.request_id.as_str()]);
    let mut subscription = bus.subscribe(&response_topic).await?;

    let outcome = match bus.publish(envelope, request_topic).await {
        Ok(()) => {
            debug!(
                request_id = %envelope.request_id,
                request_topic = %request_topic,
                response_topic = %response_topic,
                "request published, waiting for response"
            );
            match tokio::time::timeout(timeout, await_response(&mut subscription)).await {
                Ok(result) => result,
                Err(_) => Err(DomainError::RequestTimeout {
                    topic: response_topic.clone(),
                    timeout,
                }),
            }
        }
        Err(e) => Err(e),
    };

    if let Err(e) = bus.unsubscribe(&response_topic, subscription.id).await {
        warn!(topic = %response_topic, error = %e, "failed to remove response subscription");
    }

    outcome
}

async fn await_response(subscription: &mut BusSubscription) -> DomainResult<MessageEnvelope> {
    loop {
        tokio::select! {
            message = subscription.messages.recv() => {
                return message.ok_or_else(|| {
                    DomainError::Transport(anyhow::anyhow!(
                        "response subscription on {} closed",
                        subscription.topic
                    ))
                });
            }
            Some(err) = subscription.errors.recv() => {
                warn!(topic = %subscription.topic, error = %err, "error on response subscription");
            }
        }
    }
}

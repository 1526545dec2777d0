use crate::domain::{
    parse_device_command_topic, resolve_device_service, trailing_command_segments,
    validate_reserved_query_params, CommandForwarder, ForwardOutcome, ForwardRequest, ReplyRoute,
    Transport,
};
use common::bus::build_topic;
use common::domain::{DeviceRegistry, DomainError, DomainResult, MessageEnvelope};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, instrument, warn};

/// How the response to a command request is addressed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseAddress {
    /// `<prefix>/<RequestID>`
    ByRequestId { prefix: String },
    /// `<prefix>/<device>/<command>/<method>`, echoing the request topic's
    /// last three segments
    ByCommandPath { prefix: String },
}

/// Transport specific addressing of one command-request subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandAddressing {
    pub transport: Transport,
    /// Segments of the subscribed pattern before its trailing `#`
    pub request_prefix_len: usize,
    pub response: ResponseAddress,
}

impl CommandAddressing {
    /// Topic the response to `envelope` is published on, when one can be computed
    pub fn response_topic(&self, envelope: &MessageEnvelope) -> DomainResult<String> {
        match &self.response {
            ResponseAddress::ByRequestId { prefix } => {
                Ok(build_topic(prefix, &[envelope.request_id.as_str()]))
            }
            ResponseAddress::ByCommandPath { prefix } => {
                let segments =
                    trailing_command_segments(&envelope.received_topic, self.request_prefix_len)?;
                Ok(build_topic(prefix, &segments))
            }
        }
    }
}

/// Internal bus topics device services listen and reply on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceServiceTopics {
    /// `<base>/<device-publish-marker>`; requests go to `<prefix>/<service>/<device>/<command>/<method>`
    pub request_topic_prefix: String,
    /// `<base>/<response-marker>`; replies arrive on `<prefix>/<service>/<RequestID>`
    pub response_topic_prefix: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// Publish `envelope` on `topic` over the transport the request came from
    Respond {
        envelope: MessageEnvelope,
        topic: String,
    },
    /// Forwarded; the reply is routed by the response relay
    Deferred,
    /// Nothing is published
    Dropped,
}

/// Validates get/set command requests and forwards them to the owning device service
pub struct CommandRequestDispatcher {
    registry: Arc<dyn DeviceRegistry>,
    forwarder: Arc<dyn CommandForwarder>,
    topics: DeviceServiceTopics,
    timeout: Duration,
}

impl CommandRequestDispatcher {
    pub fn new(
        registry: Arc<dyn DeviceRegistry>,
        forwarder: Arc<dyn CommandForwarder>,
        topics: DeviceServiceTopics,
        timeout: Duration,
    ) -> Self {
        Self {
            registry,
            forwarder,
            topics,
            timeout,
        }
    }

    /// Run one command request through validation, resolution and forwarding.
    ///
    /// `envelope.received_topic` must hold the topic the request arrived on.
    #[instrument(
        name = "dispatch_command",
        skip_all,
        fields(
            request_id = %envelope.request_id,
            correlation_id = %envelope.correlation_id,
            topic = %envelope.received_topic,
        )
    )]
    pub async fn dispatch(
        &self,
        envelope: MessageEnvelope,
        addressing: &CommandAddressing,
    ) -> DispatchOutcome {
        if !envelope.has_request_id() {
            error!(error = %DomainError::MissingRequestId, "dropping command request");
            return DispatchOutcome::Dropped;
        }

        let response_topic = match addressing.response_topic(&envelope) {
            Ok(topic) => topic,
            Err(e) => {
                error!(error = %e, "cannot compute response topic");
                warn!("not publishing error message back due to insufficient information on response topic");
                return DispatchOutcome::Dropped;
            }
        };

        let forward_request = match self.prepare(&envelope, addressing, &response_topic).await {
            Ok(request) => request,
            Err(e) => return error_response(&envelope, response_topic, e.to_string()),
        };
        let request_topic = forward_request.request_topic.clone();

        match self.forwarder.forward(forward_request).await {
            Ok(ForwardOutcome::Replied(reply)) => {
                debug!(request_topic = %request_topic, error_code = reply.error_code, "device service replied");
                let mut response = MessageEnvelope::for_response(
                    reply.payload,
                    &envelope.request_id,
                    &envelope.correlation_id,
                    &reply.content_type,
                );
                response.error_code = reply.error_code;
                response.received_topic = response_topic.clone();
                DispatchOutcome::Respond {
                    envelope: response,
                    topic: response_topic,
                }
            }
            Ok(ForwardOutcome::Deferred) => DispatchOutcome::Deferred,
            Err(e) => match addressing.transport {
                Transport::External => error_response(
                    &envelope,
                    response_topic,
                    format!("failed to send device command request with internal message bus: {}", e),
                ),
                // Internal callers get no reply when the device service exchange fails.
                Transport::Internal => {
                    error!(
                        request_topic = %request_topic,
                        error = %e,
                        "device command request failed, no response published on the internal bus"
                    );
                    DispatchOutcome::Dropped
                }
            },
        }
    }

    /// Everything up to the forward: topic parsing, reserved parameter
    /// validation and device service resolution
    async fn prepare(
        &self,
        envelope: &MessageEnvelope,
        addressing: &CommandAddressing,
        response_topic: &str,
    ) -> DomainResult<ForwardRequest> {
        let command = parse_device_command_topic(&envelope.received_topic, addressing.request_prefix_len)?;
        validate_reserved_query_params(&envelope.query_params)?;

        let service = resolve_device_service(self.registry.as_ref(), &command.device_name).await?;

        let escaped_command = command.escaped_command_name();
        let request_topic = build_topic(
            &self.topics.request_topic_prefix,
            &[
                service.service_name.as_str(),
                command.device_name.as_str(),
                escaped_command.as_str(),
                command.method.as_str(),
            ],
        );
        let response_topic_prefix =
            build_topic(&self.topics.response_topic_prefix, &[service.service_name.as_str()]);

        debug!(
            device_name = %command.device_name,
            command_name = %command.command_name,
            method = %command.method,
            request_topic = %request_topic,
            "forwarding command request to device service"
        );

        Ok(ForwardRequest {
            envelope: envelope.clone(),
            request_topic,
            response_topic_prefix,
            timeout: self.timeout,
            reply_to: ReplyRoute {
                topic: response_topic.to_string(),
                transport: addressing.transport,
            },
        })
    }
}

fn error_response(request: &MessageEnvelope, topic: String, message: String) -> DispatchOutcome {
    error!(topic = %topic, error = %message, "command request failed, publishing error response");
    let mut envelope =
        MessageEnvelope::with_error(&request.request_id, &request.correlation_id, message);
    envelope.received_topic = topic.clone();
    DispatchOutcome::Respond { envelope, topic }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::MockCommandForwarder;
    use common::domain::{Device, DeviceService, DomainError, MockDeviceRegistry};
    use std::collections::HashMap;

    const TIMEOUT: Duration = Duration::from_millis(250);

    fn topics() -> DeviceServiceTopics {
        DeviceServiceTopics {
            request_topic_prefix: "edgex/d".to_string(),
            response_topic_prefix: "edgex/response".to_string(),
        }
    }

    fn internal() -> CommandAddressing {
        CommandAddressing {
            transport: Transport::Internal,
            request_prefix_len: 2, // edgex/m/#
            response: ResponseAddress::ByRequestId {
                prefix: "edgex/response/core-command".to_string(),
            },
        }
    }

    fn external() -> CommandAddressing {
        CommandAddressing {
            transport: Transport::External,
            request_prefix_len: 3, // edgex/command/request/#
            response: ResponseAddress::ByCommandPath {
                prefix: "edgex/command/response".to_string(),
            },
        }
    }

    fn request(request_id: &str, topic: &str) -> MessageEnvelope {
        let mut envelope = MessageEnvelope::for_request(br#"{"x":1}"#.to_vec(), HashMap::new());
        envelope.request_id = request_id.to_string();
        envelope.correlation_id = "c1".to_string();
        envelope.received_topic = topic.to_string();
        envelope
    }

    fn resolving_registry() -> MockDeviceRegistry {
        let mut registry = MockDeviceRegistry::new();
        registry.expect_device_by_name().returning(|name| {
            Ok(Device {
                name: name.to_string(),
                service_name: "svcA".to_string(),
                profile_name: "p1".to_string(),
            })
        });
        registry.expect_device_service_by_name().returning(|name| {
            Ok(DeviceService {
                name: name.to_string(),
                base_address: "http://svc-a:59900".to_string(),
            })
        });
        registry
    }

    fn untouched_registry() -> MockDeviceRegistry {
        let mut registry = MockDeviceRegistry::new();
        registry.expect_device_by_name().times(0);
        registry.expect_device_service_by_name().times(0);
        registry
    }

    fn idle_forwarder() -> MockCommandForwarder {
        let mut forwarder = MockCommandForwarder::new();
        forwarder.expect_forward().times(0);
        forwarder
    }

    fn dispatcher(registry: MockDeviceRegistry, forwarder: MockCommandForwarder) -> CommandRequestDispatcher {
        CommandRequestDispatcher::new(Arc::new(registry), Arc::new(forwarder), topics(), TIMEOUT)
    }

    fn expect_error(outcome: DispatchOutcome) -> (MessageEnvelope, String) {
        match outcome {
            DispatchOutcome::Respond { envelope, topic } if envelope.is_error() => (envelope, topic),
            other => panic!("expected error response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_request_id_dropped_on_both_transports() {
        for (addressing, topic) in [
            (internal(), "edgex/m/svcA/dev1/cmd1/get"),
            (external(), "edgex/command/request/dev1/cmd1/get"),
        ] {
            let dispatcher = dispatcher(untouched_registry(), idle_forwarder());
            let outcome = dispatcher.dispatch(request("  ", topic), &addressing).await;
            assert_eq!(outcome, DispatchOutcome::Dropped);
        }
    }

    #[tokio::test]
    async fn test_internal_request_forwarded_and_reply_republished() {
        let mut forwarder = MockCommandForwarder::new();
        forwarder
            .expect_forward()
            .withf(|req: &ForwardRequest| {
                req.request_topic == "edgex/d/svcA/dev1/cmd1/get"
                    && req.response_topic_prefix == "edgex/response/svcA"
                    && req.timeout == TIMEOUT
                    && req.envelope.request_id == "r1"
                    && req.reply_to.transport == Transport::Internal
            })
            .times(1)
            .returning(|req| {
                Ok(ForwardOutcome::Replied(MessageEnvelope::for_response(
                    b"reading-payload".to_vec(),
                    &req.envelope.request_id,
                    &req.envelope.correlation_id,
                    "application/json",
                )))
            });

        let outcome = dispatcher(resolving_registry(), forwarder)
            .dispatch(request("r1", "edgex/m/svcA/dev1/cmd1/get"), &internal())
            .await;

        match outcome {
            DispatchOutcome::Respond { envelope, topic } => {
                assert_eq!(topic, "edgex/response/core-command/r1");
                assert_eq!(envelope.received_topic, topic);
                assert_eq!(envelope.payload, b"reading-payload");
                assert_eq!(envelope.request_id, "r1");
                assert_eq!(envelope.correlation_id, "c1");
                assert!(!envelope.is_error());
            }
            other => panic!("expected response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_topic_service_segment_is_not_trusted() {
        let mut forwarder = MockCommandForwarder::new();
        forwarder
            .expect_forward()
            .withf(|req: &ForwardRequest| req.request_topic == "edgex/d/svcA/dev1/cmd1/get")
            .times(1)
            .returning(|_| Ok(ForwardOutcome::Deferred));

        let outcome = dispatcher(resolving_registry(), forwarder)
            .dispatch(request("r1", "edgex/m/spoofed/dev1/cmd1/get"), &internal())
            .await;

        assert_eq!(outcome, DispatchOutcome::Deferred);
    }

    #[tokio::test]
    async fn test_unknown_method_produces_error_envelope() {
        let outcome = dispatcher(untouched_registry(), idle_forwarder())
            .dispatch(request("r1", "edgex/m/svcA/dev1/cmd1/delete"), &internal())
            .await;

        let (envelope, topic) = expect_error(outcome);
        assert_eq!(topic, "edgex/response/core-command/r1");
        assert!(envelope.payload_text().contains("unknown request method"));
        assert_eq!(envelope.request_id, "r1");
    }

    #[tokio::test]
    async fn test_invalid_reserved_parameter_rejected_before_lookup() {
        let mut envelope = request("r1", "edgex/m/svcA/dev1/cmd1/get");
        envelope
            .query_params
            .insert("ds-returnevent".to_string(), "maybe".to_string());

        let outcome = dispatcher(untouched_registry(), idle_forwarder())
            .dispatch(envelope, &internal())
            .await;

        let (envelope, _) = expect_error(outcome);
        assert!(envelope.payload_text().contains("ds-returnevent"));
    }

    #[tokio::test]
    async fn test_unknown_device_produces_error_envelope() {
        let mut registry = MockDeviceRegistry::new();
        registry
            .expect_device_by_name()
            .returning(|name| Err(DomainError::DeviceNotFound(name.to_string())));

        let outcome = dispatcher(registry, idle_forwarder())
            .dispatch(request("r1", "edgex/command/request/ghost/cmd1/get"), &external())
            .await;

        let (envelope, topic) = expect_error(outcome);
        assert_eq!(topic, "edgex/command/response/ghost/cmd1/get");
        assert!(envelope
            .payload_text()
            .contains("failed to get Device by name ghost"));
    }

    #[tokio::test]
    async fn test_forward_failure_is_reported_only_on_external_path() {
        fn timing_out_forwarder() -> MockCommandForwarder {
            let mut forwarder = MockCommandForwarder::new();
            forwarder.expect_forward().times(1).returning(|req| {
                Err(DomainError::RequestTimeout {
                    topic: req.response_topic_prefix.clone(),
                    timeout: req.timeout,
                })
            });
            forwarder
        }

        let internal_outcome = dispatcher(resolving_registry(), timing_out_forwarder())
            .dispatch(request("r1", "edgex/m/svcA/dev1/cmd1/get"), &internal())
            .await;
        assert_eq!(internal_outcome, DispatchOutcome::Dropped);

        let external_outcome = dispatcher(resolving_registry(), timing_out_forwarder())
            .dispatch(request("r2", "edgex/command/request/dev1/cmd1/get"), &external())
            .await;
        let (envelope, topic) = expect_error(external_outcome);
        assert_eq!(topic, "edgex/command/response/dev1/cmd1/get");
        assert!(envelope.payload_text().contains("timed out"));
        assert_eq!(envelope.request_id, "r2");
    }

    #[tokio::test]
    async fn test_external_topic_too_short_is_dropped() {
        let outcome = dispatcher(untouched_registry(), idle_forwarder())
            .dispatch(request("r1", "edgex/command/request/dev1/cmd1"), &external())
            .await;

        assert_eq!(outcome, DispatchOutcome::Dropped);
    }

    #[tokio::test]
    async fn test_external_unknown_method_answered_on_request_path() {
        let outcome = dispatcher(untouched_registry(), idle_forwarder())
            .dispatch(request("r1", "edgex/command/request/dev1/cmd1/patch"), &external())
            .await;

        let (_, topic) = expect_error(outcome);
        assert_eq!(topic, "edgex/command/response/dev1/cmd1/patch");
    }

    #[tokio::test]
    async fn test_reply_error_code_and_content_type_copied() {
        let mut forwarder = MockCommandForwarder::new();
        forwarder.expect_forward().returning(|req| {
            Ok(ForwardOutcome::Replied(MessageEnvelope::with_error(
                &req.envelope.request_id,
                &req.envelope.correlation_id,
                "device busy",
            )))
        });

        let outcome = dispatcher(resolving_registry(), forwarder)
            .dispatch(request("r1", "edgex/m/svcA/dev1/cmd1/set"), &internal())
            .await;

        let (envelope, _) = expect_error(outcome);
        assert_eq!(envelope.payload_text(), "device busy");
        assert_eq!(envelope.content_type, "text/plain");
    }

    #[tokio::test]
    async fn test_escaped_command_name_forwarded_escaped() {
        let mut forwarder = MockCommandForwarder::new();
        forwarder
            .expect_forward()
            .withf(|req: &ForwardRequest| req.request_topic == "edgex/d/svcA/dev1/Switch%20Button/set")
            .times(1)
            .returning(|_| Ok(ForwardOutcome::Deferred));

        let outcome = dispatcher(resolving_registry(), forwarder)
            .dispatch(request("r1", "edgex/m/svcA/dev1/Switch%20Button/SET"), &internal())
            .await;

        assert_eq!(outcome, DispatchOutcome::Deferred);
    }
}

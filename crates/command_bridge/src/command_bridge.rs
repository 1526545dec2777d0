use crate::bridge::{
    ExternalBridge, ExternalBridgeConfig, InternalBridge, InternalBridgeConfig, ResponseRelay,
    SubscriptionProcess,
};
use crate::domain::{
    CommandCatalog, CommandForwarder, CommandQueryDispatcher, CommandRequestDispatcher,
    CorrelationRegistry, DeviceServiceTopics, RegistryForwarder, RequestReplyForwarder,
};
use anyhow::Context;
use common::bus::{build_topic, MessageBus};
use common::domain::DeviceRegistry;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub type RunnerProcess = Box<
    dyn FnOnce(CancellationToken) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>
        + Send,
>;

/// How forwarded commands are matched with device-service replies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardingMode {
    /// Bounded request-reply on the internal bus
    RequestReply,
    /// Publish and record the reply route; a relay process routes replies
    CorrelationRegistry { capacity: usize, max_age: Duration },
}

impl FromStr for ForwardingMode {
    type Err = anyhow::Error;

    /// Registry limits start at their defaults
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "request_reply" => Ok(ForwardingMode::RequestReply),
            "correlation_registry" => Ok(ForwardingMode::CorrelationRegistry {
                capacity: crate::domain::DEFAULT_CORRELATION_CAPACITY,
                max_age: crate::domain::DEFAULT_CORRELATION_MAX_AGE,
            }),
            other => anyhow::bail!(
                "unknown forwarding mode '{}', expected request_reply or correlation_registry",
                other
            ),
        }
    }
}

/// Internal bus topics, each relative to `base_topic`
#[derive(Debug, Clone)]
pub struct CommandBridgeConfig {
    pub base_topic: String,
    pub command_request_topic: String,
    pub command_query_request_topic: String,
    pub device_command_request_topic_prefix: String,
    pub response_topic_prefix: String,
    pub service_key: String,
    pub request_timeout: Duration,
    /// `Url` advertised on every core command
    pub service_url: String,
    pub forwarding_mode: ForwardingMode,
    /// Set when the external broker is enabled
    pub external: Option<ExternalBridgeConfig>,
}

impl CommandBridgeConfig {
    fn internal_topic(&self, relative: &str) -> String {
        build_topic(&self.base_topic, &[relative])
    }

    /// `<base>/<response>`
    pub fn response_topic_root(&self) -> String {
        self.internal_topic(&self.response_topic_prefix)
    }

    /// `<base>/<response>/<service key>`
    pub fn own_response_topic_prefix(&self) -> String {
        build_topic(&self.response_topic_root(), &[self.service_key.as_str()])
    }

    pub fn internal_bridge_config(&self) -> InternalBridgeConfig {
        InternalBridgeConfig {
            command_request_topic: self.internal_topic(&self.command_request_topic),
            command_query_request_topic: self.internal_topic(&self.command_query_request_topic),
            response_topic_prefix: self.own_response_topic_prefix(),
        }
    }

    pub fn device_service_topics(&self) -> DeviceServiceTopics {
        DeviceServiceTopics {
            request_topic_prefix: self.internal_topic(&self.device_command_request_topic_prefix),
            response_topic_prefix: self.response_topic_root(),
        }
    }
}

/// Core command bridging: wires the dispatchers to the internal bus and,
/// when configured, the external broker
pub struct CommandBridge {
    processes: Vec<SubscriptionProcess>,
}

impl CommandBridge {
    pub fn new(
        internal_bus: Arc<dyn MessageBus>,
        external_bus: Option<Arc<dyn MessageBus>>,
        registry: Arc<dyn DeviceRegistry>,
        config: CommandBridgeConfig,
    ) -> anyhow::Result<Self> {
        info!("initializing command bridge");

        let catalog = Arc::new(CommandCatalog::new(registry.clone(), &config.service_url));
        let query_dispatcher = Arc::new(CommandQueryDispatcher::new(catalog));

        let (forwarder, correlation): (Arc<dyn CommandForwarder>, Option<Arc<CorrelationRegistry>>) =
            match config.forwarding_mode {
                ForwardingMode::RequestReply => {
                    (Arc::new(RequestReplyForwarder::new(internal_bus.clone())), None)
                }
                ForwardingMode::CorrelationRegistry { capacity, max_age } => {
                    let correlation = Arc::new(CorrelationRegistry::new(capacity, max_age));
                    (
                        Arc::new(RegistryForwarder::new(
                            internal_bus.clone(),
                            correlation.clone(),
                        )),
                        Some(correlation),
                    )
                }
            };

        let request_dispatcher = Arc::new(CommandRequestDispatcher::new(
            registry,
            forwarder,
            config.device_service_topics(),
            config.request_timeout,
        ));

        let mut processes = InternalBridge::new(
            internal_bus.clone(),
            request_dispatcher.clone(),
            query_dispatcher.clone(),
            config.internal_bridge_config(),
        )
        .into_processes();

        match (&config.external, &external_bus) {
            (Some(external_config), Some(bus)) => {
                processes.extend(
                    ExternalBridge::new(
                        bus.clone(),
                        request_dispatcher,
                        query_dispatcher,
                        external_config.clone(),
                    )
                    .into_processes(),
                );
            }
            (Some(_), None) => {
                return Err(anyhow::anyhow!(
                    "external bridge is configured but no external broker was provided"
                ))
            }
            (None, _) => info!("external broker disabled, serving internal bus only"),
        }

        if let Some(correlation) = correlation {
            processes.push(
                ResponseRelay::new(
                    internal_bus,
                    external_bus,
                    correlation,
                    &config.response_topic_root(),
                    &config.own_response_topic_prefix(),
                )
                .into_process(),
            );
        }

        for process in &processes {
            info!(process = %process.name, topic = %process.topic(), "command bridge process ready");
        }

        Ok(Self { processes })
    }

    pub fn process_names(&self) -> Vec<&str> {
        self.processes.iter().map(|p| p.name.as_str()).collect()
    }

    pub fn into_runner_processes(self) -> Vec<(String, RunnerProcess)> {
        self.processes
            .into_iter()
            .map(|process| {
                let name = process.name.clone();
                let runner: RunnerProcess = Box::new(move |ctx| {
                    Box::pin(async move {
                        let name = process.name.clone();
                        process
                            .run(ctx)
                            .await
                            .with_context(|| format!("{} stopped", name))
                    })
                });
                (name, runner)
            })
            .collect()
    }
}

use anyhow::Context;
use command_bridge::bridge::ExternalBridgeConfig;
use command_bridge::{CommandBridgeConfig, ForwardingMode};
use common::mqtt::MqttConfig;
use common::telemetry::{LogFormat, TelemetryConfig};
use config::{Config, ConfigError, Environment};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServiceConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Console log format (json, pretty)
    #[serde(default = "default_log_format")]
    pub log_format: String,

    // OpenTelemetry configuration
    #[serde(default)]
    pub otel_enabled: bool,

    /// OTLP gRPC endpoint
    #[serde(default = "default_otel_endpoint")]
    pub otel_endpoint: String,

    #[serde(default = "default_otel_service_name")]
    pub otel_service_name: String,

    // Internal bus (NATS)
    #[serde(default = "default_nats_url")]
    pub nats_url: String,

    /// Startup timeout for connections in seconds
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,

    // Internal topics, relative to base_topic
    #[serde(default = "default_base_topic")]
    pub base_topic: String,

    #[serde(default = "default_command_request_topic")]
    pub command_request_topic: String,

    #[serde(default = "default_command_query_request_topic")]
    pub command_query_request_topic: String,

    #[serde(default = "default_device_command_request_topic_prefix")]
    pub device_command_request_topic_prefix: String,

    #[serde(default = "default_response_topic_prefix")]
    pub response_topic_prefix: String,

    /// Service key, used as the last segment of this service's response prefix
    #[serde(default = "default_service_key")]
    pub service_key: String,

    /// How long to wait for a device service reply
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    // Metadata registry
    #[serde(default = "default_metadata_url")]
    pub metadata_url: String,

    /// Base URL advertised in every core command
    #[serde(default = "default_service_url")]
    pub service_url: String,

    // External broker (MQTT)
    #[serde(default)]
    pub external_mqtt_enabled: bool,

    #[serde(default = "default_external_mqtt_url")]
    pub external_mqtt_url: String,

    #[serde(default = "default_external_mqtt_client_id")]
    pub external_mqtt_client_id: String,

    #[serde(default)]
    pub external_mqtt_qos: u8,

    #[serde(default = "default_external_mqtt_retain")]
    pub external_mqtt_retain: bool,

    #[serde(default = "default_external_mqtt_keep_alive_secs")]
    pub external_mqtt_keep_alive_secs: u64,

    #[serde(default = "default_external_command_request_topic")]
    pub external_command_request_topic: String,

    #[serde(default = "default_external_command_response_topic_prefix")]
    pub external_command_response_topic_prefix: String,

    #[serde(default = "default_external_query_request_topic")]
    pub external_query_request_topic: String,

    #[serde(default = "default_external_query_response_topic")]
    pub external_query_response_topic: String,

    // Command forwarding
    /// request_reply or correlation_registry
    #[serde(default = "default_forwarding_mode")]
    pub forwarding_mode: String,

    #[serde(default = "default_correlation_capacity")]
    pub correlation_capacity: usize,

    #[serde(default = "default_correlation_max_age_secs")]
    pub correlation_max_age_secs: u64,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_otel_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_otel_service_name() -> String {
    "core-command".to_string()
}

fn default_nats_url() -> String {
    "nats://localhost:4222".to_string()
}

fn default_startup_timeout_secs() -> u64 {
    30
}

fn default_base_topic() -> String {
    "edgex".to_string()
}

fn default_command_request_topic() -> String {
    "core/command/request/#".to_string()
}

fn default_command_query_request_topic() -> String {
    "core/commandquery/request/#".to_string()
}

fn default_device_command_request_topic_prefix() -> String {
    "device/command/request".to_string()
}

fn default_response_topic_prefix() -> String {
    "response".to_string()
}

fn default_service_key() -> String {
    "core-command".to_string()
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_metadata_url() -> String {
    "http://localhost:59881".to_string()
}

fn default_service_url() -> String {
    "http://localhost:59882".to_string()
}

fn default_external_mqtt_url() -> String {
    "tcp://localhost:1883".to_string()
}

fn default_external_mqtt_client_id() -> String {
    "core-command".to_string()
}

fn default_external_mqtt_retain() -> bool {
    true
}

fn default_external_mqtt_keep_alive_secs() -> u64 {
    30
}

fn default_external_command_request_topic() -> String {
    "edgex/command/request/#".to_string()
}

fn default_external_command_response_topic_prefix() -> String {
    "edgex/command/response".to_string()
}

fn default_external_query_request_topic() -> String {
    "edgex/commandquery/request/#".to_string()
}

fn default_external_query_response_topic() -> String {
    "edgex/commandquery/response".to_string()
}

fn default_forwarding_mode() -> String {
    "request_reply".to_string()
}

fn default_correlation_capacity() -> usize {
    10_000
}

fn default_correlation_max_age_secs() -> u64 {
    300
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(Environment::with_prefix("CORE_COMMAND"))
            .build()?
            .try_deserialize()
    }

    /// Reject settings that would only fail once traffic arrives
    pub fn validate(&self) -> anyhow::Result<()> {
        self.forwarding_mode()?;
        self.log_format
            .parse::<LogFormat>()
            .context("invalid log_format")?;
        if self.external_mqtt_qos > 2 {
            anyhow::bail!(
                "invalid external_mqtt_qos {}, expected 0, 1 or 2",
                self.external_mqtt_qos
            );
        }
        if self.request_timeout_ms == 0 {
            anyhow::bail!("request_timeout_ms must be greater than zero");
        }
        Ok(())
    }

    pub fn forwarding_mode(&self) -> anyhow::Result<ForwardingMode> {
        match self.forwarding_mode.parse::<ForwardingMode>()? {
            ForwardingMode::RequestReply => Ok(ForwardingMode::RequestReply),
            ForwardingMode::CorrelationRegistry { .. } => Ok(ForwardingMode::CorrelationRegistry {
                capacity: self.correlation_capacity,
                max_age: Duration::from_secs(self.correlation_max_age_secs),
            }),
        }
    }

    pub fn telemetry_config(&self) -> anyhow::Result<TelemetryConfig> {
        Ok(TelemetryConfig {
            service_name: self.otel_service_name.clone(),
            otel_endpoint: self.otel_endpoint.clone(),
            otel_enabled: self.otel_enabled,
            log_level: self.log_level.clone(),
            log_format: self.log_format.parse()?,
        })
    }

    pub fn bridge_config(&self) -> anyhow::Result<CommandBridgeConfig> {
        let external = self.external_mqtt_enabled.then(|| ExternalBridgeConfig {
            command_request_topic: self.external_command_request_topic.clone(),
            command_response_topic_prefix: self.external_command_response_topic_prefix.clone(),
            query_request_topic: self.external_query_request_topic.clone(),
            query_response_topic: self.external_query_response_topic.clone(),
        });

        Ok(CommandBridgeConfig {
            base_topic: self.base_topic.clone(),
            command_request_topic: self.command_request_topic.clone(),
            command_query_request_topic: self.command_query_request_topic.clone(),
            device_command_request_topic_prefix: self.device_command_request_topic_prefix.clone(),
            response_topic_prefix: self.response_topic_prefix.clone(),
            service_key: self.service_key.clone(),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            service_url: self.service_url.clone(),
            forwarding_mode: self.forwarding_mode()?,
            external,
        })
    }

    pub fn mqtt_config(&self) -> MqttConfig {
        MqttConfig {
            url: self.external_mqtt_url.clone(),
            client_id: self.external_mqtt_client_id.clone(),
            qos: self.external_mqtt_qos,
            retain: self.external_mqtt_retain,
            keep_alive: Duration::from_secs(self.external_mqtt_keep_alive_secs),
        }
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Mutex to ensure tests run serially and don't interfere with each other
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    const VARS: &[&str] = &[
        "CORE_COMMAND_LOG_LEVEL",
        "CORE_COMMAND_FORWARDING_MODE",
        "CORE_COMMAND_EXTERNAL_MQTT_QOS",
        "CORE_COMMAND_EXTERNAL_MQTT_ENABLED",
        "CORE_COMMAND_REQUEST_TIMEOUT_MS",
        "CORE_COMMAND_CORRELATION_CAPACITY",
    ];

    fn clear_env() {
        for var in VARS {
            // SAFETY: Test runs with mutex lock to prevent concurrent env access
            unsafe {
                std::env::remove_var(var);
            }
        }
    }

    fn set_env(var: &str, value: &str) {
        // SAFETY: Test runs with mutex lock to prevent concurrent env access
        unsafe {
            std::env::set_var(var, value);
        }
    }

    #[test]
    fn test_default_config() {
        let _lock = TEST_LOCK.lock().unwrap();
        clear_env();

        let config = ServiceConfig::from_env().unwrap();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.base_topic, "edgex");
        assert_eq!(config.request_timeout_ms, 30_000);
        assert!(!config.external_mqtt_enabled);
        assert!(config.validate().is_ok());

        let bridge = config.bridge_config().unwrap();
        assert_eq!(bridge.forwarding_mode, ForwardingMode::RequestReply);
        assert!(bridge.external.is_none());
        assert_eq!(
            bridge.internal_bridge_config().response_topic_prefix,
            "edgex/response/core-command"
        );
    }

    #[test]
    fn test_custom_config() {
        let _lock = TEST_LOCK.lock().unwrap();
        clear_env();
        set_env("CORE_COMMAND_LOG_LEVEL", "debug");
        set_env("CORE_COMMAND_FORWARDING_MODE", "correlation_registry");
        set_env("CORE_COMMAND_CORRELATION_CAPACITY", "64");
        set_env("CORE_COMMAND_EXTERNAL_MQTT_ENABLED", "true");
        set_env("CORE_COMMAND_REQUEST_TIMEOUT_MS", "1500");

        let config = ServiceConfig::from_env().unwrap();
        assert_eq!(config.log_level, "debug");
        assert!(config.validate().is_ok());

        let bridge = config.bridge_config().unwrap();
        assert_eq!(bridge.request_timeout, Duration::from_millis(1500));
        assert_eq!(
            bridge.forwarding_mode,
            ForwardingMode::CorrelationRegistry {
                capacity: 64,
                max_age: Duration::from_secs(300),
            }
        );
        assert_eq!(
            bridge.external.unwrap().command_response_topic_prefix,
            "edgex/command/response"
        );

        clear_env();
    }

    #[test]
    fn test_invalid_settings_fail_validation() {
        let _lock = TEST_LOCK.lock().unwrap();
        clear_env();

        set_env("CORE_COMMAND_FORWARDING_MODE", "broadcast");
        let config = ServiceConfig::from_env().unwrap();
        assert!(config.validate().is_err());

        clear_env();
        set_env("CORE_COMMAND_EXTERNAL_MQTT_QOS", "3");
        let config = ServiceConfig::from_env().unwrap();
        assert!(config.validate().is_err());

        clear_env();
    }
}

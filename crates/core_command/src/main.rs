mod config;

use anyhow::Context;
use command_bridge::CommandBridge;
use common::bus::MessageBus;
use common::metadata::MetadataHttpClient;
use common::mqtt::{MqttConnection, MqttMessageBus};
use common::nats::NatsMessageBus;
use common::telemetry::{init_telemetry, shutdown_telemetry, TelemetryProviders};
use config::ServiceConfig;
use core_command_runner::Runner;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

#[tokio::main]
async fn main() {
    let config = match ServiceConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {:#}", e);
        std::process::exit(1);
    }

    let telemetry_providers: Option<TelemetryProviders> =
        match config.telemetry_config().and_then(|cfg| init_telemetry(&cfg)) {
            Ok(providers) => providers,
            Err(e) => {
                eprintln!("Failed to initialize telemetry: {:#}", e);
                std::process::exit(1);
            }
        };

    info!(
        otel_enabled = config.otel_enabled,
        external_mqtt_enabled = config.external_mqtt_enabled,
        forwarding_mode = %config.forwarding_mode,
        "Starting core-command service"
    );
    debug!("Configuration: {:?}", config);

    let dependencies = match initialize_dependencies(&config).await {
        Ok(deps) => deps,
        Err(e) => {
            error!(error = %format!("{:#}", e), "Failed to initialize dependencies");
            shutdown_telemetry(telemetry_providers);
            std::process::exit(1);
        }
    };

    let bridge_config = match config.bridge_config() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %format!("{:#}", e), "Invalid command bridge configuration");
            std::process::exit(1);
        }
    };

    let command_bridge = match CommandBridge::new(
        dependencies.nats.clone(),
        dependencies
            .mqtt
            .as_ref()
            .map(|mqtt| mqtt.clone() as Arc<dyn MessageBus>),
        Arc::new(dependencies.metadata),
        bridge_config,
    ) {
        Ok(bridge) => bridge,
        Err(e) => {
            error!(error = %format!("{:#}", e), "Failed to initialize command bridge");
            std::process::exit(1);
        }
    };

    let mut runner = Runner::new();

    // The broker connection must be polled for the external bridge to see traffic
    if let Some(connection) = dependencies.mqtt_connection {
        runner = runner.with_app_process("mqtt_connection", move |ctx| connection.run(ctx));
    }

    for (name, process) in command_bridge.into_runner_processes() {
        runner = runner.with_named_process(name, process);
    }

    runner = runner
        .with_closer({
            let nats = dependencies.nats;
            let mqtt = dependencies.mqtt;
            move || async move {
                info!("Running cleanup tasks...");
                if let Some(mqtt) = mqtt {
                    if let Err(e) = mqtt.disconnect().await {
                        error!(error = %e, "Failed to disconnect from MQTT broker");
                    }
                }
                let result = nats.close().await;

                info!("Cleanup complete");
                // Shutdown telemetry and flush pending traces and logs
                shutdown_telemetry(telemetry_providers);
                result
            }
        })
        .with_closer_timeout(Duration::from_secs(10));

    runner.run().await;
}

struct Dependencies {
    nats: Arc<NatsMessageBus>,
    mqtt: Option<Arc<MqttMessageBus>>,
    mqtt_connection: Option<MqttConnection>,
    metadata: MetadataHttpClient,
}

async fn initialize_dependencies(config: &ServiceConfig) -> anyhow::Result<Dependencies> {
    info!("Initializing NATS...");
    let nats = Arc::new(NatsMessageBus::connect(&config.nats_url, config.startup_timeout()).await?);

    info!(url = %config.metadata_url, "Initializing metadata client...");
    let metadata = MetadataHttpClient::new(&config.metadata_url, config.startup_timeout())
        .context("Failed to build metadata client")?;

    let (mqtt, mqtt_connection) = if config.external_mqtt_enabled {
        info!(url = %config.external_mqtt_url, "Initializing external MQTT broker...");
        let (bus, connection) = MqttMessageBus::connect(&config.mqtt_config())
            .context("Failed to configure external MQTT broker")?;
        (Some(Arc::new(bus)), Some(connection))
    } else {
        (None, None)
    };

    Ok(Dependencies {
        nats,
        mqtt,
        mqtt_connection,
        metadata,
    })
}

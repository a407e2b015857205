mod config;

use common::memory::InMemoryStore;
use common::postgres::PostgresClient;
use common::telemetry::{init_telemetry, shutdown_telemetry, TelemetryProviders};
use crate::config::{DatabaseDriver, ServiceConfig};
use device_twin::{
    DeviceTwin, DeviceTwinConfig, MqttTransport, MqttTransportConfig, Repositories, TlsIdentity,
};
use dms_runner::Runner;
use std::time::Duration;
use tracing::{debug, error, info, trace};

#[tokio::main]
async fn main() {
    // Initialize configuration and tracing
    let config = match ServiceConfig::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    // Initialize telemetry (tracing + optional OpenTelemetry trace export)
    let telemetry_providers: Option<TelemetryProviders> =
        match init_telemetry(&config.telemetry()) {
            Ok(provider) => provider,
            Err(e) => {
                eprintln!("Failed to initialize telemetry: {}", e);
                std::process::exit(1);
            }
        };

    info!(
        otel_enabled = config.telemetry.otel_enabled,
        otel_endpoint = %config.telemetry.otel_endpoint,
        auth_provider = %config.auth.provider,
        "Starting dms-all-in-one service"
    );
    debug!("Configuration: {:?}", config);
    for key in &config.ignored_keys {
        trace!(key = %key, "ignoring unknown configuration key");
    }

    let repositories = match initialize_store(&config).await {
        Ok(repositories) => repositories,
        Err(e) => {
            error!("Failed to initialize store: {}", e);
            std::process::exit(1);
        }
    };

    let transport_config = match build_transport_config(&config) {
        Ok(transport_config) => transport_config,
        Err(e) => {
            error!("Failed to load MQTT TLS material: {}", e);
            std::process::exit(1);
        }
    };
    let (transport, event_loop) = MqttTransport::new(transport_config);

    let device_twin = match DeviceTwin::new(
        repositories,
        transport,
        event_loop,
        build_device_twin_config(&config),
    )
    .await
    {
        Ok(device_twin) => device_twin,
        Err(e) => {
            error!("Failed to initialize device twin: {}", e);
            std::process::exit(1);
        }
    };

    // Build runner with all processes
    let mut runner = Runner::new();
    for (name, process) in device_twin.into_runner_processes() {
        runner = runner.with_named_process(name, process);
    }

    runner = runner
        .with_closer(move || {
            Box::pin(async move {
                info!("Running cleanup tasks...");
                // Flush pending traces before exit
                shutdown_telemetry(telemetry_providers);
                info!("Cleanup complete");
                Ok(())
            })
        })
        .with_closer_timeout(Duration::from_secs(config.shutdown_timeout_secs));

    runner.run().await;
}

async fn initialize_store(config: &ServiceConfig) -> anyhow::Result<Repositories> {
    match config.database.driver {
        DatabaseDriver::Memory => {
            info!("Using in-memory store");
            Ok(Repositories::in_memory(InMemoryStore::new()))
        }
        DatabaseDriver::Postgres => {
            info!("Initializing PostgreSQL...");
            let postgres = config.database.postgres();
            let client = PostgresClient::from_config(&postgres)?;
            client.ping().await?;
            if postgres.ensure_schema {
                client.ensure_schema().await?;
            }
            Ok(Repositories::postgres(client))
        }
    }
}

fn build_transport_config(config: &ServiceConfig) -> anyhow::Result<MqttTransportConfig> {
    let mqtt = &config.mqtt;
    let tls = if mqtt.tls_enabled() {
        Some(TlsIdentity {
            ca: std::fs::read(&mqtt.ca_path)?,
            client_cert: std::fs::read(&mqtt.cert_path)?,
            client_key: std::fs::read(&mqtt.key_path)?,
        })
    } else {
        None
    };

    Ok(MqttTransportConfig {
        host: mqtt.url.clone(),
        port: mqtt.port,
        client_id_prefix: mqtt.client_id_prefix.clone(),
        tls,
        keep_alive: Duration::from_secs(mqtt.keep_alive_secs),
        publish_timeout: Duration::from_secs(mqtt.publish_timeout_secs),
        reconnect_delay: Duration::from_secs(mqtt.reconnect_delay_secs),
        inbound_backlog: mqtt.inbound_capacity,
        ..MqttTransportConfig::default()
    })
}

fn build_device_twin_config(config: &ServiceConfig) -> DeviceTwinConfig {
    DeviceTwinConfig {
        health_topic: config.mqtt.health_topic.clone(),
        pub_topic: config.mqtt.pub_topic.clone(),
        inbound_capacity: config.mqtt.inbound_capacity,
        egress_capacity: config.egress.capacity,
        reconciler: config.reconciler.clone(),
        ..DeviceTwinConfig::default()
    }
}

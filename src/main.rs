mod bridge;
mod config;
mod device_bus;
mod discovery;
mod error;
mod hass;
mod mapping;
mod mqtt;
mod registry;
mod scheduler;
#[cfg(test)]
mod testing;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tracing_subscriber::EnvFilter;

use bridge::Bridge;
use device_bus::{BusTranslator, CommandPublisher};
use discovery::HassPublisher;
use hass::HassTranslator;
use mqtt::{MqttConnector, Outbound, Side};
use registry::Registry;
use scheduler::Scheduler;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Parser, Debug)]
#[command(version, about = "Device-bus to Home Assistant MQTT discovery bridge")]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = config::load_config(&args.config)?;

    // RUST_LOG wins over the configured level
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{},rumqttc=error", config.general.loglevel.as_filter()))
        }))
        .init();

    tracing::info!("Starting busbridge v{}", env!("CARGO_PKG_VERSION"));

    let bus_prefix = config.device_bus.topic_prefix.clone();
    let hass_config = Arc::new(config.homeassistant);
    let registry = Arc::new(Registry::default());
    let scheduler = Arc::new(Scheduler::new());

    let (bus_conn, bus_loop) = MqttConnector::new(&config.device_bus.broker);
    let (hass_conn, hass_loop) = MqttConnector::new(&hass_config.broker);

    let publisher = Arc::new(HassPublisher::new(
        hass_config.clone(),
        registry.clone(),
        scheduler.clone(),
        Outbound::new("homeassistant", hass_conn.clone()),
    ));
    let commands = CommandPublisher::new(bus_prefix.clone(), Outbound::new("device-bus", bus_conn.clone()));
    let bridge = Bridge::new(
        BusTranslator::new(bus_prefix.clone(), registry.clone(), publisher.clone()),
        HassTranslator::new(hass_config.clone(), registry.clone(), publisher.clone(), commands),
        publisher,
    );

    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let router = tokio::spawn(bridge.run(rx));

    let mut bus_task = tokio::spawn(bus_conn.clone().run(
        bus_loop,
        Side::DeviceBus,
        device_bus::subscriptions(&bus_prefix),
        tx.clone(),
    ));
    let mut hass_task = tokio::spawn(hass_conn.clone().run(
        hass_loop,
        Side::HomeAssistant,
        hass::subscriptions(&hass_config),
        tx,
    ));

    let outcome = tokio::select! {
        res = &mut bus_task => connector_exit(Side::DeviceBus, res),
        res = &mut hass_task => connector_exit(Side::HomeAssistant, res),
        _ = shutdown_signal() => Ok(()),
    };

    // Pending publishes are idempotent and safe to abandon.
    scheduler.cancel_all();
    bus_conn.disconnect().await;
    hass_conn.disconnect().await;
    bus_task.abort();
    hass_task.abort();
    router.abort();

    tracing::info!("busbridge stopped");
    outcome
}

fn connector_exit(
    side: Side,
    res: Result<error::Result<()>, JoinError>,
) -> anyhow::Result<()> {
    match res {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e).with_context(|| format!("{} connector stopped", side.as_str())),
        Err(e) => Err(e).with_context(|| format!("{} connector task failed", side.as_str())),
    }
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down"),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}

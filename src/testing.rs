//! Fully wired bridge over recording transports, for translator tests.

use std::sync::Arc;

use crate::bridge::Bridge;
use crate::config::HassConfig;
use crate::device_bus::{BusTranslator, CommandPublisher};
use crate::discovery::HassPublisher;
use crate::hass::HassTranslator;
use crate::mqtt::testing::RecordingTransport;
use crate::mqtt::{InboundMessage, Outbound};
use crate::registry::Registry;
use crate::scheduler::Scheduler;

pub struct Harness {
    pub config: Arc<HassConfig>,
    pub registry: Arc<Registry>,
    pub scheduler: Arc<Scheduler>,
    pub hass_transport: Arc<RecordingTransport>,
    pub bus_transport: Arc<RecordingTransport>,
    pub publisher: Arc<HassPublisher>,
    pub bus: BusTranslator,
    pub hass: HassTranslator,
}

impl Harness {
    /// Bus prefix is empty, HA topic prefix is `wb/`.
    pub fn new(entity_prefix: &str) -> Self {
        let yaml = format!(
            "broker_host: localhost\ntopic_prefix: wb/\nentity_prefix: '{}'\n",
            entity_prefix
        );
        let config: HassConfig = serde_yaml::from_str(&yaml).unwrap();
        Self::with_config(config)
    }

    pub fn with_config(config: HassConfig) -> Self {
        let config = Arc::new(config);
        let registry = Arc::new(Registry::default());
        let scheduler = Arc::new(Scheduler::new());
        let hass_transport = RecordingTransport::new();
        let bus_transport = RecordingTransport::new();

        let publisher = Arc::new(HassPublisher::new(
            config.clone(),
            registry.clone(),
            scheduler.clone(),
            Outbound::new("homeassistant", hass_transport.clone()),
        ));
        let bus = BusTranslator::new("", registry.clone(), publisher.clone());
        let commands = CommandPublisher::new("", Outbound::new("device-bus", bus_transport.clone()));
        let hass = HassTranslator::new(config.clone(), registry.clone(), publisher.clone(), commands);

        Self {
            config,
            registry,
            scheduler,
            hass_transport,
            bus_transport,
            publisher,
            bus,
            hass,
        }
    }

    pub fn meta(&self, device: &str, control: &str, name: &str, value: &str) {
        let topic = format!("/devices/{}/controls/{}/meta/{}", device, control, name);
        self.bus.handle(&InboundMessage::new(topic, value));
    }

    pub fn device_meta(&self, device: &str, name: &str, value: &str) {
        let topic = format!("/devices/{}/meta/{}", device, name);
        self.bus.handle(&InboundMessage::new(topic, value));
    }

    pub fn state(&self, device: &str, control: &str, value: &str) {
        let topic = format!("/devices/{}/controls/{}", device, control);
        self.bus.handle(&InboundMessage::new(topic, value));
    }

    pub fn hass_message(&self, topic: &str, payload: &str) {
        self.hass.handle(&InboundMessage::new(topic, payload));
    }

    pub fn into_bridge(self) -> Bridge {
        Bridge::new(self.bus, self.hass, self.publisher)
    }
}

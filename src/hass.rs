//! Home Assistant side inbound: birth/will status and entity commands.

use std::sync::Arc;

use rumqttc::QoS;

use crate::config::HassConfig;
use crate::device_bus::CommandPublisher;
use crate::discovery::HassPublisher;
use crate::mqtt::InboundMessage;
use crate::registry::{ControlKey, Registry};

/// Parse `{prefix}devices/{device}/controls/{control}/on`.
pub fn parse_command_topic(prefix: &str, topic: &str) -> Option<ControlKey> {
    let rest = topic.strip_prefix(prefix)?.strip_prefix("devices/")?;
    match rest.split('/').collect::<Vec<_>>().as_slice() {
        [device, "controls", control, "on"] if !device.is_empty() && !control.is_empty() => {
            Some(ControlKey::new(*device, *control))
        }
        _ => None,
    }
}

/// Subscriptions needed on the Home Assistant broker.
pub fn subscriptions(config: &HassConfig) -> Vec<(String, QoS)> {
    let qos = config.subscribe_qos.0;
    vec![
        (config.status_topic.clone(), qos),
        (
            format!("{}devices/+/controls/+/on", config.topic_prefix),
            qos,
        ),
    ]
}

pub struct HassTranslator {
    config: Arc<HassConfig>,
    registry: Arc<Registry>,
    publisher: Arc<HassPublisher>,
    commands: CommandPublisher,
}

impl HassTranslator {
    pub fn new(
        config: Arc<HassConfig>,
        registry: Arc<Registry>,
        publisher: Arc<HassPublisher>,
        commands: CommandPublisher,
    ) -> Self {
        Self {
            config,
            registry,
            publisher,
            commands,
        }
    }

    pub fn handle(&self, msg: &InboundMessage) {
        if msg.topic == self.config.status_topic {
            self.on_status(&msg.payload_str());
            return;
        }

        if let Some(key) = parse_command_topic(&self.config.topic_prefix, &msg.topic) {
            self.on_command(&key, msg);
        }
    }

    fn on_status(&self, payload: &str) {
        if payload == self.config.status_payload_online {
            tracing::info!("Home Assistant is online, republishing all entities");
            self.publisher.publish_all();
        } else if payload == self.config.status_payload_offline {
            tracing::info!("Home Assistant went offline");
        } else {
            tracing::error!(
                "Invalid payload on {}: '{}' (expected '{}' or '{}')",
                self.config.status_topic,
                payload,
                self.config.status_payload_online,
                self.config.status_payload_offline
            );
        }
    }

    fn on_command(&self, key: &ControlKey, msg: &InboundMessage) {
        if !self.registry.contains_control(key) {
            tracing::warn!("Command for unknown control {}, dropping", key);
            return;
        }
        tracing::debug!("[{}] command from Home Assistant: {}", key, msg.payload_str());
        self.commands.send_command(key, &msg.payload, msg.retain);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{TaskKey, TaskKind};
    use crate::testing::Harness;
    use std::time::Duration;

    #[test]
    fn test_parse_command_topic() {
        assert_eq!(
            parse_command_topic("wb/", "wb/devices/relay1/controls/K1/on"),
            Some(ControlKey::new("relay1", "K1"))
        );
        assert_eq!(
            parse_command_topic("", "devices/wb-gpio/controls/A1 OUT/on"),
            Some(ControlKey::new("wb-gpio", "A1 OUT"))
        );
        assert_eq!(parse_command_topic("wb/", "wb/devices/relay1/controls/K1"), None);
        assert_eq!(parse_command_topic("wb/", "wb/devices/relay1/controls/K1/availability"), None);
        assert_eq!(parse_command_topic("wb/", "other/devices/relay1/controls/K1/on"), None);
        assert_eq!(parse_command_topic("wb/", "wb/devices//controls/K1/on"), None);
    }

    #[test]
    fn test_subscriptions() {
        let h = Harness::new("");
        let subs = subscriptions(&h.config);
        assert_eq!(subs[0], ("hass/status".to_string(), QoS::AtLeastOnce));
        assert_eq!(subs[1].0, "wb/devices/+/controls/+/on");
    }

    #[tokio::test(start_paused = true)]
    async fn test_online_resyncs_every_control() {
        let h = Harness::new("");
        h.meta("relay1", "K1", "type", "switch");
        h.meta("wb-msw", "Temperature", "type", "temperature");
        tokio::time::sleep(Duration::from_secs(2)).await;
        h.hass_transport.clear();

        // Nothing changed, the resync republishes anyway.
        h.hass_message("hass/status", "online");
        let k1 = TaskKey::new(&ControlKey::new("relay1", "K1"), TaskKind::Config);
        assert!(h.scheduler.is_pending(&k1));

        tokio::time::sleep(Duration::from_secs(2)).await;
        let topics = h.hass_transport.topics();
        assert!(topics.contains(&"homeassistant/switch/relay1/k1/config".to_string()));
        assert!(topics.contains(&"homeassistant/sensor/wb_msw/temperature/config".to_string()));
        assert_eq!(topics.len(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_and_invalid_status_do_nothing() {
        let h = Harness::new("");
        h.meta("relay1", "K1", "type", "switch");
        tokio::time::sleep(Duration::from_secs(2)).await;
        h.hass_transport.clear();

        h.hass_message("hass/status", "offline");
        h.hass_message("hass/status", "rebooting");
        assert_eq!(h.scheduler.pending_count(), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(h.hass_transport.published().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_forwarded_to_bus() {
        let h = Harness::new("");
        h.meta("relay1", "K1", "type", "switch");

        let mut msg = InboundMessage::new("wb/devices/relay1/controls/K1/on", "1");
        msg.retain = true;
        h.hass.handle(&msg);

        let published = h.bus_transport.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "/devices/relay1/controls/K1/on");
        assert_eq!(published[0].payload, "1");
        assert!(published[0].retain);
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_for_unknown_control_dropped() {
        let h = Harness::new("");
        h.hass_message("wb/devices/ghost/controls/K9/on", "1");
        assert!(h.bus_transport.published().is_empty());
        assert!(!h.registry.contains_control(&ControlKey::new("ghost", "K9")));
    }
}

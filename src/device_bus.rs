//! Device-bus side of the bridge.
//!
//! Parses the bus topic namespace:
//! - `{prefix}/devices/{device}/meta/{name}`: device metadata
//! - `{prefix}/devices/{device}/controls/{control}/meta/{name}`: control metadata
//! - `{prefix}/devices/{device}/controls/{control}`: control state
//! - `{prefix}/devices/{device}/controls/{control}/on`: commands (outbound only)
//!
//! Metadata for one control arrives as independent retained messages in no
//! particular order. Every message is applied to the registry immediately;
//! only real changes schedule a republish.

use std::str::FromStr;
use std::sync::Arc;

use dashmap::DashSet;
use rumqttc::QoS;

use crate::discovery::HassPublisher;
use crate::mapping::ControlType;
use crate::mqtt::{InboundMessage, Outbound};
use crate::registry::{ControlKey, Registry};

/// A recognised bus topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusTopic<'a> {
    DeviceMeta { device: &'a str, name: &'a str },
    ControlMeta { device: &'a str, control: &'a str, name: &'a str },
    ControlState { device: &'a str, control: &'a str },
    ControlCommand { device: &'a str, control: &'a str },
}

pub fn parse_bus_topic<'a>(prefix: &str, topic: &'a str) -> Option<BusTopic<'a>> {
    let rest = topic.strip_prefix(prefix)?.strip_prefix("/devices/")?;
    let parts: Vec<&str> = rest.split('/').collect();
    if parts.iter().any(|p| p.is_empty()) {
        return None;
    }
    match parts[..] {
        [device, "meta", name] => Some(BusTopic::DeviceMeta { device, name }),
        [device, "controls", control] => Some(BusTopic::ControlState { device, control }),
        [device, "controls", control, "meta", name] => {
            Some(BusTopic::ControlMeta { device, control, name })
        }
        [device, "controls", control, "on"] => Some(BusTopic::ControlCommand { device, control }),
        _ => None,
    }
}

/// Subscriptions needed on the bus broker.
pub fn subscriptions(prefix: &str) -> Vec<(String, QoS)> {
    vec![
        (format!("{}/devices/+/meta/+", prefix), QoS::AtLeastOnce),
        (format!("{}/devices/+/controls/+/meta/+", prefix), QoS::AtLeastOnce),
        (format!("{}/devices/+/controls/+", prefix), QoS::AtLeastOnce),
    ]
}

/// Which republish policy a metadata change triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MetaChange {
    None,
    Config,
    Availability,
}

impl MetaChange {
    fn config_if(changed: bool) -> Self {
        if changed {
            MetaChange::Config
        } else {
            MetaChange::None
        }
    }
}

/// Inbound translator: bus messages → registry → HA publisher.
pub struct BusTranslator {
    prefix: String,
    registry: Arc<Registry>,
    hass: Arc<HassPublisher>,
    reported_unknown_types: DashSet<String>,
}

impl BusTranslator {
    pub fn new(prefix: impl Into<String>, registry: Arc<Registry>, hass: Arc<HassPublisher>) -> Self {
        Self {
            prefix: prefix.into(),
            registry,
            hass,
            reported_unknown_types: DashSet::new(),
        }
    }

    pub fn handle(&self, msg: &InboundMessage) {
        let Some(topic) = parse_bus_topic(&self.prefix, &msg.topic) else {
            return;
        };
        let payload = msg.payload_str();

        match topic {
            BusTopic::DeviceMeta { device, name } => self.on_device_meta(device, name, &payload),
            BusTopic::ControlMeta { device, control, name } => {
                self.on_control_meta(device, control, name, &payload)
            }
            BusTopic::ControlState { device, control } => {
                self.on_control_state(device, control, &payload)
            }
            // Our own outbound commands; not subscribed, ignore if seen.
            BusTopic::ControlCommand { .. } => {}
        }
    }

    fn on_device_meta(&self, device_id: &str, name: &str, value: &str) {
        if name != "name" {
            tracing::trace!("bus: {} ignoring device meta '{}'", device_id, name);
            return;
        }

        let typed_controls: Vec<String> = {
            let mut device = self.registry.get_or_create_device(device_id);
            let display_name = if value.is_empty() { device_id } else { value };
            if !device.apply_name(display_name) {
                return;
            }
            tracing::debug!("bus: {} name is now '{}'", device_id, display_name);
            device
                .controls()
                .filter(|c| c.control_type.is_some())
                .map(|c| c.id.clone())
                .collect()
        };

        // The discovery device name changed for everything already published.
        for control_id in typed_controls {
            self.hass.publish_config(&ControlKey::new(device_id, control_id));
        }
    }

    fn on_control_meta(&self, device_id: &str, control_id: &str, name: &str, value: &str) {
        let change = {
            let mut device = self.registry.get_or_create_device(device_id);
            let control = device.get_or_create_control(control_id);

            match name {
                "error" => {
                    if control.apply_error(!value.is_empty()) {
                        MetaChange::Availability
                    } else {
                        MetaChange::None
                    }
                }
                "order" => MetaChange::None,
                "type" => match ControlType::from_str(value) {
                    Ok(control_type) => MetaChange::config_if(control.apply_type(control_type)),
                    Err(_) => {
                        self.report_unknown_type(value);
                        MetaChange::None
                    }
                },
                "readonly" => {
                    MetaChange::config_if(control.apply_read_only(matches!(value, "1" | "true")))
                }
                "units" => {
                    let units = (!value.is_empty()).then(|| value.to_string());
                    MetaChange::config_if(control.apply_units(units))
                }
                "max" => match parse_max(value) {
                    Ok(max) => MetaChange::config_if(control.apply_max(max)),
                    Err(e) => {
                        tracing::warn!(
                            "bus: {}/{} invalid max '{}': {}",
                            device_id,
                            control_id,
                            value,
                            e
                        );
                        MetaChange::None
                    }
                },
                other => {
                    tracing::trace!("bus: {}/{} ignoring meta '{}'", device_id, control_id, other);
                    MetaChange::None
                }
            }
        };

        let key = ControlKey::new(device_id, control_id);
        match change {
            MetaChange::Config => self.hass.publish_config(&key),
            MetaChange::Availability => self.hass.publish_availability(&key),
            MetaChange::None => {}
        }
    }

    fn on_control_state(&self, device_id: &str, control_id: &str, value: &str) {
        {
            let mut device = self.registry.get_or_create_device(device_id);
            let _ = device
                .get_or_create_control(control_id)
                .apply_state(value.to_string());
        }
        self.hass.publish_state(&ControlKey::new(device_id, control_id));
    }

    /// Warn once per distinct unparseable type value.
    fn report_unknown_type(&self, value: &str) -> bool {
        let first = self.reported_unknown_types.insert(value.to_string());
        if first {
            tracing::warn!("Unknown type for device-bus control: '{}'", value);
        }
        first
    }
}

fn parse_max(value: &str) -> Result<Option<i64>, std::num::ParseIntError> {
    if value.is_empty() {
        return Ok(None);
    }
    value.trim().parse().map(Some)
}

/// Outbound publisher for commands on the bus.
pub struct CommandPublisher {
    prefix: String,
    outbound: Outbound,
}

impl CommandPublisher {
    pub fn new(prefix: impl Into<String>, outbound: Outbound) -> Self {
        Self {
            prefix: prefix.into(),
            outbound,
        }
    }

    pub fn command_topic(&self, key: &ControlKey) -> String {
        format!("{}/devices/{}/controls/{}/on", self.prefix, key.device, key.control)
    }

    pub fn send_command(&self, key: &ControlKey, payload: &[u8], retain: bool) {
        let topic = self.command_topic(key);
        tracing::debug!("bus: command {} <- {}", topic, String::from_utf8_lossy(payload));
        self.outbound.try_publish(&topic, payload.to_vec(), QoS::AtLeastOnce, retain);
    }
}

//! Device-bus control types → Home Assistant components.
//!
//! `map_control` is pure. `Mapper` wraps it with the configured identity
//! rules (entity prefix, split, inverse) and the once-per-type warning for
//! controls that have no mapping.

use std::collections::HashSet;

use dashmap::DashSet;
use serde::Serialize;
use strum::{AsRefStr, Display, EnumString};

use crate::registry::{Control, Device};

/// Control kinds defined by the device-bus conventions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, AsRefStr, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ControlType {
    // generic
    Switch,
    Alarm,
    Pushbutton,
    Range,
    Rgb,
    Text,
    Value,

    // measurements
    Temperature,
    RelHumidity,
    AtmosphericPressure,
    Rainfall,
    WindSpeed,
    Power,
    PowerConsumption,
    Voltage,
    WaterFlow,
    WaterConsumption,
    Resistance,
    Concentration,
    HeatPower,
    HeatEnergy,
    Current,
}

impl ControlType {
    pub fn default_unit(&self) -> Option<&'static str> {
        let unit = match self {
            ControlType::Temperature => "°C",
            ControlType::RelHumidity => "%",
            ControlType::AtmosphericPressure => "millibar",
            ControlType::Rainfall => "mm per hour",
            ControlType::WindSpeed => "m/s",
            ControlType::Power => "watt",
            ControlType::PowerConsumption => "kWh",
            ControlType::Voltage => "V",
            ControlType::WaterFlow => "m³/hour",
            ControlType::WaterConsumption => "m³",
            ControlType::Resistance => "Ohm",
            ControlType::Concentration => "ppm",
            ControlType::HeatPower => "Gcal/hour",
            ControlType::HeatEnergy => "Gcal",
            ControlType::Current => "A",
            _ => return None,
        };
        Some(unit)
    }

    fn is_measurement(&self) -> bool {
        self.default_unit().is_some()
    }
}

/// Home Assistant MQTT components this bridge can render.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, AsRefStr, Display)]
#[strum(serialize_all = "snake_case")]
pub enum Component {
    Switch,
    BinarySensor,
    Sensor,
}

/// Component-specific part of a discovery payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ComponentFields {
    Switch {
        payload_on: &'static str,
        payload_off: &'static str,
        state_on: &'static str,
        state_off: &'static str,
        state_topic: String,
        command_topic: String,
    },
    BinarySensor {
        payload_on: &'static str,
        payload_off: &'static str,
        state_topic: String,
    },
    Sensor {
        state_topic: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        device_class: Option<&'static str>,
        #[serde(skip_serializing_if = "Option::is_none")]
        unit_of_measurement: Option<String>,
    },
}

pub fn component_for(control: &Control) -> Option<Component> {
    let control_type = control.control_type?;
    match control_type {
        ControlType::Switch if control.read_only => Some(Component::BinarySensor),
        ControlType::Switch => Some(Component::Switch),
        ControlType::Range if control.read_only => Some(Component::Sensor),
        ControlType::Range => None,
        ControlType::Alarm | ControlType::Pushbutton => Some(Component::BinarySensor),
        ControlType::Text | ControlType::Value => Some(Component::Sensor),
        t if t.is_measurement() => Some(Component::Sensor),
        _ => None,
    }
}

/// Map a control to its component and payload fields. `None` means the
/// control cannot (yet) be represented.
pub fn map_control(
    _device: &Device,
    control: &Control,
    control_topic: &str,
    inverse: bool,
) -> Option<(Component, ComponentFields)> {
    let component = component_for(control)?;
    let (on, off) = if inverse { ("0", "1") } else { ("1", "0") };

    let fields = match component {
        Component::Switch => ComponentFields::Switch {
            payload_on: on,
            payload_off: off,
            state_on: on,
            state_off: off,
            state_topic: control_topic.to_string(),
            command_topic: format!("{}/on", control_topic),
        },
        Component::BinarySensor => ComponentFields::BinarySensor {
            payload_on: on,
            payload_off: off,
            state_topic: control_topic.to_string(),
        },
        Component::Sensor => ComponentFields::Sensor {
            state_topic: control_topic.to_string(),
            device_class: (control.control_type == Some(ControlType::Temperature))
                .then_some("temperature"),
            unit_of_measurement: control.units.clone(),
        },
    };
    Some((component, fields))
}

// ── Identifiers ──────────────────────────────────────────

const LOCAL_DEVICE_SLUG: &str = "wirenboard";
const LOCAL_DEVICE_NAME: &str = "Wirenboard";

/// Lower-case, spaces and hyphens replaced with underscores.
pub fn slugify(s: &str) -> String {
    s.to_lowercase().replace([' ', '-'], "_")
}

/// Upper-case the first letter of every word, lower-case the rest.
fn title_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut prev_alpha = false;
    for c in s.chars() {
        if c.is_alphabetic() {
            if prev_alpha {
                out.extend(c.to_lowercase());
            } else {
                out.extend(c.to_uppercase());
            }
            prev_alpha = true;
        } else {
            out.push(c);
            prev_alpha = false;
        }
    }
    out
}

/// Discovery identifiers for one control.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityIdentity {
    /// Discovery device identifier, also used as `node_id`.
    pub device_id: String,
    pub device_name: String,
    pub unique_id: String,
    pub object_id: String,
    pub name: String,
    pub inverse: bool,
}

/// Identity rules plus the unsupported-type seen-set.
pub struct Mapper {
    entity_prefix: String,
    split_devices: HashSet<String>,
    split_entities: HashSet<String>,
    inverse: HashSet<String>,
    reported_unsupported: DashSet<ControlType>,
}

impl Mapper {
    pub fn new(
        entity_prefix: impl Into<String>,
        split_devices: HashSet<String>,
        split_entities: HashSet<String>,
        inverse: HashSet<String>,
    ) -> Self {
        Self {
            entity_prefix: entity_prefix.into(),
            split_devices,
            split_entities,
            inverse,
            reported_unsupported: DashSet::new(),
        }
    }

    pub fn identity(&self, device: &Device, is_local: bool, control: &Control) -> EntityIdentity {
        let prefix = &self.entity_prefix;
        let id_prefix = if prefix.is_empty() {
            String::new()
        } else {
            format!("{}_", slugify(prefix))
        };

        let (mut device_id, mut device_name) = if is_local {
            (
                slugify(&format!("{}{}", id_prefix, LOCAL_DEVICE_SLUG)),
                format!("{} {}", prefix, LOCAL_DEVICE_NAME).trim().to_string(),
            )
        } else {
            (
                slugify(&format!("{}{}", id_prefix, device.id)),
                format!("{} {}", prefix, device.name).trim().to_string(),
            )
        };

        let unique_id = slugify(&format!("{}{}_{}", id_prefix, device.id, control.id));
        let object_id = slugify(&control.id);
        let name = title_case(&format!("{} {} {}", prefix, device.id, control.id).replace('_', " "))
            .trim()
            .to_string();

        if self.split_devices.contains(&device_id) || self.split_entities.contains(&unique_id) {
            device_id = unique_id.clone();
            device_name = name.clone();
        }

        EntityIdentity {
            inverse: self.inverse.contains(&unique_id),
            device_id,
            device_name,
            unique_id,
            object_id,
            name,
        }
    }

    /// `map_control`, warning once per control type that has no mapping.
    pub fn map(
        &self,
        device: &Device,
        control: &Control,
        control_topic: &str,
        inverse: bool,
    ) -> Option<(Component, ComponentFields)> {
        let mapped = map_control(device, control, control_topic, inverse);
        if mapped.is_none() {
            if let Some(control_type) = control.control_type {
                if self.note_unsupported(control_type) {
                    tracing::warn!(
                        "No mapping for control type '{}' (first seen on {}/{}, read_only: {})",
                        control_type,
                        device.id,
                        control.id,
                        control.read_only
                    );
                }
            }
        }
        mapped
    }

    /// True the first time a type is reported.
    fn note_unsupported(&self, control_type: ControlType) -> bool {
        self.reported_unsupported.insert(control_type)
    }
}

//! In-memory device/control registry.
//!
//! Devices and controls are created on first reference by any inbound
//! message and live for the lifetime of the process. Each control field has
//! its own mutator returning `true` only when the stored value actually
//! changed, which is what drives republication downstream.

use std::collections::{HashMap, HashSet};

use dashmap::mapref::one::RefMut;
use dashmap::DashMap;

use crate::mapping::ControlType;

/// Device ids that belong to the gateway host itself.
pub const LOCAL_DEVICE_IDS: &[&str] = &[
    "wb-adc",
    "wbrules",
    "wb-gpio",
    "power_status",
    "network",
    "system",
    "hwmon",
    "buzzer",
    "alarms",
];

/// Identity of one control across both namespaces.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ControlKey {
    pub device: String,
    pub control: String,
}

impl ControlKey {
    pub fn new(device: impl Into<String>, control: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            control: control.into(),
        }
    }
}

impl std::fmt::Display for ControlKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.device, self.control)
    }
}

/// The smallest addressable unit of state on the device bus.
#[derive(Debug, Clone, PartialEq)]
pub struct Control {
    pub id: String,
    pub control_type: Option<ControlType>,
    pub read_only: bool,
    /// `None` until the first `meta/error` message.
    pub error: Option<bool>,
    pub units: Option<String>,
    /// Set once `meta/units` was applied; type defaults no longer overwrite it.
    pub units_explicit: bool,
    pub max: Option<i64>,
    pub state: Option<String>,
}

impl Control {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            control_type: None,
            read_only: false,
            error: None,
            units: None,
            units_explicit: false,
            max: None,
            state: None,
        }
    }

    /// Set the type, auto-filling the default unit unless units were set
    /// explicitly. Returns true if either field changed.
    #[must_use]
    pub fn apply_type(&mut self, control_type: ControlType) -> bool {
        let mut changed = replace_if_different(&mut self.control_type, Some(control_type));
        if !self.units_explicit {
            if let Some(unit) = control_type.default_unit() {
                changed |= replace_if_different(&mut self.units, Some(unit.to_string()));
            }
        }
        changed
    }

    #[must_use]
    pub fn apply_read_only(&mut self, read_only: bool) -> bool {
        replace_if_different(&mut self.read_only, read_only)
    }

    #[must_use]
    pub fn apply_error(&mut self, error: bool) -> bool {
        replace_if_different(&mut self.error, Some(error))
    }

    /// Explicit unit from `meta/units`.
    #[must_use]
    pub fn apply_units(&mut self, units: Option<String>) -> bool {
        self.units_explicit = true;
        replace_if_different(&mut self.units, units)
    }

    #[must_use]
    pub fn apply_max(&mut self, max: Option<i64>) -> bool {
        replace_if_different(&mut self.max, max)
    }

    #[must_use]
    pub fn apply_state(&mut self, state: String) -> bool {
        replace_if_different(&mut self.state, Some(state))
    }
}

fn replace_if_different<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        false
    } else {
        *slot = value;
        true
    }
}

/// A device on the bus and the controls it owns.
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    pub id: String,
    pub name: String,
    controls: HashMap<String, Control>,
}

impl Device {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            controls: HashMap::new(),
        }
    }

    #[must_use]
    pub fn apply_name(&mut self, name: &str) -> bool {
        if self.name == name {
            false
        } else {
            self.name = name.to_string();
            true
        }
    }

    pub fn get_or_create_control(&mut self, control_id: &str) -> &mut Control {
        let device_id = &self.id;
        self.controls
            .entry(control_id.to_string())
            .or_insert_with(|| {
                tracing::debug!("registry: {} new control {}", device_id, control_id);
                Control::new(control_id)
            })
    }

    pub fn control(&self, control_id: &str) -> Option<&Control> {
        self.controls.get(control_id)
    }

    pub fn controls(&self) -> impl Iterator<Item = &Control> {
        self.controls.values()
    }
}

/// Process-wide store of assembled device state.
///
/// Constructed once in `main` and shared by `Arc`; tests build their own.
pub struct Registry {
    devices: DashMap<String, Device>,
    local_ids: HashSet<String>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(LOCAL_DEVICE_IDS.iter().copied())
    }
}

impl Registry {
    pub fn new<'a>(local_ids: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            devices: DashMap::new(),
            local_ids: local_ids.into_iter().map(String::from).collect(),
        }
    }

    /// Returns a write guard; do not hold it across calls back into the registry.
    pub fn get_or_create_device(&self, device_id: &str) -> RefMut<'_, String, Device> {
        self.devices
            .entry(device_id.to_string())
            .or_insert_with(|| {
                tracing::debug!("registry: new device {}", device_id);
                Device::new(device_id)
            })
    }

    pub fn is_local_device(&self, device_id: &str) -> bool {
        self.local_ids.contains(device_id)
    }

    /// Snapshot of every device, controls included.
    pub fn all_devices(&self) -> Vec<Device> {
        self.devices
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn contains_control(&self, key: &ControlKey) -> bool {
        self.devices
            .get(&key.device)
            .is_some_and(|device| device.control(&key.control).is_some())
    }

    /// Run `f` against the current state of an existing control.
    pub fn with_control<R>(
        &self,
        key: &ControlKey,
        f: impl FnOnce(&Device, &Control) -> R,
    ) -> Option<R> {
        let device = self.devices.get(&key.device)?;
        let control = device.control(&key.control)?;
        Some(f(device.value(), control))
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }
}

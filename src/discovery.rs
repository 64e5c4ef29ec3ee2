//! HA MQTT Discovery publisher
//!
//! Renders registry state through the mapping engine into the three
//! messages Home Assistant needs per control:
//!
//! - `{discovery_topic}/{component}/{node_id}/{object_id}/config`: discovery
//! - `{prefix}devices/{device}/controls/{control}/availability`: `1` / `0`
//! - `{prefix}devices/{device}/controls/{control}`: raw state
//!
//! Config and availability go through the scheduler so bursts of meta
//! topics collapse into one publish rendered from the latest state.

use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;

use crate::config::HassConfig;
use crate::mapping::{Component, ComponentFields, Mapper};
use crate::mqtt::Outbound;
use crate::registry::{Control, ControlKey, Registry};
use crate::scheduler::{Scheduler, TaskKey, TaskKind};

const PAYLOAD_AVAILABLE: &str = "1";
const PAYLOAD_NOT_AVAILABLE: &str = "0";

/// Full discovery config payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscoveryPayload {
    pub device: DeviceDescriptor,
    pub name: String,
    pub unique_id: String,
    pub availability_topic: String,
    pub payload_available: &'static str,
    pub payload_not_available: &'static str,
    #[serde(flatten)]
    pub fields: ComponentFields,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceDescriptor {
    pub name: String,
    pub identifiers: Vec<String>,
}

/// What the last config render decided for a control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentState {
    Mapped(Component),
    Unsupported,
}

/// One config cycle, rendered under a single registry read.
struct ConfigRender {
    typed: bool,
    component: Option<Component>,
    topic: String,
    payload: Option<DiscoveryPayload>,
    availability: &'static str,
    state: String,
}

/// Availability derived from the tri-state error flag. An unknown flag
/// means the bus has not reported an error, so the control is available.
pub fn availability_payload(control: &Control) -> &'static str {
    match control.error {
        Some(true) => PAYLOAD_NOT_AVAILABLE,
        Some(false) | None => PAYLOAD_AVAILABLE,
    }
}

pub struct HassPublisher {
    config: Arc<HassConfig>,
    registry: Arc<Registry>,
    scheduler: Arc<Scheduler>,
    mapper: Mapper,
    outbound: Outbound,
    /// Component chosen by the most recent config render, keyed by control.
    components: DashMap<ControlKey, ComponentState>,
}

impl HassPublisher {
    pub fn new(
        config: Arc<HassConfig>,
        registry: Arc<Registry>,
        scheduler: Arc<Scheduler>,
        outbound: Outbound,
    ) -> Self {
        let mapper = Mapper::new(
            config.entity_prefix.clone(),
            config.split_devices.clone(),
            config.split_entities.clone(),
            config.inverse.clone(),
        );
        Self {
            config,
            registry,
            scheduler,
            mapper,
            outbound,
            components: DashMap::new(),
        }
    }

    pub fn control_topic(&self, key: &ControlKey) -> String {
        format!(
            "{}devices/{}/controls/{}",
            self.config.topic_prefix, key.device, key.control
        )
    }

    pub fn availability_topic(&self, key: &ControlKey) -> String {
        format!("{}/availability", self.control_topic(key))
    }

    pub fn component_state(&self, key: &ControlKey) -> Option<ComponentState> {
        self.components.get(key).map(|entry| *entry)
    }

    // ── Policies ─────────────────────────────────────────

    /// Schedule discovery, then availability, then state for one control.
    pub fn publish_config(self: &Arc<Self>, key: &ControlKey) {
        let this = Arc::clone(self);
        let task_key = key.clone();
        self.scheduler.schedule(
            TaskKey::new(key, TaskKind::Config),
            self.config.config_delay(),
            async move { this.publish_config_now(&task_key).await },
        );
    }

    /// Schedule an availability-only publish (error flag flapping).
    pub fn publish_availability(self: &Arc<Self>, key: &ControlKey) {
        let this = Arc::clone(self);
        let task_key = key.clone();
        self.scheduler.schedule(
            TaskKey::new(key, TaskKind::Availability),
            self.config.availability_delay(),
            async move { this.publish_availability_now(&task_key).await },
        );
    }

    /// Forward a state update, rate limited per component kind once the
    /// component is known.
    pub fn publish_state(&self, key: &ControlKey) {
        match self.component_state(key) {
            Some(ComponentState::Unsupported) => {
                tracing::trace!("[{}] state dropped, control has no mapping", key);
                return;
            }
            Some(ComponentState::Mapped(component)) => {
                if let Some(interval) = self.config.debounce_for(component.as_ref()) {
                    let gate = TaskKey::new(key, TaskKind::DebouncedState);
                    if !self.scheduler.debounce_gate(&gate, interval) {
                        tracing::trace!("[{}] state debounced", key);
                        return;
                    }
                }
            }
            None => {}
        }
        self.publish_state_now(key);
    }

    /// Full resync: schedule a config publish for every known control.
    pub fn publish_all(self: &Arc<Self>) {
        let mut count = 0;
        for device in self.registry.all_devices() {
            for control in device.controls() {
                self.publish_config(&ControlKey::new(&device.id, &control.id));
                count += 1;
            }
        }
        tracing::info!("Scheduled config publish for {} controls", count);
    }

    // ── Immediate publishes ──────────────────────────────
    //
    // Scheduled tasks await the transport so a resync burst is throttled by
    // the client queue. State forwarding runs on the router and never waits.

    async fn publish_config_now(&self, key: &ControlKey) {
        let Some(render) = self.render_config(key) else {
            return;
        };

        match (render.component, render.typed) {
            (Some(component), _) => {
                self.components.insert(key.clone(), ComponentState::Mapped(component));
            }
            (None, true) => {
                self.components.insert(key.clone(), ComponentState::Unsupported);
                return;
            }
            (None, false) => {
                tracing::debug!("[{}] type not known yet, skipping config", key);
                self.components.remove(key);
                return;
            }
        }
        let Some(payload) = render.payload else {
            return;
        };

        let json = match serde_json::to_string(&payload) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!("[{}] could not serialize discovery payload: {}", key, e);
                return;
            }
        };
        tracing::info!("[{}] publish config to '{}'", key, render.topic);
        self.outbound
            .publish(
                &render.topic,
                json,
                self.config.config_qos.0,
                self.config.config_retain,
            )
            .await;

        // Availability and state always follow a config publish.
        self.send_availability(key, render.availability).await;
        tracing::debug!("[{}] state: {}", key, render.state);
        self.outbound
            .publish(
                &self.control_topic(key),
                render.state,
                self.config.state_qos.0,
                self.config.state_retain,
            )
            .await;
    }

    async fn publish_availability_now(&self, key: &ControlKey) {
        let availability = self.registry.with_control(key, |_, c| availability_payload(c));
        if let Some(availability) = availability {
            self.send_availability(key, availability).await;
        }
    }

    fn publish_state_now(&self, key: &ControlKey) {
        if let Some(Some(state)) = self.registry.with_control(key, |_, c| c.state.clone()) {
            tracing::debug!("[{}] state: {}", key, state);
            self.outbound.try_publish(
                &self.control_topic(key),
                state,
                self.config.state_qos.0,
                self.config.state_retain,
            );
        }
    }

    async fn send_availability(&self, key: &ControlKey, payload: &'static str) {
        tracing::info!(
            "[{}] availability: {}",
            key,
            if payload == PAYLOAD_AVAILABLE { "online" } else { "offline" }
        );
        self.outbound
            .publish(
                &self.availability_topic(key),
                payload,
                self.config.availability_qos.0,
                self.config.availability_retain,
            )
            .await;
    }

    fn render_config(&self, key: &ControlKey) -> Option<ConfigRender> {
        let control_topic = self.control_topic(key);
        let availability_topic = self.availability_topic(key);

        self.registry.with_control(key, |device, control| {
            let is_local = self.registry.is_local_device(&device.id);
            let identity = self.mapper.identity(device, is_local, control);
            let mapped = self.mapper.map(device, control, &control_topic, identity.inverse);

            let (component, payload, topic) = match mapped {
                Some((component, fields)) => {
                    let topic = format!(
                        "{}/{}/{}/{}/config",
                        self.config.discovery_topic, component, identity.device_id, identity.object_id
                    );
                    let payload = DiscoveryPayload {
                        device: DeviceDescriptor {
                            name: identity.device_name,
                            identifiers: vec![identity.device_id],
                        },
                        name: identity.name,
                        unique_id: identity.unique_id,
                        availability_topic,
                        payload_available: PAYLOAD_AVAILABLE,
                        payload_not_available: PAYLOAD_NOT_AVAILABLE,
                        fields,
                    };
                    (Some(component), Some(payload), topic)
                }
                None => (None, None, String::new()),
            };

            ConfigRender {
                typed: control.control_type.is_some(),
                component,
                topic,
                payload,
                availability: availability_payload(control),
                state: control.state.clone().unwrap_or_default(),
            }
        })
    }
}

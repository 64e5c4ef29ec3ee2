use std::sync::Arc;

use tokio::sync::mpsc;

use crate::device_bus::BusTranslator;
use crate::discovery::HassPublisher;
use crate::hass::HassTranslator;
use crate::mqtt::{BridgeEvent, Side};

/// Routes events from both connectors to their translators, one at a time.
pub struct Bridge {
    bus: BusTranslator,
    hass: HassTranslator,
    publisher: Arc<HassPublisher>,
}

impl Bridge {
    pub fn new(bus: BusTranslator, hass: HassTranslator, publisher: Arc<HassPublisher>) -> Self {
        Self {
            bus,
            hass,
            publisher,
        }
    }

    pub fn dispatch(&self, event: BridgeEvent) {
        if let BridgeEvent::Message(side, msg) = &event {
            tracing::trace!(
                "{} <- {} (qos {:?}, retain {})",
                side.as_str(),
                msg.topic,
                msg.qos,
                msg.retain
            );
        }
        match event {
            BridgeEvent::Connected(Side::HomeAssistant) => {
                // A fresh session may have lost every retained discovery message.
                self.publisher.publish_all();
            }
            BridgeEvent::Connected(Side::DeviceBus) => {
                tracing::debug!("Device bus connected, waiting for retained topics");
            }
            BridgeEvent::Message(Side::DeviceBus, msg) => self.bus.handle(&msg),
            BridgeEvent::Message(Side::HomeAssistant, msg) => self.hass.handle(&msg),
        }
    }

    /// Consume events until every sender is gone.
    pub async fn run(self, mut rx: mpsc::Receiver<BridgeEvent>) {
        while let Some(event) = rx.recv().await {
            self.dispatch(event);
        }
        tracing::info!("Event channel closed, router stopping");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::InboundMessage;
    use crate::registry::ControlKey;
    use crate::scheduler::{TaskKey, TaskKind};
    use crate::testing::Harness;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_router_dispatches_by_side() {
        let h = Harness::new("");
        let (registry, hass_transport, bus_transport) = (
            h.registry.clone(),
            h.hass_transport.clone(),
            h.bus_transport.clone(),
        );
        let bridge = h.into_bridge();
        let (tx, rx) = mpsc::channel(16);
        let router = tokio::spawn(bridge.run(rx));

        let events = [
            BridgeEvent::Connected(Side::DeviceBus),
            BridgeEvent::Message(
                Side::DeviceBus,
                InboundMessage::new("/devices/relay1/controls/K1/meta/type", "switch"),
            ),
            BridgeEvent::Message(
                Side::HomeAssistant,
                InboundMessage::new("wb/devices/relay1/controls/K1/on", "1"),
            ),
        ];
        for event in events {
            tx.send(event).await.unwrap();
        }
        drop(tx);
        router.await.unwrap();

        assert!(registry.contains_control(&ControlKey::new("relay1", "K1")));
        assert_eq!(bus_transport.topics(), vec!["/devices/relay1/controls/K1/on".to_string()]);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(hass_transport.topics()[0], "homeassistant/switch/relay1/k1/config");
    }

    #[tokio::test(start_paused = true)]
    async fn test_hass_connect_triggers_resync() {
        let h = Harness::new("");
        h.meta("relay1", "K1", "type", "switch");
        tokio::time::sleep(Duration::from_secs(2)).await;
        let scheduler = h.scheduler.clone();
        let bridge = h.into_bridge();

        bridge.dispatch(BridgeEvent::Connected(Side::HomeAssistant));
        let key = TaskKey::new(&ControlKey::new("relay1", "K1"), TaskKind::Config);
        assert!(scheduler.is_pending(&key));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bus_connect_does_not_resync() {
        let h = Harness::new("");
        h.meta("relay1", "K1", "type", "switch");
        tokio::time::sleep(Duration::from_secs(2)).await;
        let scheduler = h.scheduler.clone();
        let bridge = h.into_bridge();

        bridge.dispatch(BridgeEvent::Connected(Side::DeviceBus));
        assert_eq!(scheduler.pending_count(), 0);
    }
}

//! MQTT transport for both broker connections.
//!
//! Each side gets an `MqttConnector` wrapping a rumqttc client. Its event
//! loop runs as a tokio task and forwards connect notifications and inbound
//! publishes into a single channel, so the bridge handles one message at a
//! time regardless of which broker it came from.
//!
//! Publishing never queues: while a connection is down, outbound messages
//! are logged and dropped. The next state change republishes naturally.
//! While it is up, delayed tasks use the awaiting `publish` so a burst (a
//! full resync) waits for room in rumqttc's request queue instead of
//! overflowing it. The router only uses `try_publish`: it must never wait
//! on a queue that the connector tasks drain, because those tasks may
//! themselves be waiting on the router's event channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, ClientError, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;

use crate::config::BrokerConfig;
use crate::error::{BridgeError, Result};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    DeviceBus,
    HomeAssistant,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::DeviceBus => "device-bus",
            Side::HomeAssistant => "homeassistant",
        }
    }
}

/// A publish received from either broker.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtMostOnce,
            retain: false,
        }
    }

    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

#[derive(Debug)]
pub enum BridgeEvent {
    Connected(Side),
    Message(Side, InboundMessage),
}

/// Publish primitives of one broker connection.
#[async_trait]
pub trait Transport: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Fails immediately if the request queue is full.
    fn try_publish(&self, topic: &str, payload: Vec<u8>, qos: QoS, retain: bool)
        -> std::result::Result<(), ClientError>;

    /// Waits for room in the request queue.
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS, retain: bool)
        -> std::result::Result<(), ClientError>;
}

/// Hands fully formed messages to a transport, or drops them while it is down.
#[derive(Clone)]
pub struct Outbound {
    name: String,
    transport: Arc<dyn Transport>,
}

impl Outbound {
    pub fn new(name: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        Self {
            name: name.into(),
            transport,
        }
    }

    fn ready(&self, topic: &str) -> bool {
        let connected = self.transport.is_connected();
        if !connected {
            tracing::warn!("Client not ready ({}), dropping publish to {}", self.name, topic);
        }
        connected
    }

    /// Publish without waiting. Used on the inbound path.
    pub fn try_publish(&self, topic: &str, payload: impl Into<Vec<u8>>, qos: QoS, retain: bool) {
        if !self.ready(topic) {
            return;
        }
        if let Err(e) = self.transport.try_publish(topic, payload.into(), qos, retain) {
            tracing::warn!("Publish to {} via {} failed: {}", topic, self.name, e);
        }
    }

    /// Publish, waiting for the client to accept the message.
    pub async fn publish(&self, topic: &str, payload: impl Into<Vec<u8>>, qos: QoS, retain: bool) {
        if !self.ready(topic) {
            return;
        }
        if let Err(e) = self.transport.publish(topic, payload.into(), qos, retain).await {
            tracing::warn!("Publish to {} via {} failed: {}", topic, self.name, e);
        }
    }
}

/// One rumqttc connection.
pub struct MqttConnector {
    host: String,
    client: AsyncClient,
    connected: AtomicBool,
}

impl MqttConnector {
    pub fn new(config: &BrokerConfig) -> (Arc<Self>, EventLoop) {
        let mut options =
            MqttOptions::new(&config.client_id, &config.broker_host, config.broker_port);
        options.set_keep_alive(Duration::from_secs(30));

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options.set_credentials(username, password);
        }

        let (client, event_loop) = AsyncClient::new(options, 100);
        let connector = Arc::new(Self {
            host: config.broker_host.clone(),
            client,
            connected: AtomicBool::new(false),
        });
        (connector, event_loop)
    }

    /// Drive the event loop until shutdown.
    ///
    /// Subscriptions are (re)issued on every ConnAck. An error before the
    /// first successful connection is returned to the caller; later errors
    /// are logged and rumqttc reconnects on the next poll.
    pub async fn run(
        self: Arc<Self>,
        mut event_loop: EventLoop,
        side: Side,
        subscriptions: Vec<(String, QoS)>,
        tx: mpsc::Sender<BridgeEvent>,
    ) -> Result<()> {
        let mut ever_connected = false;

        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    self.connected.store(true, Ordering::SeqCst);
                    ever_connected = true;
                    tracing::info!("Connected to {} ({})", self.host, side.as_str());

                    // Never await the request queue here: this task is its only consumer.
                    for (filter, qos) in &subscriptions {
                        if let Err(e) = self.client.try_subscribe(filter.as_str(), *qos) {
                            tracing::error!("MQTT subscribe {} on {} failed: {}", filter, self.host, e);
                        }
                    }
                    if tx.send(BridgeEvent::Connected(side)).await.is_err() {
                        return Err(BridgeError::ChannelClosed(side.as_str()));
                    }
                }
                Ok(Event::Incoming(Packet::SubAck(_))) => {
                    tracing::debug!("Subscribed ({})", self.host);
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let msg = InboundMessage {
                        topic: publish.topic.clone(),
                        payload: publish.payload.to_vec(),
                        qos: publish.qos,
                        retain: publish.retain,
                    };
                    if tx.send(BridgeEvent::Message(side, msg)).await.is_err() {
                        return Err(BridgeError::ChannelClosed(side.as_str()));
                    }
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    self.connected.store(false, Ordering::SeqCst);
                    tracing::warn!("Disconnected from {}", self.host);
                }
                Ok(_) => {}
                Err(e) => {
                    if !ever_connected {
                        return Err(BridgeError::Connect {
                            host: self.host.clone(),
                            source: e,
                        });
                    }
                    if self.connected.swap(false, Ordering::SeqCst) {
                        tracing::warn!("Disconnected from {}: {}", self.host, e);
                    } else {
                        tracing::debug!("Reconnect to {} failed: {}", self.host, e);
                    }
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            }
        }
    }

    pub async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Err(e) = self.client.disconnect().await {
            tracing::debug!("Disconnect from {} failed: {}", self.host, e);
        }
    }
}

#[async_trait]
impl Transport for MqttConnector {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn try_publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> std::result::Result<(), ClientError> {
        self.client.try_publish(topic, qos, retain, payload)
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> std::result::Result<(), ClientError> {
        self.client.publish(topic, qos, retain, payload).await
    }
}

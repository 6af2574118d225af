//! MQTT bus connection management.
//!
//! [`MqttBus`] owns the broker connection: it registers the last will, waits
//! for the first CONNACK, and then drives the rumqttc network loop on its own
//! task. Inbound publishes are handed to the bridge through a channel so no
//! bridge logic runs on the network loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, LastWill, MqttOptions,
    Outgoing, Packet, QoS,
};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use uamqtt_common::{MqttConfig, TopicBuilder};

use crate::availability::{Availability, AvailabilityPublisher};
use crate::error::{BridgeError, Result};
use crate::publisher::{BusPublisher, MqttPublisher, qos_level};

/// Capacity of the rumqttc request queue.
const REQUEST_CAPACITY: usize = 100;

/// Capacity of the inbound message channel.
const INBOUND_CAPACITY: usize = 256;

/// Network loop retry delay bounds.
const RETRY_MIN: Duration = Duration::from_secs(1);
const RETRY_MAX: Duration = Duration::from_secs(10);

/// A message received from the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

impl BusMessage {
    /// Payload decoded as UTF-8, with invalid sequences replaced.
    pub fn payload_str(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// An established bus connection.
pub struct BusLink {
    /// Outbound publishing handle.
    pub publisher: Arc<dyn BusPublisher>,
    /// Inbound messages on the bridge's subscriptions.
    pub inbound: mpsc::Receiver<BusMessage>,
    /// Retained availability signal.
    pub availability: AvailabilityPublisher,
}

/// Something that can open the bridge's bus connection.
#[async_trait]
pub trait BusConnector: Send + Sync {
    /// Connect and wait until the broker has acknowledged the session.
    async fn connect(&self) -> Result<BusLink>;
}

/// MQTT implementation of [`BusConnector`].
#[derive(Debug, Clone)]
pub struct MqttBus {
    config: MqttConfig,
    topics: TopicBuilder,
}

impl MqttBus {
    /// Create a bus connector for the given configuration.
    pub fn new(config: MqttConfig) -> Self {
        let topics = TopicBuilder::new(config.prefix());
        Self { config, topics }
    }

    /// Client identifier used for the broker session.
    pub fn client_id(&self) -> String {
        match &self.config.client_id {
            Some(id) if !id.trim().is_empty() => id.clone(),
            _ => format!("opcua-mqtt-bridge-{}", std::process::id()),
        }
    }

    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(self.client_id(), &self.config.host, self.config.port);
        options.set_keep_alive(Duration::from_secs(self.config.keepalive_secs));

        if let Some(username) = &self.config.username {
            options.set_credentials(
                username,
                self.config.password.clone().unwrap_or_default(),
            );
        }

        options.set_last_will(LastWill::new(
            self.topics.availability(),
            Availability::Offline.as_str(),
            QoS::AtLeastOnce,
            true,
        ));

        options
    }
}

#[async_trait]
impl BusConnector for MqttBus {
    async fn connect(&self) -> Result<BusLink> {
        let (client, event_loop) = AsyncClient::new(self.options(), REQUEST_CAPACITY);
        let online = Arc::new(AtomicBool::new(false));
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let (ack_tx, ack_rx) = oneshot::channel();

        tracing::info!(
            host = %self.config.host,
            port = self.config.port,
            client_id = %self.client_id(),
            "Connecting to MQTT broker"
        );

        let network = NetworkLoop {
            client: client.clone(),
            topics: self.topics.clone(),
            qos_cmd: qos_level(self.config.qos_cmd),
            online: online.clone(),
            inbound: inbound_tx,
            first_ack: Some(ack_tx),
        };
        let handle = tokio::spawn(network.run(event_loop));

        let wait = Duration::from_secs(self.config.connect_timeout_secs);
        match tokio::time::timeout(wait, ack_rx).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => return Err(e),
            Ok(Err(_)) => {
                return Err(BridgeError::BusConnect(
                    "network loop stopped before the broker answered".to_string(),
                ));
            }
            Err(_) => {
                handle.abort();
                return Err(BridgeError::BusTimeout {
                    secs: self.config.connect_timeout_secs,
                });
            }
        }

        let publisher: Arc<dyn BusPublisher> = Arc::new(MqttPublisher::new(client));
        let availability =
            AvailabilityPublisher::with_flag(publisher.clone(), self.topics.availability(), online);

        Ok(BusLink {
            publisher,
            inbound: inbound_rx,
            availability,
        })
    }
}

/// State of the background network loop.
struct NetworkLoop {
    client: AsyncClient,
    topics: TopicBuilder,
    qos_cmd: QoS,
    online: Arc<AtomicBool>,
    inbound: mpsc::Sender<BusMessage>,
    first_ack: Option<oneshot::Sender<Result<()>>>,
}

impl NetworkLoop {
    async fn run(mut self, mut event_loop: EventLoop) {
        let mut delay = RETRY_MIN;

        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    delay = RETRY_MIN;
                    tracing::info!("Connected to MQTT broker");
                    self.on_connected();
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let message = BusMessage {
                        topic: publish.topic.clone(),
                        payload: publish.payload.to_vec(),
                        retain: publish.retain,
                    };
                    if !self.hand_off(message) {
                        tracing::debug!("Inbound channel closed, stopping MQTT network loop");
                        break;
                    }
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    tracing::warn!("MQTT broker sent disconnect");
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    tracing::info!("Disconnected from MQTT broker");
                    break;
                }
                Ok(_) => {}
                Err(ConnectionError::RequestsDone) => break,
                Err(ConnectionError::ConnectionRefused(code)) if is_auth_refusal(&code) => {
                    if let Some(ack) = self.first_ack.take() {
                        let _ = ack.send(Err(BridgeError::BusAuth(format!("{code:?}"))));
                        break;
                    }
                    tracing::error!(code = ?code, "MQTT broker refused credentials");
                    delay = self.back_off(delay).await;
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        retry_in_secs = delay.as_secs(),
                        "MQTT connection error"
                    );
                    delay = self.back_off(delay).await;
                }
            }
        }
    }

    /// Pass a command to the bridge without ever blocking the network loop.
    ///
    /// Echoes of the bridge's own publishes are dropped here. Returns false
    /// once the receiving side is gone.
    fn hand_off(&self, message: BusMessage) -> bool {
        if self.topics.parse_command(&message.topic).is_none() {
            return true;
        }

        match self.inbound.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(message)) => {
                tracing::warn!(topic = %message.topic, "Inbound queue full, dropping command");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    fn on_connected(&mut self) {
        let availability = if self.online.load(Ordering::Acquire) {
            Availability::Online
        } else {
            Availability::Offline
        };

        if let Err(e) = self.client.try_publish(
            self.topics.availability(),
            QoS::AtLeastOnce,
            true,
            availability.as_str(),
        ) {
            tracing::warn!(error = %e, "Failed to re-announce availability");
        }

        let wildcard = self.topics.wildcard();
        match self.client.try_subscribe(wildcard.clone(), self.qos_cmd) {
            Ok(()) => tracing::debug!(topic = %wildcard, "Subscribed to command topics"),
            Err(e) => tracing::warn!(error = %e, topic = %wildcard, "Failed to subscribe"),
        }

        if let Some(ack) = self.first_ack.take() {
            let _ = ack.send(Ok(()));
        }
    }

    async fn back_off(&self, delay: Duration) -> Duration {
        tokio::time::sleep(delay).await;
        (delay * 2).min(RETRY_MAX)
    }
}

fn is_auth_refusal(code: &ConnectReturnCode) -> bool {
    matches!(
        code,
        ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized
    )
}

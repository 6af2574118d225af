//! Message publisher for MQTT.

use async_trait::async_trait;
use rumqttc::{AsyncClient, QoS};

use crate::error::{BridgeError, Result};

/// Outbound side of the message bus.
///
/// The bridge logic publishes through this trait so tests can substitute an
/// in-memory recorder for the broker connection.
#[async_trait]
pub trait BusPublisher: Send + Sync {
    /// Publish a payload to a topic.
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS, retain: bool) -> Result<()>;

    /// Close the bus connection cleanly. The default does nothing.
    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }
}

/// Map a configured QoS level to the MQTT enum. Levels above 2 clamp to 2.
pub fn qos_level(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

/// Publisher backed by a rumqttc client.
///
/// Publishing only enqueues the request; the network loop owned by
/// [`MqttBus`](crate::MqttBus) delivers it.
#[derive(Clone, Debug)]
pub struct MqttPublisher {
    client: AsyncClient,
}

impl MqttPublisher {
    /// Create a new publisher.
    pub fn new(client: AsyncClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl BusPublisher for MqttPublisher {
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS, retain: bool) -> Result<()> {
        self.client
            .publish(topic, qos, retain, payload)
            .await
            .map_err(|e| BridgeError::publish(topic, e))
    }

    async fn disconnect(&self) -> Result<()> {
        self.client
            .disconnect()
            .await
            .map_err(|e| BridgeError::BusConnect(e.to_string()))
    }
}

//! uamqtt Bridge Framework
//!
//! Common abstractions for building bridges that mirror a device onto MQTT.
//!
//! # Overview
//!
//! This framework provides:
//! - [`BridgeConfig`] trait for configuration loading and validation
//! - [`run_bridge`] for the process lifecycle (args, logging, signal handling)
//! - [`MqttBus`] for the broker connection (last will, first CONNACK wait, network loop)
//! - [`BusPublisher`] as the publishing seam, with [`MqttPublisher`] as the real implementation
//! - [`AvailabilityPublisher`] for the retained online/offline signal
//! - [`BridgeArgs`] for common CLI argument parsing
//!
//! # Example
//!
//! ```ignore
//! use uamqtt_bridge_framework::{run_bridge, BusConnector, MqttBus};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     run_bridge::<MyBridgeConfig, _, _>("mybridge", "mybridge.json5", |config, shutdown| async move {
//!         let link = MqttBus::new(config.mqtt.clone()).connect().await?;
//!         my_worker(link, shutdown).await
//!     })
//!     .await
//! }
//! ```

mod args;
mod availability;
mod config;
mod connection;
mod error;
mod publisher;
mod runner;

pub use args::BridgeArgs;
pub use availability::{Availability, AvailabilityPublisher};
pub use config::{BridgeConfig, validate_mqtt};
pub use connection::{BusConnector, BusLink, BusMessage, MqttBus};
pub use error::{BridgeError, Result};
pub use publisher::{BusPublisher, MqttPublisher, qos_level};
pub use runner::run_bridge;

// Re-export commonly used types
pub use rumqttc::QoS;
pub use uamqtt_common::{LogFormat, LoggingConfig, MqttConfig, TopicBuilder};

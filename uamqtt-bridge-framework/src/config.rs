//! Configuration traits and utilities.

use std::path::Path;

use serde::de::DeserializeOwned;

use crate::error::{BridgeError, Result};
use crate::{LoggingConfig, MqttConfig};

/// Trait for bridge configuration types.
///
/// Implement this trait for your bridge's configuration struct to get
/// automatic loading, validation, and access to common config fields.
///
/// # Example
///
/// ```ignore
/// use serde::Deserialize;
/// use uamqtt_bridge_framework::{BridgeConfig, MqttConfig, LoggingConfig};
///
/// #[derive(Debug, Deserialize)]
/// pub struct MyBridgeConfig {
///     pub mqtt: MqttConfig,
///     pub logging: LoggingConfig,
/// }
///
/// impl BridgeConfig for MyBridgeConfig {
///     fn mqtt(&self) -> &MqttConfig {
///         &self.mqtt
///     }
///
///     fn logging(&self) -> &LoggingConfig {
///         &self.logging
///     }
/// }
/// ```
pub trait BridgeConfig: Sized + DeserializeOwned {
    /// Get the MQTT configuration.
    fn mqtt(&self) -> &MqttConfig;

    /// Get the logging configuration.
    fn logging(&self) -> &LoggingConfig;

    /// Get the topic prefix for this bridge.
    fn topic_prefix(&self) -> &str {
        self.mqtt().prefix()
    }

    /// Validate the configuration.
    ///
    /// Called automatically after loading. The default implementation checks
    /// the MQTT section; override and call [`validate_mqtt`] to extend it.
    fn validate(&self) -> Result<()> {
        validate_mqtt(self.mqtt())
    }

    /// Load configuration from a file path.
    ///
    /// Supports JSON5 format. Calls [`validate`](Self::validate) after loading.
    fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(BridgeError::ConfigNotFound {
                path: path.display().to_string(),
            });
        }

        let content = std::fs::read_to_string(path)?;
        let config: Self = json5::from_str(&content)?;

        config.validate()?;

        Ok(config)
    }
}

/// Validate the settings every MQTT bridge depends on.
pub fn validate_mqtt(mqtt: &MqttConfig) -> Result<()> {
    if mqtt.host.trim().is_empty() {
        return Err(BridgeError::validation("mqtt.host must not be empty"));
    }
    if mqtt.prefix().trim_matches('/').is_empty() {
        return Err(BridgeError::validation("mqtt.topic_prefix must not be empty"));
    }
    if mqtt.qos_state > 2 {
        return Err(BridgeError::validation(format!(
            "mqtt.qos_state must be 0, 1 or 2 (got {})",
            mqtt.qos_state
        )));
    }
    if mqtt.qos_cmd > 2 {
        return Err(BridgeError::validation(format!(
            "mqtt.qos_cmd must be 0, 1 or 2 (got {})",
            mqtt.qos_cmd
        )));
    }
    if mqtt.connect_timeout_secs == 0 {
        return Err(BridgeError::validation(
            "mqtt.connect_timeout_secs must be greater than zero",
        ));
    }
    Ok(())
}

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};

/// Common MQTT connection configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MqttConfig {
    /// Broker host name or IP address.
    pub host: String,

    /// Broker TCP port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Optional user name for broker authentication.
    #[serde(default)]
    pub username: Option<String>,

    /// Optional password (only used together with `username`).
    #[serde(default)]
    pub password: Option<String>,

    /// MQTT client identifier. Generated when absent.
    #[serde(default)]
    pub client_id: Option<String>,

    /// Prefix for every topic the bridge publishes or subscribes to.
    pub topic_prefix: String,

    /// QoS used for value (state) publishes.
    #[serde(default)]
    pub qos_state: u8,

    /// QoS used for the command subscription.
    #[serde(default = "default_qos_cmd")]
    pub qos_cmd: u8,

    /// Whether value publishes are retained by the broker.
    #[serde(default = "default_true")]
    pub retain_states: bool,

    /// Keep-alive interval in seconds.
    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u64,

    /// How long to wait for the first CONNACK before giving up.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_port() -> u16 {
    1883
}

fn default_qos_cmd() -> u8 {
    1
}

fn default_true() -> bool {
    true
}

fn default_keepalive() -> u64 {
    60
}

fn default_connect_timeout() -> u64 {
    10
}

impl MqttConfig {
    /// Topic prefix without trailing slashes.
    pub fn prefix(&self) -> &str {
        self.topic_prefix.trim_end_matches('/')
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: default_port(),
            username: None,
            password: None,
            client_id: None,
            topic_prefix: "opcua".to_string(),
            qos_state: 0,
            qos_cmd: default_qos_cmd(),
            retain_states: true,
            keepalive_secs: default_keepalive(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable text format (default).
    #[default]
    Text,
    /// Structured JSON format.
    Json,
}

/// Common logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log output format: "text" or "json".
    #[serde(default)]
    pub format: LogFormat,

    /// Level for the OPC UA client stack.
    #[serde(default = "default_library_level")]
    pub opcua: String,

    /// Level for the MQTT client stack.
    #[serde(default = "default_library_level")]
    pub mqtt: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_library_level() -> String {
    "warn".to_string()
}

impl LoggingConfig {
    /// Build the `EnvFilter` directive string for this configuration.
    pub fn filter_directives(&self) -> String {
        format!(
            "{},opcua={},rumqttc={}",
            self.level.to_lowercase(),
            self.opcua.to_lowercase(),
            self.mqtt.to_lowercase()
        )
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            opcua: default_library_level(),
            mqtt: default_library_level(),
        }
    }
}

/// Load a configuration file in JSON5 format.
pub fn load_config<T: for<'de> Deserialize<'de>>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!(
            "Failed to read config file '{}': {}",
            path.display(),
            e
        ))
    })?;

    json5::from_str(&content).map_err(|e| {
        Error::Config(format!(
            "Failed to parse config file '{}': {}",
            path.display(),
            e
        ))
    })
}

/// Load a configuration from a JSON5 string.
pub fn parse_config<T: for<'de> Deserialize<'de>>(content: &str) -> Result<T> {
    json5::from_str(content).map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
}

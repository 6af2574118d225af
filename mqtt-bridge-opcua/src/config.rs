//! Configuration for the OPC UA bridge.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uamqtt_bridge_framework::{BridgeConfig, BridgeError, validate_mqtt};
use uamqtt_common::{LoggingConfig, MqttConfig};

use crate::security::{SecurityMode, SecurityPolicy};

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Validation error: {0}")]
    Validation(String),
}

impl From<ConfigError> for BridgeError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Validation(msg) => BridgeError::validation(msg),
        }
    }
}

/// Complete bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpcUaBridgeConfig {
    /// MQTT connection settings
    pub mqtt: MqttConfig,

    /// OPC UA server settings
    pub opcua: OpcUaConfig,

    /// Tag catalog and discovery settings
    #[serde(default)]
    pub bridge: BridgeSettings,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// OPC UA connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpcUaConfig {
    /// Endpoint URL (e.g., "opc.tcp://192.168.0.10:4840")
    pub url: String,

    /// Security policy: None, Basic128Rsa15, Basic256, Basic256Sha256
    #[serde(default = "default_none")]
    pub security_policy: String,

    /// Security mode: None, Sign, SignAndEncrypt
    #[serde(default = "default_none")]
    pub security_mode: String,

    /// User name for a user-name identity token (anonymous when absent)
    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Subscription publishing interval in milliseconds
    #[serde(default = "default_publishing_interval")]
    pub publishing_interval_ms: u64,

    /// Accept the server certificate without pinning
    #[serde(default = "default_true")]
    pub auto_trust_server: bool,

    /// Explicit application URI. Only honoured if it starts with `urn:`.
    #[serde(default)]
    pub application_uri: Option<String>,

    /// Suffix of the generated application URI `urn:<hostname>:HA:<suffix>`
    #[serde(default = "default_uri_suffix")]
    pub application_uri_suffix: String,

    /// Directory holding the client certificate, key and trusted server cert
    #[serde(default = "default_pki_dir")]
    pub pki_dir: PathBuf,

    /// Log every advertised endpoint before connecting
    #[serde(default)]
    pub log_endpoints: bool,
}

fn default_none() -> String {
    "None".to_string()
}

fn default_publishing_interval() -> u64 {
    200
}

fn default_true() -> bool {
    true
}

fn default_uri_suffix() -> String {
    "OPCUA2MQTT".to_string()
}

fn default_pki_dir() -> PathBuf {
    PathBuf::from("/data/pki")
}

impl OpcUaConfig {
    /// Publishing interval as a duration.
    pub fn publishing_interval(&self) -> Duration {
        Duration::from_millis(self.publishing_interval_ms)
    }
}

/// Tag catalog, discovery and reconnect settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeSettings {
    /// YAML tag catalog
    #[serde(default = "default_tags_file")]
    pub tags_file: PathBuf,

    /// Walk the address space once when no export exists or the catalog is empty
    #[serde(default)]
    pub auto_export_on_first_run: bool,

    /// Raw structure export (JSON)
    #[serde(default = "default_export_file")]
    pub export_file: PathBuf,

    /// Generated catalog (YAML)
    #[serde(default = "default_generated_tags_file")]
    pub generated_tags_file: PathBuf,

    /// Append newly discovered nodes to `tags_file`
    #[serde(default = "default_true")]
    pub merge_into_tags_file: bool,

    #[serde(default)]
    pub browse: BrowseConfig,

    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

fn default_tags_file() -> PathBuf {
    PathBuf::from("/config/opcua_mqtt_bridge/tags.yaml")
}

fn default_export_file() -> PathBuf {
    PathBuf::from("/config/opcua_mqtt_bridge/opcua-structure.json")
}

fn default_generated_tags_file() -> PathBuf {
    PathBuf::from("/config/opcua_mqtt_bridge/tags.generated.yaml")
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            tags_file: default_tags_file(),
            auto_export_on_first_run: false,
            export_file: default_export_file(),
            generated_tags_file: default_generated_tags_file(),
            merge_into_tags_file: true,
            browse: BrowseConfig::default(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// Address space walk settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowseConfig {
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,

    /// Namespaces whose variables are recorded. Empty records all.
    #[serde(default = "default_namespace_filter")]
    pub namespace_filter: Vec<u16>,

    #[serde(default = "default_exclude_prefixes")]
    pub exclude_path_prefixes: Vec<String>,

    /// Allowed top-level segment prefixes. Empty allows all.
    #[serde(default = "default_include_prefixes")]
    pub include_only_prefixes: Vec<String>,
}

fn default_max_depth() -> usize {
    12
}

fn default_namespace_filter() -> Vec<u16> {
    vec![3]
}

fn default_exclude_prefixes() -> Vec<String> {
    vec!["Server/".to_string(), "ServerStatus/".to_string()]
}

fn default_include_prefixes() -> Vec<String> {
    vec!["DB".to_string(), "DataBlocksGlobal".to_string()]
}

impl Default for BrowseConfig {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            namespace_filter: default_namespace_filter(),
            exclude_path_prefixes: default_exclude_prefixes(),
            include_only_prefixes: default_include_prefixes(),
        }
    }
}

/// Device reconnect backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_initial_delay")]
    pub initial_delay_secs: u64,

    #[serde(default = "default_max_delay")]
    pub max_delay_secs: u64,
}

fn default_initial_delay() -> u64 {
    1
}

fn default_max_delay() -> u64 {
    30
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_secs: default_initial_delay(),
            max_delay_secs: default_max_delay(),
        }
    }
}

impl OpcUaBridgeConfig {
    /// Validate the OPC UA and bridge sections.
    pub fn validate_settings(&self) -> Result<(), ConfigError> {
        if self.opcua.url.trim().is_empty() {
            return Err(ConfigError::Validation(
                "opcua.url must not be empty".to_string(),
            ));
        }

        if self.opcua.publishing_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "opcua.publishing_interval_ms must be greater than zero".to_string(),
            ));
        }

        self.opcua
            .security_policy
            .parse::<SecurityPolicy>()
            .map_err(|e| ConfigError::Validation(e.to_string()))?;
        self.opcua
            .security_mode
            .parse::<SecurityMode>()
            .map_err(|e| ConfigError::Validation(e.to_string()))?;

        let reconnect = &self.bridge.reconnect;
        if reconnect.initial_delay_secs == 0 {
            return Err(ConfigError::Validation(
                "bridge.reconnect.initial_delay_secs must be greater than zero".to_string(),
            ));
        }
        if reconnect.initial_delay_secs > reconnect.max_delay_secs {
            return Err(ConfigError::Validation(format!(
                "bridge.reconnect.initial_delay_secs ({}) exceeds max_delay_secs ({})",
                reconnect.initial_delay_secs, reconnect.max_delay_secs
            )));
        }

        Ok(())
    }
}

impl BridgeConfig for OpcUaBridgeConfig {
    fn mqtt(&self) -> &MqttConfig {
        &self.mqtt
    }

    fn logging(&self) -> &LoggingConfig {
        &self.logging
    }

    fn validate(&self) -> uamqtt_bridge_framework::Result<()> {
        validate_mqtt(&self.mqtt)?;
        self.validate_settings()?;
        Ok(())
    }
}

//! Integration tests for uamqtt-common library.

use std::io::Write;

use uamqtt_common::{LogFormat, LoggingConfig, MqttConfig, TopicBuilder, load_config};

#[derive(Debug, serde::Deserialize)]
struct TestConfig {
    mqtt: MqttConfig,
    #[serde(default)]
    logging: LoggingConfig,
}

#[test]
fn test_load_config_from_file() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    write!(
        file,
        r#"{{
            // comments are allowed in JSON5
            mqtt: {{ host: "broker", topic_prefix: "ha/opcua" }},
            logging: {{ format: "json" }},
        }}"#
    )
    .expect("write config");

    let config: TestConfig = load_config(file.path()).expect("load config");

    assert_eq!(config.mqtt.host, "broker");
    assert_eq!(config.mqtt.prefix(), "ha/opcua");
    assert_eq!(config.logging.format, LogFormat::Json);
    assert_eq!(config.logging.level, "info");
}

#[test]
fn test_load_missing_config() {
    let result: uamqtt_common::Result<TestConfig> = load_config("/nonexistent/bridge.json5");
    let err = result.unwrap_err().to_string();

    assert!(err.contains("Failed to read config file"));
}

#[test]
fn test_topics_from_config_prefix() {
    let mqtt = MqttConfig {
        topic_prefix: "site/opcua/".to_string(),
        ..Default::default()
    };
    let topics = TopicBuilder::new(mqtt.prefix());

    let set = topics.set("zone1/setpoint");
    assert_eq!(set, "site/opcua/zone1/setpoint/set");
    assert_eq!(topics.parse_command(&set), Some("zone1/setpoint"));
    assert_eq!(topics.availability(), "site/opcua/meta/availability");
}

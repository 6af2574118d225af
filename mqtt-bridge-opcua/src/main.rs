//! MQTT bridge for OPC UA servers.

use mqtt_bridge_opcua::config::OpcUaBridgeConfig;
use mqtt_bridge_opcua::client::OpcUaConnector;
use mqtt_bridge_opcua::session::BridgeSession;
use uamqtt_bridge_framework::{MqttBus, run_bridge};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    run_bridge::<OpcUaBridgeConfig, _, _>(
        "opcua",
        "opcua-mqtt-bridge.json5",
        |config, shutdown| async move {
            let connector = OpcUaConnector::new(config.opcua.clone());
            let bus = MqttBus::new(config.mqtt.clone());
            BridgeSession::new(config, connector, bus)
                .run(shutdown)
                .await?;
            Ok(())
        },
    )
    .await
}

//! Shared test doubles for the bridge session tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use mqtt_bridge_opcua::config::OpcUaBridgeConfig;
use mqtt_bridge_opcua::device::{
    AddressSpace, BrowseNode, DeviceConnector, DeviceError, DeviceEvent, DeviceSession,
    VariableInfo, WriteError,
};
use mqtt_bridge_opcua::payload::DeviceValue;
use mqtt_bridge_opcua::security::SecurityPlan;
use mqtt_bridge_opcua::session::{BridgeSession, SessionError, SessionState};
use uamqtt_bridge_framework::{
    AvailabilityPublisher, BusConnector, BusLink, BusMessage, BusPublisher, QoS, Result,
    TopicBuilder,
};

pub const PREFIX: &str = "opcua";

pub const TAGS: &str = r#"
read:
  - path: db1/temp
    node: ns=3;s=DB1.Temp
    type: float
rw:
  - path: db1/setpoint
    node: ns=3;s=DB1.Setpoint
    type: float
  - path: db1/count
    node: ns=3;s=DB1.Count
    type: uint16
"#;

/// Records everything published on the bus.
#[derive(Default)]
pub struct Recorder {
    messages: Mutex<Vec<(String, String, QoS, bool)>>,
    disconnected: AtomicBool,
}

impl Recorder {
    pub fn messages(&self) -> Vec<(String, String, QoS, bool)> {
        self.messages.lock().unwrap().clone()
    }

    pub fn payloads(&self, topic: &str) -> Vec<String> {
        self.messages()
            .into_iter()
            .filter(|(t, ..)| t == topic)
            .map(|(_, payload, ..)| payload)
            .collect()
    }

    pub fn availability(&self) -> Vec<String> {
        self.payloads(&format!("{PREFIX}/meta/availability"))
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BusPublisher for Recorder {
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS, retain: bool) -> Result<()> {
        self.messages.lock().unwrap().push((
            topic.to_string(),
            String::from_utf8(payload).unwrap(),
            qos,
            retain,
        ));
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.disconnected.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Bus connector handing out the recorder and a command channel.
pub struct TestBus {
    recorder: Arc<Recorder>,
    inbound: Mutex<Option<mpsc::Receiver<BusMessage>>>,
}

#[async_trait]
impl BusConnector for TestBus {
    async fn connect(&self) -> Result<BusLink> {
        let inbound = self.inbound.lock().unwrap().take().unwrap();
        let publisher: Arc<dyn BusPublisher> = self.recorder.clone();
        Ok(BusLink {
            availability: AvailabilityPublisher::new(
                publisher.clone(),
                TopicBuilder::new(PREFIX).availability(),
            ),
            publisher,
            inbound,
        })
    }
}

/// Shared state behind the mock connector and its sessions.
#[derive(Default)]
pub struct DeviceLink {
    pub writes: Mutex<Vec<(String, DeviceValue)>>,
    pub subscriptions: Mutex<Vec<Vec<String>>>,
    pub connects: Mutex<Vec<Instant>>,
    pub unsubscribes: AtomicUsize,
    pub disconnects: AtomicUsize,
    pub failures_left: AtomicUsize,
    pub subscribe_delay: Option<Duration>,
    events: Mutex<Option<mpsc::UnboundedSender<DeviceEvent>>>,
    live: Mutex<Option<Arc<AtomicBool>>>,
    tree: HashMap<String, Vec<BrowseNode>>,
    info: HashMap<String, VariableInfo>,
}

impl DeviceLink {
    pub fn with_tree(
        tree: HashMap<String, Vec<BrowseNode>>,
        info: HashMap<String, VariableInfo>,
    ) -> Self {
        Self {
            tree,
            info,
            ..Default::default()
        }
    }

    /// Make the next `count` connection attempts fail.
    pub fn fail_next(&self, count: usize) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    /// Drop the transport of the current session.
    pub fn drop_connection(&self) {
        if let Some(live) = self.live.lock().unwrap().as_ref() {
            live.store(false, Ordering::SeqCst);
        }
    }

    /// Deliver an event on the current session.
    pub fn emit(&self, event: DeviceEvent) {
        if let Some(events) = self.events.lock().unwrap().as_ref() {
            let _ = events.send(event);
        }
    }

    pub fn connect_count(&self) -> usize {
        self.connects.lock().unwrap().len()
    }

    pub fn writes(&self) -> Vec<(String, DeviceValue)> {
        self.writes.lock().unwrap().clone()
    }

    pub fn subscriptions(&self) -> Vec<Vec<String>> {
        self.subscriptions.lock().unwrap().clone()
    }
}

pub struct MockConnector {
    link: Arc<DeviceLink>,
}

#[async_trait]
impl DeviceConnector for MockConnector {
    type Session = MockSession;

    async fn connect(
        &self,
        _plan: &SecurityPlan,
        events: mpsc::UnboundedSender<DeviceEvent>,
    ) -> std::result::Result<MockSession, DeviceError> {
        self.link.connects.lock().unwrap().push(Instant::now());

        let failing = self
            .link
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(DeviceError::Connect("connection refused".to_string()));
        }

        let connected = Arc::new(AtomicBool::new(true));
        *self.link.live.lock().unwrap() = Some(connected.clone());
        *self.link.events.lock().unwrap() = Some(events);
        Ok(MockSession {
            link: self.link.clone(),
            connected,
        })
    }
}

pub struct MockSession {
    link: Arc<DeviceLink>,
    connected: Arc<AtomicBool>,
}

#[async_trait]
impl AddressSpace for MockSession {
    fn root(&self) -> String {
        "i=85".to_string()
    }

    async fn children(&self, address: &str) -> std::result::Result<Vec<BrowseNode>, DeviceError> {
        Ok(self.link.tree.get(address).cloned().unwrap_or_default())
    }

    async fn variable_info(&self, address: &str) -> VariableInfo {
        self.link.info.get(address).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl DeviceSession for MockSession {
    fn endpoint(&self) -> &str {
        "opc.tcp://plc:4840"
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn canonical_address(&self, address: &str) -> String {
        address.trim().trim_start_matches("ns=0;").to_string()
    }

    async fn subscribe(
        &self,
        addresses: &[String],
        _publishing_interval: Duration,
    ) -> std::result::Result<usize, DeviceError> {
        if let Some(delay) = self.link.subscribe_delay {
            tokio::time::sleep(delay).await;
        }
        self.link
            .subscriptions
            .lock()
            .unwrap()
            .push(addresses.to_vec());
        Ok(addresses.len())
    }

    async fn unsubscribe(&self) {
        self.link.unsubscribes.fetch_add(1, Ordering::SeqCst);
    }

    async fn write(&self, address: &str, value: DeviceValue) -> std::result::Result<(), WriteError> {
        self.link
            .writes
            .lock()
            .unwrap()
            .push((address.to_string(), value));
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.link.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}

/// Build a configuration rooted in `dir`, optionally writing a tag catalog.
pub fn config(dir: &Path, tags: Option<&str>, auto_export: bool) -> OpcUaBridgeConfig {
    let tags_file = dir.join("tags.yaml");
    if let Some(tags) = tags {
        std::fs::write(&tags_file, tags).unwrap();
    }

    let json = format!(
        r#"{{
            mqtt: {{ host: "broker", topic_prefix: "{PREFIX}" }},
            opcua: {{ url: "opc.tcp://plc:4840" }},
            bridge: {{
                tags_file: "{}",
                export_file: "{}",
                generated_tags_file: "{}",
                auto_export_on_first_run: {auto_export},
                reconnect: {{ initial_delay_secs: 1, max_delay_secs: 30 }},
            }},
        }}"#,
        tags_file.display(),
        dir.join("export.json").display(),
        dir.join("generated.yaml").display(),
    );
    json5::from_str(&json).unwrap()
}

/// A running bridge session with handles on both sides.
pub struct Harness {
    pub recorder: Arc<Recorder>,
    pub commands: mpsc::Sender<BusMessage>,
    pub link: Arc<DeviceLink>,
    pub shutdown: CancellationToken,
    pub state: watch::Receiver<SessionState>,
    pub handle: JoinHandle<std::result::Result<(), SessionError>>,
    pub dir: TempDir,
}

impl Harness {
    pub fn start(dir: TempDir, config: OpcUaBridgeConfig, link: DeviceLink) -> Self {
        let recorder = Arc::new(Recorder::default());
        let (commands, inbound) = mpsc::channel(16);
        let link = Arc::new(link);

        let bus = TestBus {
            recorder: recorder.clone(),
            inbound: Mutex::new(Some(inbound)),
        };
        let connector = MockConnector { link: link.clone() };
        let session = BridgeSession::new(config, connector, bus);
        let state = session.subscribe_state();

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(session.run(shutdown.clone()));

        Self {
            recorder,
            commands,
            link,
            shutdown,
            state,
            handle,
            dir,
        }
    }

    pub async fn wait_state(&mut self, state: SessionState) {
        tokio::time::timeout(Duration::from_secs(120), self.state.wait_for(|s| *s == state))
            .await
            .expect("state not reached")
            .unwrap();
    }

    pub async fn command(&self, path: &str, payload: &str, retain: bool) {
        self.commands
            .send(BusMessage {
                topic: format!("{PREFIX}/{path}/set"),
                payload: payload.as_bytes().to_vec(),
                retain,
            })
            .await
            .unwrap();
    }
}

/// Poll `check` on virtual time until it holds.
pub async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

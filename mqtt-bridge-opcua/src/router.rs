//! Message routing between the device and the bus.
//!
//! Device notifications are rendered and published on state topics. Bus
//! commands on `<path>/set` are decoded against the catalog type and written
//! to the device, one at a time, each as its own cancellable task.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinSet;
use uamqtt_bridge_framework::{BusMessage, BusPublisher, QoS, TopicBuilder};

use crate::catalog::{Direction, TagBinding};
use crate::device::DeviceSession;
use crate::payload::{DeviceValue, TypeTag, decode_command};

/// Error text published when a command arrives while the device is not active.
pub const DEVICE_OFFLINE: &str = "device offline";

/// Status text published after a successful write.
pub const WRITE_OK: &str = "ok";

/// Where a command for a path is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteTarget {
    pub address: String,
    pub type_tag: TypeTag,
}

/// Routes derived from the catalog. Built once per subscription and
/// replaced wholesale.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteTable {
    /// device address -> bus path
    notify: HashMap<String, String>,
    /// bus path -> write target (rw entries only)
    writes: HashMap<String, WriteTarget>,
}

impl RouteTable {
    /// Build routes from catalog bindings. Later bindings win on collisions.
    pub fn from_bindings(bindings: &[TagBinding]) -> Self {
        let mut table = Self::default();

        for binding in bindings {
            table
                .notify
                .insert(binding.device_address.clone(), binding.path.clone());

            if binding.direction == Direction::ReadWrite {
                table.writes.insert(
                    binding.path.clone(),
                    WriteTarget {
                        address: binding.device_address.clone(),
                        type_tag: binding.type_tag,
                    },
                );
            }
        }
        table
    }

    pub fn path_for(&self, address: &str) -> Option<&str> {
        self.notify.get(address).map(String::as_str)
    }

    pub fn write_target(&self, path: &str) -> Option<&WriteTarget> {
        self.writes.get(path)
    }

    pub fn is_empty(&self) -> bool {
        self.notify.is_empty()
    }
}

/// Bus publishing settings used by the router.
#[derive(Debug, Clone)]
pub struct RouterSettings {
    pub topics: TopicBuilder,
    pub qos_state: QoS,
    pub retain_states: bool,
}

struct ActiveRoutes<S> {
    routes: Arc<RouteTable>,
    device: Arc<S>,
}

/// Bidirectional translator between device and bus.
pub struct MessageRouter<S: DeviceSession> {
    settings: RouterSettings,
    publisher: Arc<dyn BusPublisher>,
    /// rw paths from the last loaded catalog, used to answer while offline
    known_paths: HashSet<String>,
    active: Option<ActiveRoutes<S>>,
    gate: Arc<Mutex<()>>,
    pending: JoinSet<()>,
}

impl<S: DeviceSession> MessageRouter<S> {
    pub fn new(settings: RouterSettings, publisher: Arc<dyn BusPublisher>) -> Self {
        Self {
            settings,
            publisher,
            known_paths: HashSet::new(),
            active: None,
            gate: Arc::new(Mutex::new(())),
            pending: JoinSet::new(),
        }
    }

    /// Remember which paths accept commands, from the latest catalog.
    pub fn set_known_paths(&mut self, bindings: &[TagBinding]) {
        self.known_paths = bindings
            .iter()
            .filter(|b| b.direction == Direction::ReadWrite)
            .map(|b| b.path.clone())
            .collect();
    }

    /// Start routing to an active device session.
    pub fn activate(&mut self, routes: RouteTable, device: Arc<S>) {
        self.active = Some(ActiveRoutes {
            routes: Arc::new(routes),
            device,
        });
    }

    /// Drop the routes and cancel every in-flight write.
    pub fn deactivate(&mut self) {
        self.active = None;

        let cancelled = self.pending.len();
        self.pending.abort_all();
        if cancelled > 0 {
            tracing::info!(cancelled, "Cancelled pending writes");
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Number of writes that have not finished yet.
    pub fn pending_writes(&self) -> usize {
        self.pending.len()
    }

    /// Collect finished write tasks.
    pub fn reap(&mut self) {
        while let Some(result) = self.pending.try_join_next() {
            if let Err(e) = result {
                if e.is_panic() {
                    tracing::error!(error = %e, "Write task panicked");
                }
            }
        }
    }

    /// Publish a device notification on its state topic.
    pub async fn handle_notification(&self, address: &str, value: &DeviceValue) {
        let Some(active) = &self.active else {
            return;
        };
        let Some(path) = active.routes.path_for(address) else {
            tracing::trace!(node = %address, "Notification for unbound node dropped");
            return;
        };

        let topic = self.settings.topics.value(path);
        if let Err(e) = self
            .publisher
            .publish(
                &topic,
                value.render(),
                self.settings.qos_state,
                self.settings.retain_states,
            )
            .await
        {
            tracing::warn!(topic = %topic, error = %e, "Failed to publish state");
        }
    }

    /// Handle an inbound bus message.
    pub async fn handle_command(&mut self, message: BusMessage) {
        let Some(path) = self.settings.topics.parse_command(&message.topic) else {
            return;
        };
        let path = path.to_string();

        if message.retain {
            tracing::debug!(path = %path, "Ignoring retained command");
            return;
        }

        let Some(active) = &self.active else {
            if self.known_paths.contains(&path) {
                tracing::warn!(path = %path, "Command rejected, device offline");
                self.publish_error(&path, DEVICE_OFFLINE).await;
            }
            return;
        };

        let Some(target) = active.routes.write_target(&path).cloned() else {
            tracing::debug!(path = %path, "Command for unmapped path ignored");
            return;
        };

        let payload = message.payload_str();
        let value = match decode_command(&payload, target.type_tag) {
            Ok(value) => value,
            Err(e) => {
                tracing::error!(path = %path, payload = %payload, error = %e, "Invalid command payload");
                self.publish_error(&path, &e.to_string()).await;
                return;
            }
        };

        tracing::debug!(path = %path, node = %target.address, value = %value, "Writing value");

        let device = active.device.clone();
        let gate = self.gate.clone();
        let publisher = self.publisher.clone();
        let topics = self.settings.topics.clone();

        self.pending.spawn(async move {
            let result = {
                let _guard = gate.lock().await;
                device.write(&target.address, value).await
            };

            let (topic, text) = match result {
                Ok(()) => (topics.status(&path), WRITE_OK.to_string()),
                Err(e) => {
                    tracing::error!(path = %path, node = %target.address, error = %e, "Write failed");
                    (topics.error(&path), e.to_string())
                }
            };

            if let Err(e) = publisher
                .publish(&topic, text.into_bytes(), QoS::AtLeastOnce, false)
                .await
            {
                tracing::warn!(topic = %topic, error = %e, "Failed to publish write outcome");
            }
        });
    }

    async fn publish_error(&self, path: &str, text: &str) {
        let topic = self.settings.topics.error(path);
        if let Err(e) = self
            .publisher
            .publish(&topic, text.as_bytes().to_vec(), QoS::AtLeastOnce, false)
            .await
        {
            tracing::warn!(topic = %topic, error = %e, "Failed to publish error");
        }
    }
}

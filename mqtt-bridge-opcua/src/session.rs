//! Bridge session state machine.
//!
//! ```text
//! Init -> ConnectingBus -> ConnectingDevice -> Securing -> Subscribing -> Active
//!                               ^                                          |
//!                               +------------- Reconnecting <--------------+
//! any state --stop--> Stopping -> Terminated
//! ```
//!
//! The bus connection is established once and kept for the lifetime of the
//! session. The device side is reconnected with exponential backoff whenever
//! connecting, subscribing or the running session fails.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uamqtt_bridge_framework::{
    AvailabilityPublisher, BridgeError, BusConnector, BusLink, BusMessage, BusPublisher,
    TopicBuilder, qos_level,
};

use crate::catalog::{CatalogError, TagBinding, TagCatalog};
use crate::config::OpcUaBridgeConfig;
use crate::device::{DeviceConnector, DeviceError, DeviceEvent, DeviceSession};
use crate::discovery;
use crate::router::{MessageRouter, RouteTable, RouterSettings};
use crate::security::{SecurityError, SecurityNegotiator};

/// Interval of the device liveness check while active.
pub const LIVENESS_INTERVAL: Duration = Duration::from_secs(1);

/// Fatal session errors.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Bus(#[from] BridgeError),

    #[error(transparent)]
    Security(#[from] SecurityError),

    #[error("MQTT network loop stopped")]
    BusClosed,
}

/// Lifecycle state of the bridge session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    ConnectingBus,
    ConnectingDevice,
    Securing,
    Subscribing,
    Active,
    Reconnecting,
    Stopping,
    Terminated,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Init => "init",
            SessionState::ConnectingBus => "connecting_bus",
            SessionState::ConnectingDevice => "connecting_device",
            SessionState::Securing => "securing",
            SessionState::Subscribing => "subscribing",
            SessionState::Active => "active",
            SessionState::Reconnecting => "reconnecting",
            SessionState::Stopping => "stopping",
            SessionState::Terminated => "terminated",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Doubling reconnect delay with an upper bound.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// The delay to wait now. Doubles the following one, up to the maximum.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Why a device attempt or an active session ended.
enum Interrupt {
    Stop,
    Fault(String),
}

enum AttemptError {
    Fatal(SessionError),
    Device(DeviceError),
}

impl From<DeviceError> for AttemptError {
    fn from(err: DeviceError) -> Self {
        AttemptError::Device(err)
    }
}

impl From<CatalogError> for AttemptError {
    fn from(err: CatalogError) -> Self {
        AttemptError::Device(err.into())
    }
}

impl From<SessionError> for AttemptError {
    fn from(err: SessionError) -> Self {
        AttemptError::Fatal(err)
    }
}

impl From<SecurityError> for AttemptError {
    fn from(err: SecurityError) -> Self {
        AttemptError::Fatal(err.into())
    }
}

/// A device session that completed subscribing.
struct Connected<S> {
    device: Arc<S>,
    events: mpsc::UnboundedReceiver<DeviceEvent>,
    bindings: Vec<TagBinding>,
    monitored: usize,
}

/// The bridge session.
pub struct BridgeSession<C: DeviceConnector, B: BusConnector> {
    config: OpcUaBridgeConfig,
    connector: C,
    bus: B,
    negotiator: SecurityNegotiator,
    state: watch::Sender<SessionState>,
}

impl<C: DeviceConnector, B: BusConnector> BridgeSession<C, B> {
    pub fn new(config: OpcUaBridgeConfig, connector: C, bus: B) -> Self {
        let negotiator = SecurityNegotiator::from_config(&config.opcua);
        Self::with_negotiator(config, connector, bus, negotiator)
    }

    pub fn with_negotiator(
        config: OpcUaBridgeConfig,
        connector: C,
        bus: B,
        negotiator: SecurityNegotiator,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Init);
        Self {
            config,
            connector,
            bus,
            negotiator,
            state,
        }
    }

    /// Watch the session state.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    fn set_state(&self, next: SessionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::info!(from = %previous, to = %next, "Session state changed");
        }
    }

    /// Run until `shutdown` is cancelled or a fatal error occurs.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), SessionError> {
        self.set_state(SessionState::ConnectingBus);
        let link = tokio::select! {
            result = self.bus.connect() => result,
            _ = shutdown.cancelled() => {
                self.set_state(SessionState::Stopping);
                self.set_state(SessionState::Terminated);
                return Ok(());
            }
        };
        let BusLink {
            publisher,
            mut inbound,
            availability,
        } = match link {
            Ok(link) => link,
            Err(e) => {
                self.set_state(SessionState::Terminated);
                return Err(e.into());
            }
        };

        let settings = RouterSettings {
            topics: TopicBuilder::new(self.config.mqtt.prefix()),
            qos_state: qos_level(self.config.mqtt.qos_state),
            retain_states: self.config.mqtt.retain_states,
        };
        let mut router: MessageRouter<C::Session> = MessageRouter::new(settings, publisher.clone());

        let reconnect = &self.config.bridge.reconnect;
        let mut backoff = Backoff::new(
            Duration::from_secs(reconnect.initial_delay_secs),
            Duration::from_secs(reconnect.max_delay_secs),
        );
        let mut discovery_done = false;

        let outcome: Result<(), SessionError> = loop {
            // ConnectingDevice .. Subscribing
            let mut opened: Option<Arc<C::Session>> = None;
            let attempt = self
                .connect_device(&mut router, &mut inbound, &shutdown, &mut discovery_done, &mut opened)
                .await;

            let connected = match attempt {
                Ok(Some(connected)) => connected,
                Ok(None) => {
                    self.stop(&mut router, opened.as_deref(), &availability, publisher.as_ref())
                        .await;
                    return Ok(());
                }
                Err(AttemptError::Fatal(e)) => {
                    self.stop(&mut router, opened.as_deref(), &availability, publisher.as_ref())
                        .await;
                    return Err(e);
                }
                Err(AttemptError::Device(e)) => {
                    tracing::warn!(error = %e, "Device connection failed");
                    let paused = self
                        .reconnect_pause(
                            &mut router,
                            &availability,
                            &mut backoff,
                            &mut inbound,
                            &shutdown,
                            opened.as_deref(),
                        )
                        .await;
                    if let Err(e) = paused {
                        break Err(e);
                    }
                    if shutdown.is_cancelled() {
                        break Ok(());
                    }
                    continue;
                }
            };

            let Connected {
                device,
                mut events,
                bindings,
                monitored,
            } = connected;

            router.set_known_paths(&bindings);
            router.activate(RouteTable::from_bindings(&bindings), device.clone());
            if let Err(e) = availability.publish_online().await {
                tracing::warn!(error = %e, "Failed to publish availability");
            }
            backoff.reset();
            self.set_state(SessionState::Active);
            tracing::info!(
                endpoint = %device.endpoint(),
                tags = bindings.len(),
                monitored,
                "Bridge active"
            );

            let interrupt = self
                .run_active(&mut router, device.as_ref(), &mut events, &mut inbound, &shutdown)
                .await;

            match interrupt {
                Ok(Interrupt::Stop) => {
                    self.stop(&mut router, Some(device.as_ref()), &availability, publisher.as_ref())
                        .await;
                    return Ok(());
                }
                Ok(Interrupt::Fault(reason)) => {
                    tracing::warn!(reason = %reason, "Device session lost");
                    let paused = self
                        .reconnect_pause(
                            &mut router,
                            &availability,
                            &mut backoff,
                            &mut inbound,
                            &shutdown,
                            Some(device.as_ref()),
                        )
                        .await;
                    if let Err(e) = paused {
                        break Err(e);
                    }
                    if shutdown.is_cancelled() {
                        break Ok(());
                    }
                }
                Err(e) => {
                    self.stop(&mut router, Some(device.as_ref()), &availability, publisher.as_ref())
                        .await;
                    return Err(e);
                }
            }
        };

        self.stop(&mut router, None, &availability, publisher.as_ref()).await;
        outcome
    }

    /// Load the catalog, negotiate security, connect, discover and subscribe.
    ///
    /// Returns `Ok(None)` when a stop was requested. The session is stored in
    /// `opened` as soon as the connector returns it, so the caller can close
    /// it whatever happens afterwards.
    async fn connect_device(
        &self,
        router: &mut MessageRouter<C::Session>,
        inbound: &mut mpsc::Receiver<BusMessage>,
        shutdown: &CancellationToken,
        discovery_done: &mut bool,
        opened: &mut Option<Arc<C::Session>>,
    ) -> Result<Option<Connected<C::Session>>, AttemptError> {
        self.set_state(SessionState::ConnectingDevice);
        let settings = &self.config.bridge;
        let mut catalog = TagCatalog::load_or_empty(&settings.tags_file)?;
        router.set_known_paths(&catalog.bindings());

        self.set_state(SessionState::Securing);
        let plan = self.negotiator.negotiate(&self.config.opcua)?;

        let (events_tx, events) = mpsc::unbounded_channel();
        let connect = self.connector.connect(&plan, events_tx);
        let Some(device) = serve_commands(router, inbound, shutdown, connect).await? else {
            return Ok(None);
        };
        let device = Arc::new(device?);
        *opened = Some(device.clone());
        tracing::info!(endpoint = %device.endpoint(), "Connected to OPC UA server");

        if !*discovery_done && discovery::should_run(settings, &catalog) {
            *discovery_done = true;
            let discovery = discovery::run(device.as_ref(), settings, device.endpoint());
            let Some(report) = serve_commands(router, inbound, shutdown, discovery).await? else {
                return Ok(None);
            };
            match report {
                Ok(report) => {
                    tracing::info!(
                        variables = report.variables,
                        merged = report.merged,
                        "Discovery finished"
                    );
                    if report.merged > 0 {
                        catalog = TagCatalog::load_or_empty(&settings.tags_file)?;
                        router.set_known_paths(&catalog.bindings());
                    }
                }
                Err(e) => tracing::error!(error = %e, "Discovery failed"),
            }
        }

        self.set_state(SessionState::Subscribing);
        let bindings: Vec<TagBinding> = catalog
            .bindings()
            .into_iter()
            .map(|mut binding| {
                binding.device_address = device.canonical_address(&binding.device_address);
                binding
            })
            .collect();
        if bindings.is_empty() {
            tracing::warn!(path = %settings.tags_file.display(), "Tag catalog is empty");
        }

        let mut addresses: Vec<String> = Vec::with_capacity(bindings.len());
        for binding in &bindings {
            if !addresses.contains(&binding.device_address) {
                addresses.push(binding.device_address.clone());
            }
        }

        let subscribe = device.subscribe(&addresses, self.config.opcua.publishing_interval());
        let Some(monitored) = serve_commands(router, inbound, shutdown, subscribe).await? else {
            return Ok(None);
        };

        Ok(Some(Connected {
            device,
            events,
            bindings,
            monitored: monitored?,
        }))
    }

    /// Route traffic until the device faults or a stop is requested.
    async fn run_active(
        &self,
        router: &mut MessageRouter<C::Session>,
        device: &C::Session,
        events: &mut mpsc::UnboundedReceiver<DeviceEvent>,
        inbound: &mut mpsc::Receiver<BusMessage>,
        shutdown: &CancellationToken,
    ) -> Result<Interrupt, SessionError> {
        let mut liveness = tokio::time::interval(LIVENESS_INTERVAL);
        liveness.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(Interrupt::Stop),
                event = events.recv() => match event {
                    Some(DeviceEvent::DataChange { address, value }) => {
                        router.handle_notification(&address, &value).await;
                    }
                    Some(DeviceEvent::StatusFault(reason)) => return Ok(Interrupt::Fault(reason)),
                    None => return Ok(Interrupt::Fault("event stream closed".to_string())),
                },
                message = inbound.recv() => match message {
                    Some(message) => router.handle_command(message).await,
                    None => return Err(SessionError::BusClosed),
                },
                _ = liveness.tick() => {
                    router.reap();
                    if !device.is_connected() {
                        return Ok(Interrupt::Fault("connection lost".to_string()));
                    }
                }
            }
        }
    }

    /// Enter Reconnecting: drop routes, cancel writes, announce offline, wait.
    ///
    /// Commands arriving during the wait are answered with the offline error.
    async fn reconnect_pause(
        &self,
        router: &mut MessageRouter<C::Session>,
        availability: &AvailabilityPublisher,
        backoff: &mut Backoff,
        inbound: &mut mpsc::Receiver<BusMessage>,
        shutdown: &CancellationToken,
        stale: Option<&C::Session>,
    ) -> Result<(), SessionError> {
        self.set_state(SessionState::Reconnecting);
        router.deactivate();
        if let Err(e) = availability.publish_offline().await {
            tracing::warn!(error = %e, "Failed to publish availability");
        }
        if let Some(device) = stale {
            device.disconnect().await;
        }

        let delay = backoff.next_delay();
        tracing::warn!(delay_secs = delay.as_secs(), "Reconnecting to OPC UA server");

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return Ok(()),
                _ = shutdown.cancelled() => return Ok(()),
                message = inbound.recv() => match message {
                    Some(message) => router.handle_command(message).await,
                    None => return Err(SessionError::BusClosed),
                },
            }
        }
    }

    /// Enter Stopping and tear everything down.
    async fn stop(
        &self,
        router: &mut MessageRouter<C::Session>,
        device: Option<&C::Session>,
        availability: &AvailabilityPublisher,
        publisher: &dyn BusPublisher,
    ) {
        self.set_state(SessionState::Stopping);
        router.deactivate();

        if let Some(device) = device {
            device.unsubscribe().await;
            device.disconnect().await;
        }

        if let Err(e) = availability.publish_offline().await {
            tracing::warn!(error = %e, "Failed to publish availability");
        }
        if let Err(e) = publisher.disconnect().await {
            tracing::debug!(error = %e, "MQTT disconnect failed");
        }

        self.set_state(SessionState::Terminated);
    }
}

/// Drive `work` while answering commands, until it finishes or a stop is requested.
async fn serve_commands<S, F>(
    router: &mut MessageRouter<S>,
    inbound: &mut mpsc::Receiver<BusMessage>,
    shutdown: &CancellationToken,
    work: F,
) -> Result<Option<F::Output>, SessionError>
where
    S: DeviceSession,
    F: Future,
{
    tokio::pin!(work);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(None),
            output = &mut work => return Ok(Some(output)),
            message = inbound.recv() => match message {
                Some(message) => router.handle_command(message).await,
                None => return Err(SessionError::BusClosed),
            },
        }
    }
}

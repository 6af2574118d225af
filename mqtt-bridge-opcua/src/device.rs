//! Device-side abstraction.
//!
//! The bridge session talks to the device only through [`DeviceConnector`]
//! and [`DeviceSession`]. The OPC UA adapter implements them for real
//! servers; tests substitute an in-memory device.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::catalog::CatalogError;
use crate::payload::DeviceValue;
use crate::security::SecurityPlan;

/// Device session errors. Always recovered by reconnecting.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("Connect failed: {0}")]
    Connect(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Browse failed: {0}")]
    Browse(String),

    #[error("Session fault: {0}")]
    Fault(String),

    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

/// Write failures, reported on the path's error topic.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WriteError {
    #[error("Invalid node id: {0}")]
    InvalidAddress(String),

    #[error("Write rejected: {0}")]
    Rejected(String),

    #[error("Write failed: {0}")]
    Transport(String),
}

/// Events delivered by a device session.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// A monitored value changed.
    DataChange { address: String, value: DeviceValue },
    /// The server reported a subscription or session fault.
    StatusFault(String),
}

/// Node class as seen by the address space walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Object,
    Variable,
    Other,
}

/// One child reference returned by a browse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowseNode {
    pub address: String,
    pub namespace: u16,
    pub browse_name: String,
    pub display_name: Option<String>,
    pub kind: NodeKind,
}

/// Attributes of a variable node. Unreadable attributes are `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VariableInfo {
    pub data_type: Option<String>,
    pub access_level: Option<u8>,
}

/// Browsable device address space.
#[async_trait]
pub trait AddressSpace: Send + Sync {
    /// Address of the root objects container.
    fn root(&self) -> String;

    /// Hierarchical children of a node.
    async fn children(&self, address: &str) -> Result<Vec<BrowseNode>, DeviceError>;

    /// Data type and access level of a variable.
    async fn variable_info(&self, address: &str) -> VariableInfo;
}

/// A connected device session.
#[async_trait]
pub trait DeviceSession: AddressSpace + 'static {
    /// Endpoint URL the session is connected to.
    fn endpoint(&self) -> &str;

    /// Whether the transport is still up.
    fn is_connected(&self) -> bool;

    /// The form of `address` the session reports notifications under.
    fn canonical_address(&self, address: &str) -> String {
        address.trim().to_string()
    }

    /// Create the subscription and one monitored item per address.
    ///
    /// Items the server rejects are logged and skipped. Returns the number
    /// of items created.
    async fn subscribe(
        &self,
        addresses: &[String],
        publishing_interval: Duration,
    ) -> Result<usize, DeviceError>;

    /// Delete the subscription, if any.
    async fn unsubscribe(&self);

    /// Write one value.
    async fn write(&self, address: &str, value: DeviceValue) -> Result<(), WriteError>;

    /// Close the session.
    async fn disconnect(&self);
}

/// Opens device sessions.
#[async_trait]
pub trait DeviceConnector: Send + Sync {
    type Session: DeviceSession;

    /// Connect using `plan`. Notifications are delivered on `events`.
    async fn connect(
        &self,
        plan: &SecurityPlan,
        events: mpsc::UnboundedSender<DeviceEvent>,
    ) -> Result<Self::Session, DeviceError>;
}

//! OPC UA implementation of the device traits, on top of async-opcua.

use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{StreamExt, pin_mut};
use opcua::client::{
    ClientBuilder, IdentityToken, MonitoredItem, Password, Session, SessionEventLoop,
    SessionPollResult, SubscriptionCallbacks,
};
use opcua::crypto::SecurityPolicy as UaSecurityPolicy;
use opcua::types::enums::MonitoringMode;
use opcua::types::{
    AttributeId, BrowseDescription, BrowseDirection, ByteString, DataValue, EndpointDescription,
    Identifier, MessageSecurityMode, MonitoredItemCreateRequest, MonitoringParameters, NodeClass,
    NodeId, ObjectId, ReadValueId, ReferenceTypeId, StatusChangeNotification, TimestampsToReturn,
    UAString, Variant, WriteValue,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::OpcUaConfig;
use crate::device::{
    AddressSpace, BrowseNode, DeviceConnector, DeviceError, DeviceEvent, DeviceSession, NodeKind,
    VariableInfo, WriteError,
};
use crate::payload::DeviceValue;
use crate::security::{SecurityMode, SecurityPlan, SecurityPolicy, UserIdentity};

const APPLICATION_NAME: &str = "OPC UA MQTT Bridge";

/// Browse result mask requesting every reference field.
const BROWSE_RESULT_ALL: u32 = 0x3f;

const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

impl From<SecurityPolicy> for UaSecurityPolicy {
    fn from(policy: SecurityPolicy) -> Self {
        match policy {
            SecurityPolicy::None => UaSecurityPolicy::None,
            SecurityPolicy::Basic128Rsa15 => UaSecurityPolicy::Basic128Rsa15,
            SecurityPolicy::Basic256 => UaSecurityPolicy::Basic256,
            SecurityPolicy::Basic256Sha256 => UaSecurityPolicy::Basic256Sha256,
        }
    }
}

impl From<SecurityMode> for MessageSecurityMode {
    fn from(mode: SecurityMode) -> Self {
        match mode {
            SecurityMode::None => MessageSecurityMode::None,
            SecurityMode::Sign => MessageSecurityMode::Sign,
            SecurityMode::SignAndEncrypt => MessageSecurityMode::SignAndEncrypt,
        }
    }
}

impl From<&UserIdentity> for IdentityToken {
    fn from(user: &UserIdentity) -> Self {
        match user {
            UserIdentity::Anonymous => IdentityToken::Anonymous,
            UserIdentity::UserName { username, password } => {
                IdentityToken::UserName(username.clone(), Password::new(password.clone()))
            }
        }
    }
}

/// Connects to an OPC UA server.
#[derive(Debug, Clone)]
pub struct OpcUaConnector {
    config: OpcUaConfig,
}

impl OpcUaConnector {
    pub fn new(config: OpcUaConfig) -> Self {
        Self { config }
    }

    fn client_builder(&self, plan: &SecurityPlan) -> ClientBuilder {
        let mut builder = ClientBuilder::new()
            .application_name(APPLICATION_NAME)
            .application_uri(&plan.application_uri)
            .pki_dir(&self.config.pki_dir)
            .session_retry_limit(0)
            // Pinning is checked against the captured certificate before connecting.
            .trust_server_certs(true)
            .create_sample_keypair(false);

        if let Some(identity) = &plan.identity {
            builder = builder
                .certificate_path(&identity.cert_path)
                .private_key_path(&identity.key_path);
        }
        builder
    }

    /// Pick the endpoint matching the plan and point it at the configured host/port.
    fn select_endpoint(
        &self,
        endpoints: Vec<EndpointDescription>,
        plan: &SecurityPlan,
    ) -> Result<EndpointDescription, DeviceError> {
        let desired_policy = UaSecurityPolicy::from(plan.policy);
        let desired_mode = MessageSecurityMode::from(plan.mode);

        let mut selected = endpoints
            .into_iter()
            .find(|ep| {
                ep.security_mode == desired_mode
                    && UaSecurityPolicy::from_uri(ep.security_policy_uri.as_ref()) == desired_policy
            })
            .ok_or_else(|| {
                DeviceError::Connect(format!(
                    "no endpoint offers policy {} with mode {}",
                    plan.policy, plan.mode
                ))
            })?;

        if !plan.trust.accepts(selected.server_certificate.value.as_deref()) {
            return Err(DeviceError::Connect(
                "server certificate does not match the captured certificate".to_string(),
            ));
        }

        let advertised = selected.endpoint_url.to_string();
        if let Some(url) = override_host(self.config.url.trim(), &advertised) {
            selected.endpoint_url = url.into();
        }

        tracing::info!(
            endpoint_url = %selected.endpoint_url,
            advertised_url = %advertised,
            security_policy = %plan.policy,
            security_mode = %plan.mode,
            "Selected OPC UA endpoint"
        );
        Ok(selected)
    }
}

/// Replace the advertised endpoint's host, and port when given, with the configured one.
fn override_host(configured: &str, advertised: &str) -> Option<String> {
    let configured = Url::parse(configured).ok()?;
    let mut endpoint = Url::parse(advertised).ok()?;

    if let Some(host) = configured.host_str() {
        if let Err(e) = endpoint.set_host(Some(host)) {
            tracing::debug!(error = ?e, "Keeping advertised endpoint host");
        }
    }
    if let Some(port) = configured.port() {
        if endpoint.set_port(Some(port)).is_err() {
            tracing::debug!("Keeping advertised endpoint port");
        }
    }
    Some(endpoint.to_string())
}

#[async_trait]
impl DeviceConnector for OpcUaConnector {
    type Session = OpcUaSession;

    async fn connect(
        &self,
        plan: &SecurityPlan,
        events: mpsc::UnboundedSender<DeviceEvent>,
    ) -> Result<OpcUaSession, DeviceError> {
        let url = self.config.url.trim();
        let mut client = self
            .client_builder(plan)
            .client()
            .map_err(|e| DeviceError::Connect(format!("client setup failed: {e:?}")))?;

        let endpoints = client
            .get_server_endpoints_from_url(url)
            .await
            .map_err(|e| DeviceError::Connect(format!("get endpoints from {url}: {e}")))?;

        if self.config.log_endpoints {
            for ep in &endpoints {
                tracing::info!(
                    endpoint_url = %ep.endpoint_url,
                    security_policy_uri = %ep.security_policy_uri,
                    security_mode = ?ep.security_mode,
                    "OPC UA server endpoint"
                );
            }
        }

        let endpoint = self.select_endpoint(endpoints, plan)?;
        let (session, event_loop) = client
            .connect_to_endpoint_directly(endpoint, IdentityToken::from(&plan.user))
            .map_err(|e| DeviceError::Connect(e.to_string()))?;

        let connected = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();
        let (ready_tx, ready_rx) = oneshot::channel();
        let driver = tokio::spawn(drive_event_loop(
            event_loop,
            connected.clone(),
            ready_tx,
            events.clone(),
            cancel.clone(),
        ));

        if ready_rx.await.is_err() {
            cancel.cancel();
            return Err(DeviceError::Connect(
                "session closed before it became active".to_string(),
            ));
        }

        Ok(OpcUaSession {
            session,
            endpoint: url.to_string(),
            connected,
            events,
            subscription: std::sync::Mutex::new(None),
            cancel,
            driver,
        })
    }
}

/// Poll the session event loop, tracking connectivity.
async fn drive_event_loop(
    event_loop: SessionEventLoop,
    connected: Arc<AtomicBool>,
    ready: oneshot::Sender<()>,
    events: mpsc::UnboundedSender<DeviceEvent>,
    cancel: CancellationToken,
) {
    let stream = event_loop.enter();
    pin_mut!(stream);
    let mut ready = Some(ready);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            item = stream.next() => match item {
                Some(Ok(SessionPollResult::Reconnected(_) | SessionPollResult::Transport(_))) => {
                    connected.store(true, Ordering::Release);
                    if let Some(ready) = ready.take() {
                        let _ = ready.send(());
                    }
                }
                Some(Ok(SessionPollResult::ConnectionLost(code))) => {
                    let _ = events.send(DeviceEvent::StatusFault(format!("connection lost: {code}")));
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(code)) => {
                    let _ = events.send(DeviceEvent::StatusFault(format!("event loop error: {code}")));
                    break;
                }
                None => break,
            }
        }
    }

    connected.store(false, Ordering::Release);
}

/// A connected OPC UA session.
pub struct OpcUaSession {
    session: Arc<Session>,
    endpoint: String,
    connected: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<DeviceEvent>,
    subscription: std::sync::Mutex<Option<u32>>,
    cancel: CancellationToken,
    driver: JoinHandle<()>,
}

impl OpcUaSession {
    fn callbacks(&self) -> SubscriptionCallbacks {
        let faults = self.events.clone();
        let changes = self.events.clone();

        SubscriptionCallbacks::new(
            move |notification: StatusChangeNotification| {
                if notification.status.is_bad() {
                    let _ = faults.send(DeviceEvent::StatusFault(format!(
                        "subscription status {}",
                        notification.status
                    )));
                }
            },
            move |dv: DataValue, item: &MonitoredItem| {
                if dv.status.as_ref().is_some_and(|s| s.is_bad()) {
                    return;
                }
                let Some(variant) = dv.value.as_ref() else {
                    return;
                };
                let _ = changes.send(DeviceEvent::DataChange {
                    address: item.item_to_monitor().node_id.to_string(),
                    value: variant_to_value(variant),
                });
            },
            |_event, _item| {},
        )
    }

    async fn browse_all(&self, node_id: NodeId) -> Result<Vec<BrowseNode>, DeviceError> {
        let description = BrowseDescription {
            node_id,
            browse_direction: BrowseDirection::Forward,
            reference_type_id: ReferenceTypeId::HierarchicalReferences.into(),
            include_subtypes: true,
            node_class_mask: 0,
            result_mask: BROWSE_RESULT_ALL,
        };

        let mut results = self
            .session
            .browse(&[description], 0, None)
            .await
            .map_err(|e| DeviceError::Browse(e.to_string()))?;

        let mut nodes = Vec::new();
        while let Some(result) = results.pop() {
            for reference in result.references.unwrap_or_default() {
                let node_id = reference.node_id.node_id;
                nodes.push(BrowseNode {
                    address: node_id.to_string(),
                    namespace: node_id.namespace,
                    browse_name: reference.browse_name.name.to_string(),
                    display_name: Some(reference.display_name.text.to_string()),
                    kind: match reference.node_class {
                        NodeClass::Object => NodeKind::Object,
                        NodeClass::Variable => NodeKind::Variable,
                        _ => NodeKind::Other,
                    },
                });
            }

            if !result.continuation_point.is_null() {
                results = self
                    .session
                    .browse_next(false, &[result.continuation_point])
                    .await
                    .map_err(|e| DeviceError::Browse(e.to_string()))?;
            }
        }
        Ok(nodes)
    }
}

#[async_trait]
impl AddressSpace for OpcUaSession {
    fn root(&self) -> String {
        NodeId::from(ObjectId::ObjectsFolder).to_string()
    }

    async fn children(&self, address: &str) -> Result<Vec<BrowseNode>, DeviceError> {
        let node_id = NodeId::from_str(address)
            .map_err(|_| DeviceError::Browse(format!("invalid node id {address}")))?;
        self.browse_all(node_id).await
    }

    async fn variable_info(&self, address: &str) -> VariableInfo {
        let Ok(node_id) = NodeId::from_str(address) else {
            return VariableInfo::default();
        };
        let reads = [
            ReadValueId::new(node_id.clone(), AttributeId::DataType),
            ReadValueId::new(node_id, AttributeId::AccessLevel),
        ];

        let values = match self
            .session
            .read(&reads, TimestampsToReturn::Neither, 0.0)
            .await
        {
            Ok(values) => values,
            Err(e) => {
                tracing::debug!(node = %address, error = %e, "Attribute read failed");
                return VariableInfo::default();
            }
        };

        let data_type = match values.first().and_then(|dv| dv.value.as_ref()) {
            Some(Variant::NodeId(id)) => Some(data_type_name(id)),
            _ => None,
        };
        let access_level = match values.get(1).and_then(|dv| dv.value.as_ref()) {
            Some(Variant::Byte(level)) => Some(*level),
            _ => None,
        };

        VariableInfo {
            data_type,
            access_level,
        }
    }
}

#[async_trait]
impl DeviceSession for OpcUaSession {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn canonical_address(&self, address: &str) -> String {
        canonical_node_id(address)
    }

    async fn subscribe(
        &self,
        addresses: &[String],
        publishing_interval: Duration,
    ) -> Result<usize, DeviceError> {
        let subscription_id = self
            .session
            .create_subscription(publishing_interval, 60, 20, 0, 0, true, self.callbacks())
            .await
            .map_err(|e| DeviceError::Subscribe(format!("create subscription: {e}")))?;

        if let Ok(mut current) = self.subscription.lock() {
            *current = Some(subscription_id);
        }

        let mut nodes = Vec::with_capacity(addresses.len());
        for address in addresses {
            match NodeId::from_str(address) {
                Ok(node_id) => nodes.push(node_id),
                Err(_) => tracing::warn!(node = %address, "Invalid node id in catalog, skipping"),
            }
        }

        let sampling_interval = publishing_interval.as_millis() as f64;
        let requests: Vec<MonitoredItemCreateRequest> = nodes
            .iter()
            .cloned()
            .enumerate()
            .map(|(handle, node_id)| MonitoredItemCreateRequest {
                item_to_monitor: ReadValueId::new_value(node_id),
                monitoring_mode: MonitoringMode::Reporting,
                requested_parameters: MonitoringParameters {
                    client_handle: handle as u32 + 1,
                    sampling_interval,
                    filter: Default::default(),
                    queue_size: 10,
                    discard_oldest: true,
                },
            })
            .collect();

        if requests.is_empty() {
            return Ok(0);
        }

        let results = self
            .session
            .create_monitored_items(subscription_id, TimestampsToReturn::Both, requests)
            .await
            .map_err(|e| DeviceError::Subscribe(format!("create monitored items: {e}")))?;

        let mut created = 0;
        for (node_id, result) in nodes.iter().zip(results) {
            let status = result.result.status_code;
            if status.is_good() {
                created += 1;
            } else {
                tracing::warn!(node = %node_id, status = %status, "Monitored item rejected");
            }
        }

        tracing::info!(
            subscription_id,
            requested = nodes.len(),
            created,
            "OPC UA subscription created"
        );
        Ok(created)
    }

    async fn unsubscribe(&self) {
        let subscription_id = match self.subscription.lock() {
            Ok(mut current) => current.take(),
            Err(_) => None,
        };

        if let Some(subscription_id) = subscription_id {
            if let Err(e) = self.session.delete_subscription(subscription_id).await {
                tracing::warn!(subscription_id, error = %e, "Failed to delete subscription");
            }
        }
    }

    async fn write(&self, address: &str, value: DeviceValue) -> Result<(), WriteError> {
        let node_id = NodeId::from_str(address)
            .map_err(|_| WriteError::InvalidAddress(address.to_string()))?;
        let variant = value_to_variant(value)?;

        let statuses = self
            .session
            .write(&[WriteValue::value_attr(node_id, variant)])
            .await
            .map_err(|status| WriteError::Transport(status.to_string()))?;

        match statuses.first() {
            Some(status) if status.is_good() => Ok(()),
            Some(status) => Err(WriteError::Rejected(status.to_string())),
            None => Err(WriteError::Transport("empty write response".to_string())),
        }
    }

    async fn disconnect(&self) {
        self.session.disable_reconnects();
        if tokio::time::timeout(DISCONNECT_TIMEOUT, self.session.disconnect())
            .await
            .is_err()
        {
            tracing::debug!("OPC UA disconnect timed out");
        }
        self.cancel.cancel();
        self.connected.store(false, Ordering::Release);
    }
}

impl Drop for OpcUaSession {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.driver.abort();
    }
}

/// Node id text as the server echoes it back in notifications.
///
/// Unparseable addresses are only trimmed; subscribing reports them.
fn canonical_node_id(address: &str) -> String {
    let address = address.trim();
    match NodeId::from_str(address) {
        Ok(node_id) => node_id.to_string(),
        Err(_) => address.to_string(),
    }
}

/// Name of a built-in data type, or the node id for anything else.
fn data_type_name(id: &NodeId) -> String {
    let name = match (&id.identifier, id.namespace) {
        (Identifier::Numeric(n), 0) => match *n {
            1 => "Boolean",
            2 => "SByte",
            3 => "Byte",
            4 => "Int16",
            5 => "UInt16",
            6 => "Int32",
            7 => "UInt32",
            8 => "Int64",
            9 => "UInt64",
            10 => "Float",
            11 => "Double",
            12 => "String",
            13 => "DateTime",
            14 => "Guid",
            15 => "ByteString",
            21 => "LocalizedText",
            _ => return id.to_string(),
        },
        _ => return id.to_string(),
    };
    name.to_string()
}

fn variant_to_value(variant: &Variant) -> DeviceValue {
    match variant {
        Variant::Empty => DeviceValue::Null,
        Variant::Boolean(b) => DeviceValue::Boolean(*b),
        Variant::SByte(n) => DeviceValue::SByte(*n),
        Variant::Byte(n) => DeviceValue::Byte(*n),
        Variant::Int16(n) => DeviceValue::Int16(*n),
        Variant::UInt16(n) => DeviceValue::UInt16(*n),
        Variant::Int32(n) => DeviceValue::Int32(*n),
        Variant::UInt32(n) => DeviceValue::UInt32(*n),
        Variant::Int64(n) => DeviceValue::Int64(*n),
        Variant::UInt64(n) => DeviceValue::UInt64(*n),
        Variant::Float(f) => DeviceValue::Float(*f),
        Variant::Double(f) => DeviceValue::Double(*f),
        Variant::String(s) => DeviceValue::String(s.as_ref().to_string()),
        Variant::DateTime(dt) => DeviceValue::DateTime(dt.as_chrono()),
        Variant::ByteString(b) => DeviceValue::ByteString(b.as_ref().to_vec()),
        Variant::Array(array) => {
            DeviceValue::Array(array.values.iter().map(variant_to_value).collect())
        }
        other => DeviceValue::Other(format!("{other:?}")),
    }
}

fn value_to_variant(value: DeviceValue) -> Result<Variant, WriteError> {
    Ok(match value {
        DeviceValue::Null => Variant::Empty,
        DeviceValue::Boolean(b) => Variant::Boolean(b),
        DeviceValue::SByte(n) => Variant::SByte(n),
        DeviceValue::Byte(n) => Variant::Byte(n),
        DeviceValue::Int16(n) => Variant::Int16(n),
        DeviceValue::UInt16(n) => Variant::UInt16(n),
        DeviceValue::Int32(n) => Variant::Int32(n),
        DeviceValue::UInt32(n) => Variant::UInt32(n),
        DeviceValue::Int64(n) => Variant::Int64(n),
        DeviceValue::UInt64(n) => Variant::UInt64(n),
        DeviceValue::Float(f) => Variant::Float(f),
        DeviceValue::Double(f) => Variant::Double(f),
        DeviceValue::String(s) | DeviceValue::Other(s) => Variant::String(UAString::from(s)),
        DeviceValue::DateTime(dt) => Variant::DateTime(Box::new(opcua::types::DateTime::from(dt))),
        DeviceValue::ByteString(bytes) => Variant::ByteString(ByteString::from(bytes)),
        DeviceValue::Array(_) => {
            return Err(WriteError::Rejected(
                "array values cannot be written".to_string(),
            ));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_override_host() {
        assert_eq!(
            override_host("opc.tcp://192.168.0.10:4840", "opc.tcp://PLC-NAME:4840/"),
            Some("opc.tcp://192.168.0.10:4840/".to_string())
        );
        assert_eq!(
            override_host("opc.tcp://10.0.0.5:4841", "opc.tcp://plc:4840/UA/Server"),
            Some("opc.tcp://10.0.0.5:4841/UA/Server".to_string())
        );
        assert_eq!(override_host("not a url", "opc.tcp://plc:4840"), None);
    }

    #[test]
    fn test_security_mappings() {
        assert_eq!(
            UaSecurityPolicy::from(SecurityPolicy::Basic256Sha256),
            UaSecurityPolicy::Basic256Sha256
        );
        assert_eq!(
            MessageSecurityMode::from(SecurityMode::SignAndEncrypt),
            MessageSecurityMode::SignAndEncrypt
        );
        assert!(matches!(
            IdentityToken::from(&UserIdentity::Anonymous),
            IdentityToken::Anonymous
        ));
    }

    #[test]
    fn test_canonical_node_id() {
        assert_eq!(canonical_node_id("ns=0;i=2258"), "i=2258");
        assert_eq!(canonical_node_id("  ns=3;s=DB1.Temp "), "ns=3;s=DB1.Temp");
        assert_eq!(canonical_node_id("i=85"), "i=85");
        assert_eq!(canonical_node_id(" not a node "), "not a node");
    }

    #[test]
    fn test_data_type_name() {
        assert_eq!(data_type_name(&NodeId::new(0, 1u32)), "Boolean");
        assert_eq!(data_type_name(&NodeId::new(0, 10u32)), "Float");
        assert_eq!(data_type_name(&NodeId::new(3, 3002u32)), "ns=3;i=3002");
    }

    #[test]
    fn test_variant_conversion() {
        assert_eq!(variant_to_value(&Variant::Boolean(true)), DeviceValue::Boolean(true));
        assert_eq!(variant_to_value(&Variant::Float(1.5)), DeviceValue::Float(1.5));
        assert_eq!(variant_to_value(&Variant::Empty), DeviceValue::Null);
        assert_eq!(
            variant_to_value(&Variant::String(UAString::from("abc"))),
            DeviceValue::String("abc".to_string())
        );

        assert_eq!(
            value_to_variant(DeviceValue::Int16(-4)).unwrap(),
            Variant::Int16(-4)
        );
        assert_eq!(
            value_to_variant(DeviceValue::UInt32(7)).unwrap(),
            Variant::UInt32(7)
        );
        assert!(value_to_variant(DeviceValue::Array(vec![])).is_err());

        let dt = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        match value_to_variant(DeviceValue::DateTime(dt)).unwrap() {
            Variant::DateTime(value) => assert_eq!(value.as_chrono(), dt),
            other => panic!("unexpected variant {other:?}"),
        }
    }
}

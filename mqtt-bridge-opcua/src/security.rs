//! Security negotiation for the device session.
//!
//! Resolves the configured policy and mode names, checks the client identity
//! material against the application URI the session will announce, and picks
//! the server trust model. Everything here runs before a connection attempt
//! and every failure is fatal.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use thiserror::Error;

use crate::config::OpcUaConfig;

/// Hostname used in the application URI when the system one is unavailable.
const FALLBACK_HOSTNAME: &str = "ha-addon";

/// Security errors.
#[derive(Debug, Error)]
pub enum SecurityError {
    #[error("Unsupported security_policy: {0}")]
    UnsupportedPolicy(String),

    #[error("Unsupported security_mode: {0}")]
    UnsupportedMode(String),

    #[error("Client identity missing: {0}")]
    MissingIdentity(PathBuf),

    #[error("Client certificate {cert} does not contain application URI {uri}")]
    UriMismatch { cert: PathBuf, uri: String },

    #[error("Strict trust requires a captured server certificate at {0}")]
    MissingServerCert(PathBuf),

    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Message security policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityPolicy {
    None,
    Basic128Rsa15,
    Basic256,
    Basic256Sha256,
}

impl SecurityPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityPolicy::None => "None",
            SecurityPolicy::Basic128Rsa15 => "Basic128Rsa15",
            SecurityPolicy::Basic256 => "Basic256",
            SecurityPolicy::Basic256Sha256 => "Basic256Sha256",
        }
    }
}

impl FromStr for SecurityPolicy {
    type Err = SecurityError;

    /// Names are case-sensitive. A blank name means `None`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" | "None" => Ok(SecurityPolicy::None),
            "Basic128Rsa15" => Ok(SecurityPolicy::Basic128Rsa15),
            "Basic256" => Ok(SecurityPolicy::Basic256),
            "Basic256Sha256" => Ok(SecurityPolicy::Basic256Sha256),
            _ => Err(SecurityError::UnsupportedPolicy(s.to_string())),
        }
    }
}

impl fmt::Display for SecurityPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message security mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityMode {
    None,
    Sign,
    SignAndEncrypt,
}

impl SecurityMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityMode::None => "None",
            SecurityMode::Sign => "Sign",
            SecurityMode::SignAndEncrypt => "SignAndEncrypt",
        }
    }
}

impl FromStr for SecurityMode {
    type Err = SecurityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" | "None" => Ok(SecurityMode::None),
            "Sign" => Ok(SecurityMode::Sign),
            "SignAndEncrypt" => Ok(SecurityMode::SignAndEncrypt),
            _ => Err(SecurityError::UnsupportedMode(s.to_string())),
        }
    }
}

impl fmt::Display for SecurityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the device's server certificate is trusted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustModel {
    /// Accept whatever the server presents.
    TrustOnFirstUse,
    /// Accept only the previously captured certificate (DER).
    Pinned { server_cert: Vec<u8> },
}

impl TrustModel {
    /// Check an advertised server certificate against this trust model.
    pub fn accepts(&self, advertised: Option<&[u8]>) -> bool {
        match self {
            TrustModel::TrustOnFirstUse => true,
            TrustModel::Pinned { server_cert } => advertised == Some(server_cert.as_slice()),
        }
    }
}

/// Client certificate and key, as loaded from the PKI directory.
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    /// Certificate in DER form
    pub cert_der: Vec<u8>,
}

/// File layout of the PKI directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PkiPaths {
    pub dir: PathBuf,
    pub client_cert: PathBuf,
    pub client_key: PathBuf,
    pub trusted_server_dir: PathBuf,
    pub server_cert: PathBuf,
}

impl PkiPaths {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let trusted_server_dir = dir.join("trusted_server");

        Self {
            client_cert: dir.join("client_cert.pem"),
            client_key: dir.join("client_key.pem"),
            server_cert: trusted_server_dir.join("server_cert.der"),
            trusted_server_dir,
            dir,
        }
    }

    /// Create the trusted server directory if it does not exist.
    pub fn ensure_dirs(&self) -> Result<(), SecurityError> {
        std::fs::create_dir_all(&self.trusted_server_dir).map_err(|source| SecurityError::Io {
            path: self.trusted_server_dir.clone(),
            source,
        })
    }
}

/// Source of the client identity and the server trust policy.
pub trait IdentityStore: Send + Sync {
    /// Verify that the client certificate carries `uri`.
    fn validate_identity(&self, uri: &str) -> Result<(), SecurityError>;

    /// Load the client certificate and key.
    fn load_identity(&self) -> Result<ClientIdentity, SecurityError>;

    /// Trust model for the server certificate.
    fn trust_policy(&self) -> Result<TrustModel, SecurityError>;
}

/// File-backed [`IdentityStore`].
#[derive(Debug, Clone)]
pub struct PkiStore {
    paths: PkiPaths,
    auto_trust: bool,
}

impl PkiStore {
    pub fn new(paths: PkiPaths, auto_trust: bool) -> Self {
        Self { paths, auto_trust }
    }

    pub fn paths(&self) -> &PkiPaths {
        &self.paths
    }

    fn read(path: &Path) -> Result<Vec<u8>, SecurityError> {
        std::fs::read(path).map_err(|source| SecurityError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl IdentityStore for PkiStore {
    fn validate_identity(&self, uri: &str) -> Result<(), SecurityError> {
        let identity = self.load_identity()?;
        let pem = Self::read(&identity.cert_path)?;

        // The URI is stored as an IA5String in the subjectAltName extension,
        // so a byte search over the DER finds it.
        if contains(&identity.cert_der, uri.as_bytes()) || contains(&pem, uri.as_bytes()) {
            Ok(())
        } else {
            Err(SecurityError::UriMismatch {
                cert: identity.cert_path,
                uri: uri.to_string(),
            })
        }
    }

    fn load_identity(&self) -> Result<ClientIdentity, SecurityError> {
        for path in [&self.paths.client_cert, &self.paths.client_key] {
            if !path.exists() {
                return Err(SecurityError::MissingIdentity(path.clone()));
            }
        }

        let pem = Self::read(&self.paths.client_cert)?;
        let mut reader = pem.as_slice();
        let first = rustls_pemfile::certs(&mut reader)
            .filter_map(|cert| cert.ok())
            .next();

        // Not PEM: assume the file already holds DER.
        let cert_der = match first {
            Some(cert) => cert.as_ref().to_vec(),
            None => pem.clone(),
        };

        Ok(ClientIdentity {
            cert_path: self.paths.client_cert.clone(),
            key_path: self.paths.client_key.clone(),
            cert_der,
        })
    }

    fn trust_policy(&self) -> Result<TrustModel, SecurityError> {
        if self.auto_trust {
            return Ok(TrustModel::TrustOnFirstUse);
        }

        if !self.paths.server_cert.exists() {
            return Err(SecurityError::MissingServerCert(
                self.paths.server_cert.clone(),
            ));
        }

        Ok(TrustModel::Pinned {
            server_cert: Self::read(&self.paths.server_cert)?,
        })
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|w| w == needle)
}

/// Compute the session's application URI.
///
/// An override is honoured only if it starts with `urn:`; otherwise the URI
/// is `urn:<hostname>:HA:<suffix>`.
pub fn application_uri(hostname: &str, override_uri: Option<&str>, suffix: &str) -> String {
    match override_uri.map(str::trim) {
        Some(uri) if uri.starts_with("urn:") => uri.to_string(),
        _ => format!("urn:{hostname}:HA:{suffix}"),
    }
}

/// The local hostname, or a fixed fallback.
pub fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| FALLBACK_HOSTNAME.to_string())
}

/// How the session authenticates its user.
#[derive(Clone, PartialEq, Eq)]
pub enum UserIdentity {
    Anonymous,
    UserName { username: String, password: String },
}

impl fmt::Debug for UserIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserIdentity::Anonymous => f.write_str("Anonymous"),
            UserIdentity::UserName { username, .. } => f
                .debug_struct("UserName")
                .field("username", username)
                .finish_non_exhaustive(),
        }
    }
}

/// Negotiated security settings for one connect attempt.
#[derive(Debug, Clone)]
pub struct SecurityPlan {
    pub policy: SecurityPolicy,
    pub mode: SecurityMode,
    pub application_uri: String,
    /// Present only when the channel is secured.
    pub identity: Option<ClientIdentity>,
    pub trust: TrustModel,
    pub user: UserIdentity,
}

impl SecurityPlan {
    pub fn is_secure(&self) -> bool {
        self.identity.is_some()
    }
}

/// Produces a [`SecurityPlan`] from configuration and an identity store.
pub struct SecurityNegotiator<S = PkiStore> {
    store: S,
    hostname: String,
}

impl SecurityNegotiator<PkiStore> {
    /// Negotiator backed by the configured PKI directory.
    pub fn from_config(config: &OpcUaConfig) -> Self {
        let store = PkiStore::new(PkiPaths::new(&config.pki_dir), config.auto_trust_server);
        Self::new(store, local_hostname())
    }
}

impl<S: IdentityStore> SecurityNegotiator<S> {
    pub fn new(store: S, hostname: impl Into<String>) -> Self {
        Self {
            store,
            hostname: hostname.into(),
        }
    }

    /// Resolve names, validate identity material and pick the trust model.
    ///
    /// Security is on only when both policy and mode are something other than
    /// `None`. Otherwise the plan is normalized to `None`/`None` and no PKI
    /// material is touched.
    pub fn negotiate(&self, config: &OpcUaConfig) -> Result<SecurityPlan, SecurityError> {
        let policy: SecurityPolicy = config.security_policy.parse()?;
        let mode: SecurityMode = config.security_mode.parse()?;

        let application_uri = application_uri(
            &self.hostname,
            config.application_uri.as_deref(),
            &config.application_uri_suffix,
        );

        let user = match &config.username {
            Some(username) if !username.is_empty() => UserIdentity::UserName {
                username: username.clone(),
                password: config.password.clone().unwrap_or_default(),
            },
            _ => UserIdentity::Anonymous,
        };

        let secure = policy != SecurityPolicy::None && mode != SecurityMode::None;
        if !secure {
            if policy != SecurityPolicy::None || mode != SecurityMode::None {
                tracing::warn!(
                    policy = %policy,
                    mode = %mode,
                    "Security needs both a policy and a mode, connecting without security"
                );
            }
            return Ok(SecurityPlan {
                policy: SecurityPolicy::None,
                mode: SecurityMode::None,
                application_uri,
                identity: None,
                trust: TrustModel::TrustOnFirstUse,
                user,
            });
        }

        let identity = self.store.load_identity()?;
        self.store.validate_identity(&application_uri)?;
        let trust = self.store.trust_policy()?;

        tracing::info!(
            policy = %policy,
            mode = %mode,
            application_uri = %application_uri,
            pinned = matches!(trust, TrustModel::Pinned { .. }),
            "Security negotiated"
        );

        Ok(SecurityPlan {
            policy,
            mode,
            application_uri,
            identity: Some(identity),
            trust,
            user,
        })
    }
}

//! Connection descriptors exchanged with the UI
//!
//! These mirror the IPC payloads one to one. Byte blobs (certificates,
//! private keys) travel as arrays of numbers.

use serde::{Deserialize, Serialize};

/// Default etcd client port
pub const DEFAULT_STORE_PORT: u16 = 2379;

fn default_store_port() -> u16 {
    DEFAULT_STORE_PORT
}

fn default_ssh_port() -> u16 {
    22
}

/// Store user credentials
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionUser {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for ConnectionUser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionUser")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Client certificate + private key for mutual TLS
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsIdentity {
    pub cert: Vec<u8>,
    pub key: Vec<u8>,
}

impl std::fmt::Debug for TlsIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsIdentity")
            .field("cert", &format_args!("{} bytes", self.cert.len()))
            .field("key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionTls {
    /// Server name used for certificate verification instead of `host`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    /// Trusted CA certificates (PEM)
    #[serde(default)]
    pub cert: Vec<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<TlsIdentity>,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshPrivateKey {
    pub key: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
}

impl std::fmt::Debug for SshPrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshPrivateKey")
            .field("key", &"<redacted>")
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshIdentity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<SshPrivateKey>,
}

impl std::fmt::Debug for SshIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshIdentity")
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("key", &self.key)
            .finish()
    }
}

/// SSH jump endpoint the store connection is tunneled through
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSsh {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<SshIdentity>,
    /// Pinned host key (`SHA256:<base64>`); unknown keys are accepted when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_key_fingerprint: Option<String>,
}

/// Connection target as sent by the UI
///
/// `tls` and `ssh` are mutually exclusive; the credential resolver turns
/// this into a [`super::ResolvedConnection`] whose security layer is a
/// single tagged variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub host: String,
    #[serde(default = "default_store_port")]
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<ConnectionUser>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<ConnectionTls>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh: Option<ConnectionSsh>,
}

impl Connection {
    /// Plaintext connection without credentials
    pub fn plain(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            namespace: None,
            user: None,
            tls: None,
            ssh: None,
        }
    }

    pub fn with_user(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = Some(ConnectionUser {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_tls(mut self, tls: ConnectionTls) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_ssh(mut self, ssh: ConnectionSsh) -> Self {
        self.ssh = Some(ssh);
        self
    }

    /// `host:port` for logs
    pub fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Which change classes to observe for a key (or key prefix)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyMonitorConfig {
    pub key: String,
    #[serde(default)]
    pub monitor_lease_change: bool,
    #[serde(default)]
    pub monitor_value_change: bool,
    #[serde(default)]
    pub monitor_create: bool,
    #[serde(default)]
    pub monitor_remove: bool,
    /// Match every key starting with `key`
    #[serde(default)]
    pub is_prefix: bool,
}

impl KeyMonitorConfig {
    /// Config observing every change class on an exact key
    pub fn all(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            monitor_lease_change: true,
            monitor_value_change: true,
            monitor_create: true,
            monitor_remove: true,
            is_prefix: false,
        }
    }

    /// Config with every flag off (registers, never fires)
    pub fn inert(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            monitor_lease_change: false,
            monitor_value_change: false,
            monitor_create: false,
            monitor_remove: false,
            is_prefix: false,
        }
    }

    pub fn prefix(mut self) -> Self {
        self.is_prefix = true;
        self
    }

    pub fn is_inert(&self) -> bool {
        !(self.monitor_lease_change
            || self.monitor_value_change
            || self.monitor_create
            || self.monitor_remove)
    }
}

//! Credential resolution
//!
//! Validates a [`Connection`] and normalizes its credentials into a
//! [`ResolvedConnection`]. Everything here is local: private keys are
//! decoded, but no socket is ever opened.

use std::fmt;
use std::sync::Arc;

use russh::keys::{decode_secret_key, PrivateKey};
use tracing::debug;
use zeroize::Zeroizing;

use super::types::{Connection, ConnectionSsh, ConnectionTls, TlsIdentity};
use crate::config::Settings;
use crate::error::{WorkbenchError, WorkbenchResult};

/// Password or passphrase, wiped on drop and never printed
#[derive(Clone)]
pub struct Secret(Zeroizing<String>);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(Zeroizing::new(value.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

/// Store-side user credentials
#[derive(Debug, Clone)]
pub struct StoreCredentials {
    pub username: String,
    pub password: Secret,
}

/// Trust anchors and optional client identity for a TLS store connection
#[derive(Debug, Clone)]
pub struct TlsMaterial {
    pub domain: Option<String>,
    pub ca_certificates: Vec<Vec<u8>>,
    pub identity: Option<TlsIdentity>,
}

/// How the SSH tunnel authenticates
#[derive(Clone)]
pub enum SshAuth {
    /// Method `none`; only reachable when anonymous tunnels are allowed
    Anonymous,
    Password(Secret),
    PrivateKey(Arc<PrivateKey>),
}

impl SshAuth {
    pub fn method_name(&self) -> &'static str {
        match self {
            SshAuth::Anonymous => "none",
            SshAuth::Password(_) => "password",
            SshAuth::PrivateKey(_) => "publickey",
        }
    }
}

impl fmt::Debug for SshAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SshAuth({})", self.method_name())
    }
}

/// Normalized SSH tunnel endpoint
#[derive(Debug, Clone)]
pub struct SshTunnelSpec {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub auth: SshAuth,
    pub host_key_fingerprint: Option<String>,
}

impl SshTunnelSpec {
    /// `user@host:port` for logs
    pub fn describe(&self) -> String {
        format!("{}@{}:{}", self.user, self.host, self.port)
    }
}

/// The single security layer wrapping the store connection
#[derive(Debug, Clone)]
pub enum TransportSecurity {
    Plain,
    Tls(TlsMaterial),
    Ssh(SshTunnelSpec),
}

impl TransportSecurity {
    pub fn name(&self) -> &'static str {
        match self {
            TransportSecurity::Plain => "plain",
            TransportSecurity::Tls(_) => "tls",
            TransportSecurity::Ssh(_) => "ssh",
        }
    }
}

/// Authenticated-transport descriptor consumed by the negotiator
#[derive(Debug, Clone)]
pub struct ResolvedConnection {
    pub host: String,
    pub port: u16,
    pub namespace: Option<String>,
    pub user: Option<StoreCredentials>,
    pub security: TransportSecurity,
}

impl ResolvedConnection {
    pub fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn invalid(message: impl Into<String>) -> WorkbenchError {
    WorkbenchError::InvalidCredential(message.into())
}

/// Validate and normalize a connection descriptor
pub fn resolve_connection(
    connection: &Connection,
    settings: &Settings,
) -> WorkbenchResult<ResolvedConnection> {
    let host = connection.host.trim();
    if host.is_empty() {
        return Err(invalid("store host is empty"));
    }
    if connection.port == 0 {
        return Err(invalid("store port must be non-zero"));
    }

    let user = match &connection.user {
        Some(user) => {
            if user.username.trim().is_empty() {
                return Err(invalid("store username is empty"));
            }
            Some(StoreCredentials {
                username: user.username.clone(),
                password: Secret::new(user.password.clone()),
            })
        }
        None => None,
    };

    let security = match (&connection.tls, &connection.ssh) {
        (Some(_), Some(_)) => {
            return Err(invalid(
                "tls and ssh are mutually exclusive; configure only one",
            ))
        }
        (Some(tls), None) => TransportSecurity::Tls(resolve_tls(tls)?),
        (None, Some(ssh)) => TransportSecurity::Ssh(resolve_ssh(ssh, settings)?),
        (None, None) => TransportSecurity::Plain,
    };

    let namespace = connection
        .namespace
        .as_ref()
        .filter(|ns| !ns.is_empty())
        .cloned();

    debug!(
        "Resolved {} connection to {}:{}",
        security.name(),
        host,
        connection.port
    );

    Ok(ResolvedConnection {
        host: host.to_string(),
        port: connection.port,
        namespace,
        user,
        security,
    })
}

fn resolve_tls(tls: &ConnectionTls) -> WorkbenchResult<TlsMaterial> {
    if tls.cert.iter().any(|c| c.is_empty()) {
        return Err(invalid("tls certificate entry is empty"));
    }
    if let Some(identity) = &tls.identity {
        if identity.cert.is_empty() || identity.key.is_empty() {
            return Err(invalid("tls identity needs both certificate and key"));
        }
    }
    let domain = tls
        .domain
        .as_ref()
        .map(|d| d.trim().to_string())
        .filter(|d| !d.is_empty());

    Ok(TlsMaterial {
        domain,
        ca_certificates: tls.cert.clone(),
        identity: tls.identity.clone(),
    })
}

fn resolve_ssh(ssh: &ConnectionSsh, settings: &Settings) -> WorkbenchResult<SshTunnelSpec> {
    if ssh.host.trim().is_empty() {
        return Err(invalid("ssh host is empty"));
    }
    if ssh.user.trim().is_empty() {
        return Err(invalid("ssh user is empty"));
    }
    if ssh.port == 0 {
        return Err(invalid("ssh port must be non-zero"));
    }

    let identity = ssh.identity.as_ref();
    let password = identity.and_then(|i| i.password.as_ref());
    let key = identity.and_then(|i| i.key.as_ref());

    let auth = match (password, key) {
        (Some(_), Some(_)) => {
            return Err(invalid(
                "ssh identity has both a password and a private key; keep one",
            ))
        }
        (Some(password), None) => SshAuth::Password(Secret::new(password.clone())),
        (None, Some(key)) => {
            let pem = Zeroizing::new(
                String::from_utf8(key.key.clone())
                    .map_err(|_| invalid("ssh private key is not valid UTF-8 text"))?,
            );
            let passphrase = key.passphrase.as_deref().filter(|p| !p.is_empty());
            let decoded = decode_secret_key(pem.as_str(), passphrase)
                .map_err(|e| invalid(format!("failed to parse ssh private key: {}", e)))?;
            SshAuth::PrivateKey(Arc::new(decoded))
        }
        (None, None) if settings.allow_anonymous_ssh => SshAuth::Anonymous,
        (None, None) => {
            return Err(invalid(
                "ssh tunnel requires a password or a private key",
            ))
        }
    };

    Ok(SshTunnelSpec {
        host: ssh.host.trim().to_string(),
        port: ssh.port,
        user: ssh.user.clone(),
        auth,
        host_key_fingerprint: ssh.host_key_fingerprint.clone(),
    })
}

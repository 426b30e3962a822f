//! SSH Client implementation using russh

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use russh::client::{self, Handle};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::{PublicKey, PublicKeyBase64};
use sha2::{Digest, Sha256};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::error::SshError;
use crate::config::Settings;
use crate::connection::{SshAuth, SshTunnelSpec};

/// Compute the OpenSSH-style SHA256 fingerprint of a public key
pub fn fingerprint(key: &PublicKey) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.public_key_bytes());
    let hash = hasher.finalize();
    format!("SHA256:{}", BASE64.encode(hash).trim_end_matches('='))
}

/// Resolve `host:port` to the first socket address
pub(crate) async fn resolve_first(
    host: &str,
    port: u16,
    timeout: Duration,
) -> Result<SocketAddr, SshError> {
    let lookup = tokio::time::timeout(timeout, tokio::net::lookup_host((host, port)))
        .await
        .map_err(|_| SshError::ResolveTimeout(timeout.as_secs()))?
        .map_err(|e| SshError::ResolveFailed(format!("{}: {}", host, e)))?;

    lookup
        .into_iter()
        .next()
        .ok_or_else(|| SshError::ResolveFailed(format!("no address found for {}", host)))
}

/// Connects and authenticates the tunnel endpoint
pub struct SshClient {
    spec: SshTunnelSpec,
    timeout: Duration,
    keepalive_interval: Duration,
    keepalive_max: usize,
    inactivity_timeout: Duration,
}

impl SshClient {
    pub fn new(spec: SshTunnelSpec, settings: &Settings) -> Self {
        Self {
            spec,
            timeout: settings.ssh_connect_timeout(),
            keepalive_interval: Duration::from_secs(settings.ssh_keepalive_interval_seconds),
            keepalive_max: settings.ssh_keepalive_max,
            inactivity_timeout: Duration::from_secs(settings.ssh_inactivity_timeout_seconds),
        }
    }

    /// Connect to the SSH server and return an authenticated handle
    ///
    /// Each stage (DNS, TCP, handshake, authentication) is bounded by the
    /// SSH connect timeout on its own.
    pub async fn connect(self) -> Result<Handle<ClientHandler>, SshError> {
        let timeout_secs = self.timeout.as_secs();
        let target = self.spec.describe();

        info!("Connecting to SSH server {}", target);

        let socket_addr = resolve_first(&self.spec.host, self.spec.port, self.timeout).await?;

        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(socket_addr))
            .await
            .map_err(|_| SshError::TcpTimeout(timeout_secs))?
            .map_err(|e| SshError::TcpConnectFailed(format!("{}: {}", socket_addr, e)))?;

        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY: {}", e);
        }

        let ssh_config = client::Config {
            inactivity_timeout: Some(self.inactivity_timeout),
            keepalive_interval: Some(self.keepalive_interval),
            keepalive_max: self.keepalive_max,
            ..Default::default()
        };

        let handler = ClientHandler::new(
            self.spec.host.clone(),
            self.spec.port,
            self.spec.host_key_fingerprint.clone(),
        );

        let mut handle = tokio::time::timeout(
            self.timeout,
            client::connect_stream(Arc::new(ssh_config), stream, handler),
        )
        .await
        .map_err(|_| SshError::Timeout(timeout_secs))?
        .map_err(|e| match e {
            SshError::ProtocolError(msg) => SshError::ConnectionFailed(msg),
            other => other,
        })?;

        debug!("SSH handshake completed with {}", target);

        let user = self.spec.user.clone();
        let auth = async {
            match &self.spec.auth {
                SshAuth::Password(password) => {
                    handle.authenticate_password(&user, password.expose()).await
                }
                SshAuth::PrivateKey(key) => {
                    let key_with_hash = PrivateKeyWithHashAlg::new(Arc::clone(key), None);
                    handle.authenticate_publickey(&user, key_with_hash).await
                }
                SshAuth::Anonymous => handle.authenticate_none(&user).await,
            }
        };

        let authenticated = tokio::time::timeout(self.timeout, auth)
            .await
            .map_err(|_| SshError::Timeout(timeout_secs))?
            .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?;

        if !authenticated.success() {
            return Err(SshError::AuthenticationFailed(format!(
                "{} rejected by server for {}",
                self.spec.auth.method_name(),
                target
            )));
        }

        info!("SSH authentication successful for {}", target);
        Ok(handle)
    }
}

/// Client handler for russh callbacks
///
/// Verifies the server key against a pinned fingerprint when one is
/// configured; otherwise the key is accepted and its fingerprint logged.
pub struct ClientHandler {
    host: String,
    port: u16,
    expected_fingerprint: Option<String>,
}

impl ClientHandler {
    pub fn new(host: String, port: u16, expected_fingerprint: Option<String>) -> Self {
        Self {
            host,
            port,
            expected_fingerprint,
        }
    }
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let actual = fingerprint(server_public_key);

        match &self.expected_fingerprint {
            Some(expected) if expected.trim_end_matches('=') != actual => {
                warn!(
                    "HOST KEY MISMATCH for {}:{}! Expected {}, got {}",
                    self.host, self.port, expected, actual
                );
                Err(SshError::HostKeyMismatch {
                    expected: expected.clone(),
                    actual,
                })
            }
            Some(_) => {
                info!("Host key verified for {}:{}", self.host, self.port);
                Ok(true)
            }
            None => {
                info!(
                    "Accepting host key for {}:{} (fingerprint: {})",
                    self.host, self.port, actual
                );
                Ok(true)
            }
        }
    }
}

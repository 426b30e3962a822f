//! Transport negotiation
//!
//! Walks the layers of a resolved connection in order and stops at the
//! first one that fails, reporting it by name:
//!
//! - plain / TLS: dns -> tcp -> store connect (tls handshake, auth) -> probe
//! - SSH: dns -> tcp -> ssh handshake -> ssh auth -> loopback tunnel -> store
//!
//! Nothing is retried here; a failed negotiation leaves no tunnel or store
//! client behind.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::connection::{ResolvedConnection, SshTunnelSpec, TlsMaterial, TransportSecurity};
use crate::error::{Layer, WorkbenchError, WorkbenchResult};
use crate::ssh::{resolve_first, SshTunnel};
use crate::store::{StoreConnector, StoreEndpoint, StoreSession};

/// A live, probed transport to the store
pub struct NegotiatedTransport {
    pub store: Arc<dyn StoreSession>,
    pub tunnel: Option<SshTunnel>,
}

impl NegotiatedTransport {
    /// Release the store client, then the tunnel under it
    pub async fn close(self) {
        self.store.close().await;
        if let Some(tunnel) = self.tunnel {
            tunnel.close().await;
        }
    }
}

pub struct TransportNegotiator {
    connector: Arc<dyn StoreConnector>,
    settings: Settings,
}

impl TransportNegotiator {
    pub fn new(connector: Arc<dyn StoreConnector>, settings: Settings) -> Self {
        Self {
            connector,
            settings,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Establish the transport described by `resolved`
    pub async fn negotiate(&self, resolved: &ResolvedConnection) -> WorkbenchResult<NegotiatedTransport> {
        info!(
            "Negotiating {} transport to {}",
            resolved.security.name(),
            resolved.target()
        );

        let result = match &resolved.security {
            TransportSecurity::Plain => self.direct(resolved, None).await,
            TransportSecurity::Tls(material) => self.direct(resolved, Some(material.clone())).await,
            TransportSecurity::Ssh(spec) => self.tunneled(resolved, spec).await,
        };

        if let Err(e) = &result {
            warn!("Transport to {} failed: {}", resolved.target(), e);
        }
        result
    }

    /// Full handshake plus a probe request, then teardown
    pub async fn connect_test(&self, resolved: &ResolvedConnection) -> WorkbenchResult<()> {
        let transport = self.negotiate(resolved).await?;
        transport.close().await;
        info!("Connection test to {} succeeded", resolved.target());
        Ok(())
    }

    async fn direct(
        &self,
        resolved: &ResolvedConnection,
        tls: Option<TlsMaterial>,
    ) -> WorkbenchResult<NegotiatedTransport> {
        let timeout = self.settings.connect_timeout();
        let addr = resolve_first(&resolved.host, resolved.port, timeout)
            .await
            .map_err(WorkbenchError::from)?;
        probe_tcp(addr, timeout).await?;

        let endpoint = self.endpoint(resolved, resolved.host.clone(), resolved.port, tls);
        let store = self.open_store(endpoint).await?;
        Ok(NegotiatedTransport { store, tunnel: None })
    }

    async fn tunneled(
        &self,
        resolved: &ResolvedConnection,
        spec: &SshTunnelSpec,
    ) -> WorkbenchResult<NegotiatedTransport> {
        let tunnel = SshTunnel::open(spec.clone(), &resolved.host, resolved.port, &self.settings)
            .await
            .map_err(WorkbenchError::from)?;

        debug!(
            "Store traffic for {} goes through 127.0.0.1:{}",
            resolved.target(),
            tunnel.local_port()
        );

        let endpoint = self.endpoint(resolved, "127.0.0.1".to_string(), tunnel.local_port(), None);
        match self.open_store(endpoint).await {
            Ok(store) => Ok(NegotiatedTransport {
                store,
                tunnel: Some(tunnel),
            }),
            Err(e) => {
                tunnel.close().await;
                Err(e)
            }
        }
    }

    fn endpoint(
        &self,
        resolved: &ResolvedConnection,
        host: String,
        port: u16,
        tls: Option<TlsMaterial>,
    ) -> StoreEndpoint {
        StoreEndpoint {
            host,
            port,
            tls,
            user: resolved.user.clone(),
            namespace: resolved.namespace.clone(),
            connect_timeout: self.settings.connect_timeout(),
            request_timeout: self.settings.request_timeout(),
        }
    }

    async fn open_store(&self, endpoint: StoreEndpoint) -> WorkbenchResult<Arc<dyn StoreSession>> {
        let connect_timeout = endpoint.connect_timeout;
        let request_timeout = endpoint.request_timeout;
        let layer = if endpoint.tls.is_some() {
            Layer::Tls
        } else {
            Layer::Store
        };

        let store = tokio::time::timeout(connect_timeout, self.connector.open(endpoint))
            .await
            .map_err(|_| WorkbenchError::Timeout {
                layer,
                seconds: connect_timeout.as_secs(),
            })??;

        let probe = tokio::time::timeout(request_timeout, store.probe())
            .await
            .map_err(|_| WorkbenchError::Timeout {
                layer: Layer::Store,
                seconds: request_timeout.as_secs(),
            })
            .and_then(|r| r);

        if let Err(e) = probe {
            store.close().await;
            return Err(e);
        }
        Ok(store)
    }
}

/// Confirm something accepts TCP connections at `addr`
async fn probe_tcp(addr: SocketAddr, timeout: Duration) -> WorkbenchResult<()> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| WorkbenchError::Timeout {
            layer: Layer::Tcp,
            seconds: timeout.as_secs(),
        })?
        .map_err(|e| WorkbenchError::unreachable(Layer::Tcp, format!("{}: {}", addr, e)))?;
    drop(stream);
    debug!("TCP probe to {} succeeded", addr);
    Ok(())
}

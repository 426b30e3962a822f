//! SSH tunnel for store connections
//!
//! Binds an ephemeral loopback listener and forwards every accepted socket
//! to the store endpoint through a `direct-tcpip` channel. The store client
//! then connects to `127.0.0.1:<local_port>` as if the store were local.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::client::SshClient;
use super::error::SshError;
use super::handle_owner::{spawn_link_owner, SshLink};
use crate::config::Settings;
use crate::connection::SshTunnelSpec;

/// Back-off after a failed `accept`
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Where forwarded sockets end up, as seen from the SSH server
#[derive(Debug, Clone)]
struct StoreTarget {
    host: String,
    port: u16,
}

/// A live SSH tunnel towards one store endpoint
///
/// Dropping the tunnel stops the listener and disconnects the SSH session.
pub struct SshTunnel {
    label: String,
    local_addr: SocketAddr,
    link: SshLink,
    stop: watch::Sender<bool>,
    forwarded: Arc<AtomicU64>,
}

impl SshTunnel {
    /// Connect, authenticate and start forwarding to `store_host:store_port`
    pub async fn open(
        spec: SshTunnelSpec,
        store_host: &str,
        store_port: u16,
        settings: &Settings,
    ) -> Result<Self, SshError> {
        let label = spec.describe();
        let handle = SshClient::new(spec, settings).connect().await?;
        let link = spawn_link_owner(handle, label.clone());

        let target = StoreTarget {
            host: store_host.to_string(),
            port: store_port,
        };
        match Self::listen(link.clone(), label, target).await {
            Ok(tunnel) => Ok(tunnel),
            Err(e) => {
                link.shutdown().await;
                Err(e)
            }
        }
    }

    async fn listen(link: SshLink, label: String, target: StoreTarget) -> Result<Self, SshError> {
        let listener = TcpListener::bind("127.0.0.1:0").await.map_err(|e| {
            SshError::ConnectionFailed(format!("cannot bind tunnel listener: {}", e))
        })?;
        let local_addr = listener.local_addr().map_err(|e| {
            SshError::ConnectionFailed(format!("tunnel listener has no address: {}", e))
        })?;

        info!(
            "Tunnel {} forwarding {} -> {}:{}",
            label, local_addr, target.host, target.port
        );

        let (stop, stop_rx) = watch::channel(false);
        let forwarded = Arc::new(AtomicU64::new(0));
        tokio::spawn(serve(
            listener,
            local_addr,
            link.clone(),
            target,
            stop_rx,
            forwarded.clone(),
        ));

        Ok(Self {
            label,
            local_addr,
            link,
            stop,
            forwarded,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn local_port(&self) -> u16 {
        self.local_addr.port()
    }

    /// `user@host:port` of the SSH endpoint
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Handle that resolves once the SSH connection is gone
    pub fn link(&self) -> SshLink {
        self.link.clone()
    }

    pub fn is_running(&self) -> bool {
        !*self.stop.borrow() && self.link.is_open()
    }

    /// Local sockets accepted so far
    pub fn forwarded_connections(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    /// Stop forwarding and disconnect the SSH session
    pub async fn close(&self) {
        info!("Closing tunnel {}", self.label);
        self.stop.send_replace(true);
        self.link.shutdown().await;
    }
}

impl Drop for SshTunnel {
    fn drop(&mut self) {
        self.stop.send_replace(true);
        self.link.request_shutdown();
    }
}

async fn serve(
    listener: TcpListener,
    local_addr: SocketAddr,
    link: SshLink,
    target: StoreTarget,
    mut stop: watch::Receiver<bool>,
    forwarded: Arc<AtomicU64>,
) {
    loop {
        let accepted = tokio::select! {
            _ = link.closed() => {
                debug!("Tunnel listener {} stopped: SSH gone", local_addr);
                break;
            }
            _ = stop.wait_for(|stopped| *stopped) => {
                debug!("Tunnel listener {} stopped on request", local_addr);
                break;
            }
            accepted = listener.accept() => accepted,
        };

        let (socket, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                warn!("Tunnel accept failed: {}", e);
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                continue;
            }
        };
        if let Err(e) = socket.set_nodelay(true) {
            debug!("TCP_NODELAY not set on {}: {}", peer, e);
        }
        forwarded.fetch_add(1, Ordering::Relaxed);

        let link = link.clone();
        let target = target.clone();
        tokio::spawn(async move {
            if let Err(e) = bridge(&link, socket, peer, &target).await {
                warn!("Tunnel connection from {} failed: {}", peer, e);
            }
        });
    }
}

/// Pump bytes between one local socket and its SSH channel until either side closes
async fn bridge(
    link: &SshLink,
    mut socket: TcpStream,
    peer: SocketAddr,
    target: &StoreTarget,
) -> Result<(), SshError> {
    let channel = link.open_channel(&target.host, target.port, peer).await?;
    let mut remote = channel.into_stream();

    match tokio::io::copy_bidirectional(&mut socket, &mut remote).await {
        Ok((up, down)) => debug!("Tunnel connection {} done ({} up, {} down)", peer, up, down),
        Err(e) => debug!("Tunnel connection {} ended: {}", peer, e),
    }
    Ok(())
}

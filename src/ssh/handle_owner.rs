//! SSH link owner
//!
//! A single task owns the russh `Handle`. Everyone else holds an [`SshLink`]
//! and asks that task for `direct-tcpip` channels over an mpsc queue, so the
//! handle never sits behind a lock across `.await`.
//!
//! ```ignore
//! let link = spawn_link_owner(handle, "ops@bastion:22".into());
//! let channel = link.open_channel("10.0.0.5", 2379, peer_addr).await?;
//! ```

use std::net::SocketAddr;
use std::time::Duration;

use russh::client::{Handle, Msg};
use russh::Channel;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use super::error::SshError;

/// Poll period for noticing that the server dropped the connection
const PEER_CHECK_INTERVAL: Duration = Duration::from_secs(1);

const COMMAND_QUEUE: usize = 64;

type ChannelReply = oneshot::Sender<Result<Channel<Msg>, russh::Error>>;

/// Requests served by the owner task
pub enum OwnerCommand {
    /// Open a channel from `origin` (the local socket) to the store endpoint
    OpenChannel {
        target_host: String,
        target_port: u16,
        origin: SocketAddr,
        reply: ChannelReply,
    },
    /// Tear the SSH connection down
    Shutdown,
}

/// Cloneable access to one SSH connection
#[derive(Clone)]
pub struct SshLink {
    commands: mpsc::Sender<OwnerCommand>,
    /// Flips to `true` exactly once, when the connection is gone
    closed: watch::Receiver<bool>,
}

impl SshLink {
    /// Link over a bare command queue; the caller plays the owner
    #[cfg(test)]
    pub(crate) fn detached(commands: mpsc::Sender<OwnerCommand>) -> (Self, watch::Sender<bool>) {
        let (closed_tx, closed) = watch::channel(false);
        (Self { commands, closed }, closed_tx)
    }

    pub async fn open_channel(
        &self,
        target_host: &str,
        target_port: u16,
        origin: SocketAddr,
    ) -> Result<Channel<Msg>, SshError> {
        let (reply, answer) = oneshot::channel();
        let command = OwnerCommand::OpenChannel {
            target_host: target_host.to_string(),
            target_port,
            origin,
            reply,
        };
        if self.commands.send(command).await.is_err() {
            return Err(SshError::Disconnected);
        }

        match answer.await {
            Ok(Ok(channel)) => Ok(channel),
            Ok(Err(russh::Error::Disconnect)) | Err(_) => Err(SshError::Disconnected),
            Ok(Err(e)) => Err(SshError::ChannelError(format!(
                "direct-tcpip to {}:{} refused: {}",
                target_host, target_port, e
            ))),
        }
    }

    /// Ask the owner to disconnect and wait until the request is queued
    pub async fn shutdown(&self) {
        let _ = self.commands.send(OwnerCommand::Shutdown).await;
    }

    /// Fire-and-forget shutdown for `Drop` paths
    pub fn request_shutdown(&self) {
        let _ = self.commands.try_send(OwnerCommand::Shutdown);
    }

    pub fn is_open(&self) -> bool {
        !*self.closed.borrow() && !self.commands.is_closed()
    }

    /// Resolves once the connection is gone, immediately if it already is
    pub async fn closed(&self) {
        let mut closed = self.closed.clone();
        let _ = closed.wait_for(|gone| *gone).await;
    }
}

/// Hand `handle` to a fresh owner task
///
/// The task stops on `Shutdown`, when the last link is dropped, or when the
/// server closes the connection. Queued channel requests are then refused.
pub fn spawn_link_owner(handle: Handle<ClientHandler>, label: String) -> SshLink {
    let (commands, mut queue) = mpsc::channel::<OwnerCommand>(COMMAND_QUEUE);
    let (closed_tx, closed) = watch::channel(false);

    tokio::spawn(async move {
        let mut peer_check = tokio::time::interval(PEER_CHECK_INTERVAL);
        debug!("SSH link owner running for {}", label);

        let reason = loop {
            tokio::select! {
                command = queue.recv() => match command {
                    Some(OwnerCommand::OpenChannel { target_host, target_port, origin, reply }) => {
                        debug!("{}: channel {} -> {}:{}", label, origin, target_host, target_port);
                        let opened = handle
                            .channel_open_direct_tcpip(
                                target_host,
                                u32::from(target_port),
                                origin.ip().to_string(),
                                u32::from(origin.port()),
                            )
                            .await;
                        if reply.send(opened).is_err() {
                            debug!("{}: channel requester went away", label);
                        }
                    }
                    Some(OwnerCommand::Shutdown) => break "shutdown requested",
                    None => break "no links left",
                },
                _ = peer_check.tick() => {
                    if handle.is_closed() {
                        warn!("SSH connection {} closed by server", label);
                        break "closed by server";
                    }
                }
            }
        };

        let _ = closed_tx.send(true);
        refuse_queued(&mut queue);

        if let Err(e) = handle
            .disconnect(russh::Disconnect::ByApplication, "workbench tunnel closed", "en")
            .await
        {
            debug!("{}: disconnect message not delivered: {}", label, e);
        }
        info!("SSH link {} released ({})", label, reason);
    });

    SshLink { commands, closed }
}

/// Answer every queued channel request with a disconnect
fn refuse_queued(queue: &mut mpsc::Receiver<OwnerCommand>) {
    queue.close();
    while let Ok(command) = queue.try_recv() {
        if let OwnerCommand::OpenChannel { reply, .. } = command {
            let _ = reply.send(Err(russh::Error::Disconnect));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    #[tokio::test]
    async fn test_link_without_owner_is_disconnected() {
        let (commands, queue) = mpsc::channel(4);
        let (link, _closed_tx) = SshLink::detached(commands);
        drop(queue);

        assert!(!link.is_open());
        let err = link.open_channel("10.0.0.5", 2379, origin()).await.unwrap_err();
        assert!(matches!(err, SshError::Disconnected));
    }

    #[tokio::test]
    async fn test_queued_requests_refused_on_exit() {
        let (commands, mut queue) = mpsc::channel(4);
        let (link, _closed_tx) = SshLink::detached(commands);

        let pending = tokio::spawn(async move { link.open_channel("10.0.0.5", 2379, origin()).await });

        while queue.is_empty() {
            tokio::task::yield_now().await;
        }
        refuse_queued(&mut queue);

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(SshError::Disconnected)));
    }

    #[tokio::test]
    async fn test_closed_resolves_for_late_waiters() {
        let (commands, _queue) = mpsc::channel(4);
        let (link, closed_tx) = SshLink::detached(commands);
        closed_tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_millis(200), link.closed())
            .await
            .unwrap();
        assert!(!link.is_open());
    }
}

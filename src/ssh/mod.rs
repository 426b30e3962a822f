//! SSH module - tunnels store connections through a jump host
//!
//! # Features
//! - Password, private key and (opt-in) anonymous authentication
//! - Host key pinning by SHA256 fingerprint
//! - Single-owner link task serving `direct-tcpip` channels
//! - Loopback listener the store client connects to

mod client;
mod error;
mod handle_owner;
mod tunnel;

pub use client::{fingerprint, ClientHandler, SshClient};
pub(crate) use client::resolve_first;
pub use error::SshError;
pub use handle_owner::{spawn_link_owner, OwnerCommand, SshLink};
pub use tunnel::SshTunnel;

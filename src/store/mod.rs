//! Store client seam
//!
//! The session and monitor layers only see these traits. The etcd v3
//! implementation lives in [`etcd`]; tests drive the same code through an
//! in-memory store.

pub mod etcd;
#[cfg(test)]
pub(crate) mod memory;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::connection::{StoreCredentials, TlsMaterial};
use crate::error::WorkbenchResult;

pub use etcd::EtcdConnector;

/// Everything a connector needs to reach one store endpoint
///
/// For tunneled sessions `host`/`port` point at the loopback listener.
#[derive(Debug, Clone)]
pub struct StoreEndpoint {
    pub host: String,
    pub port: u16,
    pub tls: Option<TlsMaterial>,
    pub user: Option<StoreCredentials>,
    pub namespace: Option<String>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl StoreEndpoint {
    pub fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreEventKind {
    Put,
    Delete,
}

/// State of a key before the change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrevKv {
    pub value: Vec<u8>,
    pub lease: i64,
}

/// One committed change as seen by a store watch
///
/// `key` is relative to the session namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEvent {
    pub kind: StoreEventKind,
    pub key: String,
    pub value: Vec<u8>,
    pub lease: i64,
    pub revision: i64,
    pub prev: Option<PrevKv>,
}

/// A running store-side watch
///
/// `events` yields `Err` once if the watch breaks and then ends; it ends
/// without an error after a cancellation. Sending on (or dropping)
/// `cancel` stops the watch.
pub struct StoreWatch {
    pub events: mpsc::Receiver<WorkbenchResult<StoreEvent>>,
    pub cancel: oneshot::Sender<()>,
}

impl fmt::Debug for StoreWatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreWatch").finish_non_exhaustive()
    }
}

/// Opens authenticated store sessions
#[async_trait]
pub trait StoreConnector: Send + Sync {
    async fn open(&self, endpoint: StoreEndpoint) -> WorkbenchResult<Arc<dyn StoreSession>>;
}

/// An open, authenticated store client
#[async_trait]
pub trait StoreSession: Send + Sync {
    /// Cheap round trip used to confirm the session works
    async fn probe(&self) -> WorkbenchResult<()>;

    /// Whether `user` holds the root role
    async fn is_root(&self, user: &str) -> WorkbenchResult<bool>;

    /// Watch `key` (or every key under it when `prefix` is set)
    async fn watch(&self, key: &str, prefix: bool) -> WorkbenchResult<StoreWatch>;

    /// Announce that the session is done
    ///
    /// Implementations may release resources here, but the underlying
    /// channel is only guaranteed to close once the last reference to the
    /// session is dropped.
    async fn close(&self);
}

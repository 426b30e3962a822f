//! In-memory store for tests
//!
//! Behaves like a single-node store: puts and deletes bump a revision and
//! are pushed to every matching watch with the previous key-value attached.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use super::{PrevKv, StoreConnector, StoreEndpoint, StoreEvent, StoreEventKind, StoreSession, StoreWatch};
use crate::error::{Layer, WorkbenchError, WorkbenchResult};

struct WatchEntry {
    key: String,
    prefix: bool,
    tx: mpsc::Sender<WorkbenchResult<StoreEvent>>,
    cancel_rx: oneshot::Receiver<()>,
}

impl WatchEntry {
    fn matches(&self, key: &str) -> bool {
        if self.prefix {
            key.starts_with(&self.key)
        } else {
            key == self.key
        }
    }

    fn is_live(&mut self) -> bool {
        matches!(
            self.cancel_rx.try_recv(),
            Err(oneshot::error::TryRecvError::Empty)
        ) && !self.tx.is_closed()
    }
}

#[derive(Default)]
struct State {
    kv: BTreeMap<String, (Vec<u8>, i64)>,
    revision: i64,
    watches: Vec<WatchEntry>,
    roles: HashMap<String, Vec<String>>,
    denied: Vec<String>,
}

/// Shared in-memory key space
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    watches_opened: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn grant_roles(&self, user: &str, roles: &[&str]) {
        self.state.lock().roles.insert(
            user.to_string(),
            roles.iter().map(|r| r.to_string()).collect(),
        );
    }

    pub fn put(&self, key: &str, value: &[u8], lease: i64) {
        let mut state = self.state.lock();
        state.revision += 1;
        let revision = state.revision;
        let prev = state
            .kv
            .insert(key.to_string(), (value.to_vec(), lease))
            .map(|(value, lease)| PrevKv { value, lease });
        let event = StoreEvent {
            kind: StoreEventKind::Put,
            key: key.to_string(),
            value: value.to_vec(),
            lease,
            revision,
            prev,
        };
        Self::dispatch(&mut state, event);
    }

    pub fn delete(&self, key: &str) {
        let mut state = self.state.lock();
        let Some((value, lease)) = state.kv.remove(key) else {
            return;
        };
        state.revision += 1;
        let event = StoreEvent {
            kind: StoreEventKind::Delete,
            key: key.to_string(),
            value: Vec::new(),
            lease: 0,
            revision: state.revision,
            prev: Some(PrevKv { value, lease }),
        };
        Self::dispatch(&mut state, event);
    }

    /// Refuse later watches on `key` as a permission error
    pub fn deny_watch(&self, key: &str) {
        self.state.lock().denied.push(key.to_string());
    }

    /// Fail every open watch as if the connection dropped
    pub fn break_watches(&self) {
        let mut state = self.state.lock();
        for entry in state.watches.drain(..) {
            let _ = entry
                .tx
                .try_send(Err(WorkbenchError::ConnectionLost("store connection reset".into())));
        }
    }

    /// Watches that are neither cancelled nor abandoned
    pub fn active_watches(&self) -> usize {
        let mut state = self.state.lock();
        state.watches.retain_mut(|w| w.is_live());
        state.watches.len()
    }

    /// Total watches ever opened
    pub fn watches_opened(&self) -> usize {
        self.watches_opened.load(Ordering::SeqCst)
    }

    fn dispatch(state: &mut State, event: StoreEvent) {
        state.watches.retain_mut(|w| w.is_live());
        for entry in state.watches.iter().filter(|w| w.matches(&event.key)) {
            let _ = entry.tx.try_send(Ok(event.clone()));
        }
    }
}

/// Connector handing out sessions over one [`MemoryStore`]
pub struct MemoryConnector {
    store: Arc<MemoryStore>,
    delay: Option<Duration>,
    failure: Option<WorkbenchError>,
    opens: AtomicUsize,
    last_endpoint: Mutex<Option<StoreEndpoint>>,
}

impl MemoryConnector {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self {
            store,
            delay: None,
            failure: None,
            opens: AtomicUsize::new(0),
            last_endpoint: Mutex::new(None),
        }
    }

    /// Stall every open for `delay` before answering
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail every open with `err`
    pub fn failing(mut self, err: WorkbenchError) -> Self {
        self.failure = Some(err);
        self
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Endpoint passed to the most recent open
    pub fn last_endpoint(&self) -> Option<StoreEndpoint> {
        self.last_endpoint.lock().clone()
    }
}

#[async_trait]
impl StoreConnector for MemoryConnector {
    async fn open(&self, endpoint: StoreEndpoint) -> WorkbenchResult<Arc<dyn StoreSession>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        *self.last_endpoint.lock() = Some(endpoint);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = &self.failure {
            return Err(err.clone());
        }
        Ok(Arc::new(MemorySession {
            store: self.store.clone(),
        }))
    }
}

pub struct MemorySession {
    store: Arc<MemoryStore>,
}

#[async_trait]
impl StoreSession for MemorySession {
    async fn probe(&self) -> WorkbenchResult<()> {
        Ok(())
    }

    async fn is_root(&self, user: &str) -> WorkbenchResult<bool> {
        let state = self.store.state.lock();
        Ok(state
            .roles
            .get(user)
            .is_some_and(|roles| roles.iter().any(|r| r == "root")))
    }

    async fn watch(&self, key: &str, prefix: bool) -> WorkbenchResult<StoreWatch> {
        let (tx, events) = mpsc::channel(128);
        let (cancel, cancel_rx) = oneshot::channel();
        let mut state = self.store.state.lock();
        if state.denied.iter().any(|denied| denied == key) {
            return Err(WorkbenchError::AuthRejected {
                layer: Layer::Store,
                message: format!("permission denied watching {}", key),
            });
        }
        state.watches.push(WatchEntry {
            key: key.to_string(),
            prefix,
            tx,
            cancel_rx,
        });
        drop(state);
        self.store.watches_opened.fetch_add(1, Ordering::SeqCst);
        Ok(StoreWatch { events, cancel })
    }

    async fn close(&self) {}
}

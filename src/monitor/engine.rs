//! Key Monitor Engine
//!
//! ```text
//! register(config) -> group by (key, prefix) per session
//!                          |
//!          first member: spawn arm task -> store.watch()
//!                          |
//!          store events -> dispatch under session lock
//!                          -> classify per member -> queue per listener
//! ```
//!
//! Subscriptions on the same session watching the same target share one
//! store watch; it is cancelled when the last member goes away. Watches
//! are never shared across sessions. Teardown flips the session to closed
//! under the same lock the dispatcher takes, so nothing is delivered after
//! it returns. A watch that cannot be established closes its members,
//! drops them from the registry and tells the session owner which ids went.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::subscription::{KeySubscription, SubscriptionShared};
use super::types::{classify, KeyChangeEvent, SubscriptionId, SubscriptionState};
use crate::connection::KeyMonitorConfig;
use crate::error::{WorkbenchError, WorkbenchResult};
use crate::session::SessionId;
use crate::store::{StoreEvent, StoreSession, StoreWatch};

/// Transport failure observed by a watch, reported to the session owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportLoss {
    pub session_id: SessionId,
    pub message: String,
}

/// What the engine reports to the session owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorNotice {
    Lost(TransportLoss),
    /// Subscriptions closed because their watch could not be established
    WatchFailed {
        session_id: SessionId,
        subscriptions: Vec<SubscriptionId>,
    },
}

type Registry = DashMap<SubscriptionId, KeySubscription>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct WatchTarget {
    key: String,
    prefix: bool,
}

impl WatchTarget {
    fn of(config: &KeyMonitorConfig) -> Self {
        Self {
            key: config.key.clone(),
            prefix: config.is_prefix,
        }
    }
}

struct WatchGroup {
    generation: u64,
    members: Vec<SubscriptionId>,
    acknowledged: bool,
    /// Present once the store watch is established
    cancel: Option<oneshot::Sender<()>>,
}

#[derive(Default)]
struct MonitorsInner {
    closed: bool,
    next_generation: u64,
    subscriptions: HashMap<SubscriptionId, Arc<SubscriptionShared>>,
    groups: HashMap<WatchTarget, WatchGroup>,
}

/// Monitor state of one session
struct SessionMonitors {
    session_id: SessionId,
    store: Weak<dyn StoreSession>,
    inner: Mutex<MonitorsInner>,
    registry: Arc<Registry>,
    notice_tx: mpsc::UnboundedSender<MonitorNotice>,
}

impl SessionMonitors {
    /// Add a member; returns the group generation when a new watch is needed
    fn add(&self, shared: &Arc<SubscriptionShared>) -> WorkbenchResult<Option<u64>> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(WorkbenchError::SessionNotFound(self.session_id.as_u64()));
        }
        inner.subscriptions.insert(shared.id, shared.clone());

        let target = WatchTarget::of(&shared.config);
        if let Some(group) = inner.groups.get_mut(&target) {
            group.members.push(shared.id);
            if group.acknowledged {
                shared.activate();
            }
            return Ok(None);
        }

        inner.next_generation += 1;
        let generation = inner.next_generation;
        inner.groups.insert(
            target,
            WatchGroup {
                generation,
                members: vec![shared.id],
                acknowledged: false,
                cancel: None,
            },
        );
        Ok(Some(generation))
    }

    /// Record an established watch. Returns the cancel sender back if the
    /// group no longer wants it.
    fn acknowledge(
        &self,
        target: &WatchTarget,
        generation: u64,
        cancel: oneshot::Sender<()>,
    ) -> Result<(), oneshot::Sender<()>> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(cancel);
        }
        let MonitorsInner {
            groups,
            subscriptions,
            ..
        } = &mut *inner;
        match groups.get_mut(target) {
            Some(group) if group.generation == generation => {
                group.acknowledged = true;
                group.cancel = Some(cancel);
                for id in &group.members {
                    if let Some(shared) = subscriptions.get(id) {
                        shared.activate();
                    }
                }
                Ok(())
            }
            _ => Err(cancel),
        }
    }

    /// Fan a store event out to the group members. Returns false once the
    /// group is gone and the pump should stop.
    fn dispatch(&self, target: &WatchTarget, generation: u64, event: &StoreEvent) -> bool {
        let inner = self.inner.lock();
        if inner.closed {
            return false;
        }
        let Some(group) = inner.groups.get(target) else {
            return false;
        };
        if group.generation != generation {
            return false;
        }

        for id in &group.members {
            let Some(shared) = inner.subscriptions.get(id) else {
                continue;
            };
            for kind in classify(&shared.config, event) {
                shared.send(KeyChangeEvent {
                    session_id: self.session_id,
                    subscription_id: shared.id,
                    key: event.key.clone(),
                    kind,
                    value: event.value.clone(),
                    prev_value: event.prev.as_ref().map(|p| p.value.clone()),
                    lease: event.lease,
                    prev_lease: event.prev.as_ref().map(|p| p.lease),
                    revision: event.revision,
                });
            }
        }
        true
    }

    /// Close one subscription; cancels its watch if it was the last member
    fn remove(&self, id: SubscriptionId) {
        let mut inner = self.inner.lock();
        let Some(shared) = inner.subscriptions.remove(&id) else {
            return;
        };
        shared.close();

        let target = WatchTarget::of(&shared.config);
        let now_empty = match inner.groups.get_mut(&target) {
            Some(group) => {
                group.members.retain(|member| *member != id);
                group.members.is_empty()
            }
            None => false,
        };
        if now_empty {
            if let Some(group) = inner.groups.remove(&target) {
                debug!(
                    "Last member left, cancelling watch on {} for session {}",
                    target.key, self.session_id
                );
                if let Some(cancel) = group.cancel {
                    let _ = cancel.send(());
                }
            }
        }
    }

    /// Close a group whose watch could not be established
    fn fail_group(&self, target: &WatchTarget, generation: u64) -> Vec<SubscriptionId> {
        let mut inner = self.inner.lock();
        let matches = inner
            .groups
            .get(target)
            .is_some_and(|group| group.generation == generation);
        if !matches {
            return Vec::new();
        }
        let members = inner
            .groups
            .remove(target)
            .map(|group| group.members)
            .unwrap_or_default();
        for id in &members {
            self.registry.remove(id);
            if let Some(shared) = inner.subscriptions.remove(id) {
                shared.close();
            }
        }
        members
    }

    /// Close everything; later dispatches become no-ops
    fn close_all(&self) -> Vec<SubscriptionId> {
        let mut inner = self.inner.lock();
        inner.closed = true;
        for (_, group) in inner.groups.drain() {
            if let Some(cancel) = group.cancel {
                let _ = cancel.send(());
            }
        }
        inner
            .subscriptions
            .drain()
            .map(|(id, shared)| {
                shared.close();
                id
            })
            .collect()
    }

    fn report_loss(&self, message: String) {
        let _ = self.notice_tx.send(MonitorNotice::Lost(TransportLoss {
            session_id: self.session_id,
            message,
        }));
    }

    fn report_failed(&self, subscriptions: Vec<SubscriptionId>) {
        if subscriptions.is_empty() {
            return;
        }
        let _ = self.notice_tx.send(MonitorNotice::WatchFailed {
            session_id: self.session_id,
            subscriptions,
        });
    }
}

/// Per-session registry of key subscriptions
pub struct KeyMonitorEngine {
    sessions: DashMap<SessionId, Arc<SessionMonitors>>,
    subscriptions: Arc<Registry>,
    next_id: AtomicU64,
    backlog_warning: usize,
    notice_tx: mpsc::UnboundedSender<MonitorNotice>,
}

impl KeyMonitorEngine {
    /// Watch failures are reported on `notice_tx`, at most once per watch.
    /// Listener backlogs are logged every `backlog_warning` events.
    pub fn new(backlog_warning: usize, notice_tx: mpsc::UnboundedSender<MonitorNotice>) -> Self {
        Self {
            sessions: DashMap::new(),
            subscriptions: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
            backlog_warning,
            notice_tx,
        }
    }

    /// Start tracking monitors for a session backed by `store`
    pub fn attach_session(&self, session_id: SessionId, store: &Arc<dyn StoreSession>) {
        let monitors = Arc::new(SessionMonitors {
            session_id,
            store: Arc::downgrade(store),
            inner: Mutex::new(MonitorsInner::default()),
            registry: self.subscriptions.clone(),
            notice_tx: self.notice_tx.clone(),
        });
        self.sessions.insert(session_id, monitors);
    }

    /// Register a subscription on `session_id`
    ///
    /// Returns immediately in `Armed` (or `Active` when an acknowledged
    /// watch on the same target already exists).
    pub fn register(
        &self,
        session_id: SessionId,
        config: KeyMonitorConfig,
    ) -> WorkbenchResult<KeySubscription> {
        if config.key.is_empty() {
            return Err(WorkbenchError::InvalidKeyPattern(
                "monitor key must not be empty".to_string(),
            ));
        }

        let monitors = self
            .sessions
            .get(&session_id)
            .map(|entry| entry.value().clone())
            .ok_or(WorkbenchError::SessionNotFound(session_id.as_u64()))?;

        let id = SubscriptionId::from_raw(self.next_id.fetch_add(1, Ordering::SeqCst));
        let target = WatchTarget::of(&config);
        let shared = SubscriptionShared::new(
            id,
            session_id,
            config,
            SubscriptionState::Armed,
            self.backlog_warning,
        );

        // Visible in the registry before it joins a group, so a failing
        // watch can always prune it
        let subscription = KeySubscription::new(shared.clone());
        self.subscriptions.insert(id, subscription.clone());
        let generation = match monitors.add(&shared) {
            Ok(generation) => generation,
            Err(e) => {
                self.subscriptions.remove(&id);
                return Err(e);
            }
        };

        debug!(
            "Registered subscription {} on {} (prefix: {}) for session {}",
            id, target.key, target.prefix, session_id
        );

        if let Some(generation) = generation {
            tokio::spawn(run_watch(monitors, target, generation));
        }

        Ok(subscription)
    }

    /// Close a subscription; unknown or already closed ids are a no-op
    pub fn cancel(&self, id: SubscriptionId) {
        let Some((_, subscription)) = self.subscriptions.remove(&id) else {
            return;
        };
        if let Some(monitors) = self.sessions.get(&subscription.session_id()) {
            monitors.remove(id);
        }
        debug!("Subscription {} cancelled", id);
    }

    pub fn subscription(&self, id: SubscriptionId) -> Option<KeySubscription> {
        self.subscriptions.get(&id).map(|entry| entry.value().clone())
    }

    /// Subscriptions still open on a session
    pub fn session_subscriptions(&self, session_id: SessionId) -> Vec<KeySubscription> {
        let mut subscriptions: Vec<_> = self
            .subscriptions
            .iter()
            .filter(|entry| entry.value().session_id() == session_id)
            .map(|entry| entry.value().clone())
            .collect();
        subscriptions.sort_by_key(|s| s.id());
        subscriptions
    }

    /// Close every subscription of a session and forget it
    pub fn close_session(&self, session_id: SessionId) {
        let Some((_, monitors)) = self.sessions.remove(&session_id) else {
            return;
        };
        let closed = monitors.close_all();
        for id in &closed {
            self.subscriptions.remove(id);
        }
        info!(
            "Closed {} subscriptions for session {}",
            closed.len(),
            session_id
        );
    }
}

/// Establish one store watch and pump its events until cancelled or broken
async fn run_watch(monitors: Arc<SessionMonitors>, target: WatchTarget, generation: u64) {
    let Some(store) = monitors.store.upgrade() else {
        let closed = monitors.fail_group(&target, generation);
        monitors.report_failed(closed);
        return;
    };
    let watch = store.watch(&target.key, target.prefix).await;
    drop(store);

    let StoreWatch { mut events, cancel } = match watch {
        Ok(watch) => watch,
        Err(e) => {
            warn!(
                "Failed to watch {} for session {}: {}",
                target.key, monitors.session_id, e
            );
            let closed = monitors.fail_group(&target, generation);
            let transport_failed = !closed.is_empty() && is_transport_failure(&e);
            monitors.report_failed(closed);
            if transport_failed {
                monitors.report_loss(e.to_string());
            }
            return;
        }
    };

    if let Err(cancel) = monitors.acknowledge(&target, generation, cancel) {
        let _ = cancel.send(());
        return;
    }
    debug!(
        "Watch on {} active for session {}",
        target.key, monitors.session_id
    );

    while let Some(message) = events.recv().await {
        match message {
            Ok(event) => {
                if !monitors.dispatch(&target, generation, &event) {
                    break;
                }
            }
            Err(e) => {
                warn!(
                    "Watch on {} for session {} broke: {}",
                    target.key, monitors.session_id, e
                );
                monitors.report_loss(e.to_string());
                break;
            }
        }
    }
}

fn is_transport_failure(err: &WorkbenchError) -> bool {
    matches!(
        err,
        WorkbenchError::Unreachable { .. }
            | WorkbenchError::Timeout { .. }
            | WorkbenchError::ConnectionLost(_)
    )
}

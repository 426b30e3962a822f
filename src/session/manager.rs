//! Session Manager
//!
//! Owns every live session: its negotiated transport (store client plus
//! optional SSH tunnel), its `SessionData`, and the key monitors armed on
//! it. Sessions live in a `DashMap`; ids come from a monotonic counter.
//!
//! Transport loss is reported by the monitor engine (broken watch) or by
//! the SSH tunnel (disconnect). Both land on one channel; the first report
//! for a session tears it down and broadcasts a single `ConnectionLost`.
//! The same channel carries monitors whose watch could not be set up, which
//! are dropped from the session's monitor list.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use super::types::{SessionData, SessionEvent, SessionId, SessionScope};
use crate::config::Settings;
use crate::connection::{resolve_connection, Connection, KeyMonitorConfig};
use crate::error::{WorkbenchError, WorkbenchResult};
use crate::monitor::{KeyMonitorEngine, KeySubscription, MonitorNotice, SubscriptionId, TransportLoss};
use crate::ssh::SshTunnel;
use crate::store::StoreConnector;
use crate::transport::{NegotiatedTransport, TransportNegotiator};

/// Capacity of the session event broadcast
const SESSION_EVENT_CAPACITY: usize = 64;

struct SessionEntry {
    data: SessionData,
    transport: NegotiatedTransport,
    /// Monitored key -> subscription currently serving it
    monitors: HashMap<String, SubscriptionId>,
}

pub struct SessionManager {
    negotiator: TransportNegotiator,
    sessions: DashMap<SessionId, SessionEntry>,
    next_id: AtomicU64,
    monitors: KeyMonitorEngine,
    notice_tx: mpsc::UnboundedSender<MonitorNotice>,
    events_tx: broadcast::Sender<SessionEvent>,
}

impl SessionManager {
    /// Create a manager and start its loss handler
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(connector: Arc<dyn StoreConnector>, settings: Settings) -> Arc<Self> {
        let (notice_tx, notices) = mpsc::unbounded_channel();
        let (events_tx, _) = broadcast::channel(SESSION_EVENT_CAPACITY);
        let backlog_warning = settings.monitor_event_buffer;

        let manager = Arc::new(Self {
            negotiator: TransportNegotiator::new(connector, settings),
            sessions: DashMap::new(),
            next_id: AtomicU64::new(1),
            monitors: KeyMonitorEngine::new(backlog_warning, notice_tx.clone()),
            notice_tx,
            events_tx,
        });

        tokio::spawn(notice_handler(Arc::downgrade(&manager), notices));
        manager
    }

    pub fn settings(&self) -> &Settings {
        self.negotiator.settings()
    }

    pub fn monitors(&self) -> &KeyMonitorEngine {
        &self.monitors
    }

    /// Session lifecycle events (`ConnectionLost`)
    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }

    /// Handshake, probe and tear down without creating a session
    pub async fn connect_test(&self, connection: &Connection) -> WorkbenchResult<()> {
        let resolved = resolve_connection(connection, self.negotiator.settings())?;
        self.negotiator.connect_test(&resolved).await
    }

    /// Open a session and arm the monitors of `scope`
    pub async fn connect(
        &self,
        connection: &Connection,
        scope: SessionScope,
    ) -> WorkbenchResult<SessionData> {
        let resolved = resolve_connection(connection, self.negotiator.settings())?;
        let transport = self.negotiator.negotiate(&resolved).await?;

        let user = resolved.user.as_ref().map(|u| u.username.clone());
        let root = match user.as_deref() {
            None | Some("root") => true,
            Some(name) => match transport.store.is_root(name).await {
                Ok(root) => root,
                Err(e) => {
                    transport.close().await;
                    return Err(e);
                }
            },
        };

        let id = SessionId::from_raw(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.monitors.attach_session(id, &transport.store);
        if let Some(tunnel) = &transport.tunnel {
            self.watch_tunnel(id, tunnel);
        }

        // Registered before arming so an early loss report finds the session
        self.sessions.insert(
            id,
            SessionEntry {
                data: SessionData {
                    id,
                    user,
                    root,
                    namespace: resolved.namespace.clone(),
                    key_collection: scope.key_collection,
                    key_monitor_list: Vec::new(),
                },
                transport,
                monitors: HashMap::new(),
            },
        );

        let data = {
            let mut entry = self.sessions.get_mut(&id).ok_or_else(|| {
                WorkbenchError::ConnectionLost(format!("session {} lost during setup", id))
            })?;
            for config in scope.key_monitor_list {
                if let Err(e) = self.arm(&mut entry, config) {
                    warn!("Skipping monitor on session {}: {}", id, e);
                }
            }
            entry.data.clone()
        };

        info!(
            "Session {} connected to {} (user: {}, root: {}, monitors: {})",
            id,
            resolved.target(),
            data.user.as_deref().unwrap_or("<none>"),
            data.root,
            data.key_monitor_list.len()
        );
        Ok(data)
    }

    /// Register a monitor, replacing any earlier one on the same key
    pub fn add_key_monitor(
        &self,
        id: SessionId,
        config: KeyMonitorConfig,
    ) -> WorkbenchResult<KeySubscription> {
        let mut entry = self
            .sessions
            .get_mut(&id)
            .ok_or(WorkbenchError::SessionNotFound(id.as_u64()))?;
        self.arm(&mut entry, config)
    }

    /// Stop monitoring `key`; unknown keys are a no-op
    pub fn remove_key_monitor(&self, id: SessionId, key: &str) -> WorkbenchResult<()> {
        let mut entry = self
            .sessions
            .get_mut(&id)
            .ok_or(WorkbenchError::SessionNotFound(id.as_u64()))?;
        if let Some(subscription) = entry.monitors.remove(key) {
            self.monitors.cancel(subscription);
        }
        entry.data.key_monitor_list.retain(|c| c.key != key);
        Ok(())
    }

    /// Close one subscription by id and drop its key from the owning
    /// session's monitor list. Unknown or already closed ids are a no-op.
    pub fn cancel_subscription(&self, subscription_id: SubscriptionId) {
        let Some(subscription) = self.monitors.subscription(subscription_id) else {
            return;
        };
        if let Some(mut entry) = self.sessions.get_mut(&subscription.session_id()) {
            let key = &subscription.config().key;
            if entry.monitors.get(key) == Some(&subscription_id) {
                entry.monitors.remove(key);
                entry.data.key_monitor_list.retain(|c| &c.key != key);
            }
        }
        self.monitors.cancel(subscription_id);
    }

    /// Subscription currently serving `key` on a session
    pub fn key_monitor(&self, id: SessionId, key: &str) -> WorkbenchResult<Option<KeySubscription>> {
        let entry = self
            .sessions
            .get(&id)
            .ok_or(WorkbenchError::SessionNotFound(id.as_u64()))?;
        Ok(entry
            .monitors
            .get(key)
            .and_then(|sub| self.monitors.subscription(*sub)))
    }

    pub fn session(&self, id: SessionId) -> WorkbenchResult<SessionData> {
        self.sessions
            .get(&id)
            .map(|entry| entry.data.clone())
            .ok_or(WorkbenchError::SessionNotFound(id.as_u64()))
    }

    /// Snapshots of every live session, oldest first
    pub fn sessions(&self) -> Vec<SessionData> {
        let mut sessions: Vec<_> = self.sessions.iter().map(|e| e.data.clone()).collect();
        sessions.sort_by_key(|data| data.id);
        sessions
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Tear down a session
    pub async fn disconnect(&self, id: SessionId) -> WorkbenchResult<()> {
        let (_, entry) = self
            .sessions
            .remove(&id)
            .ok_or(WorkbenchError::SessionNotFound(id.as_u64()))?;
        self.teardown(id, entry).await;
        info!("Session {} disconnected", id);
        Ok(())
    }

    /// Tear down every session (application shutdown)
    pub async fn disconnect_all(&self) {
        let ids: Vec<SessionId> = self.sessions.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, entry)) = self.sessions.remove(&id) {
                self.teardown(id, entry).await;
            }
        }
        info!("All sessions disconnected");
    }

    fn arm(
        &self,
        entry: &mut SessionEntry,
        config: KeyMonitorConfig,
    ) -> WorkbenchResult<KeySubscription> {
        let subscription = self.monitors.register(entry.data.id, config.clone())?;
        if let Some(previous) = entry.monitors.insert(config.key.clone(), subscription.id()) {
            self.monitors.cancel(previous);
        }
        entry.data.key_monitor_list.retain(|c| c.key != config.key);
        entry.data.key_monitor_list.push(config);
        Ok(subscription)
    }

    async fn teardown(&self, id: SessionId, entry: SessionEntry) {
        self.monitors.close_session(id);
        entry.transport.close().await;
        debug!("Session {} transport released", id);
    }

    fn watch_tunnel(&self, id: SessionId, tunnel: &SshTunnel) {
        let link = tunnel.link();
        let notice_tx = self.notice_tx.clone();
        let label = tunnel.label().to_string();
        tokio::spawn(async move {
            link.closed().await;
            let _ = notice_tx.send(MonitorNotice::Lost(TransportLoss {
                session_id: id,
                message: format!("ssh tunnel {} disconnected", label),
            }));
        });
    }

    /// Forget monitors whose subscription the engine already closed
    fn prune_monitors(&self, session_id: SessionId, failed: &[SubscriptionId]) {
        let Some(mut entry) = self.sessions.get_mut(&session_id) else {
            return;
        };
        let SessionEntry { data, monitors, .. } = &mut *entry;
        let mut dropped = Vec::new();
        monitors.retain(|key, id| {
            if failed.contains(id) {
                dropped.push(key.clone());
                return false;
            }
            true
        });
        data.key_monitor_list.retain(|c| !dropped.contains(&c.key));
        for key in &dropped {
            warn!("Monitor on {} for session {} dropped: watch failed", key, session_id);
        }
    }

    async fn handle_loss(&self, loss: TransportLoss) {
        let Some((_, entry)) = self.sessions.remove(&loss.session_id) else {
            debug!(
                "Ignoring transport loss for closed session {}",
                loss.session_id
            );
            return;
        };
        warn!(
            "Session {} lost its transport: {}",
            loss.session_id, loss.message
        );
        self.teardown(loss.session_id, entry).await;
        let _ = self.events_tx.send(SessionEvent::ConnectionLost {
            session_id: loss.session_id,
            message: loss.message,
        });
    }
}

async fn notice_handler(
    manager: Weak<SessionManager>,
    mut notices: mpsc::UnboundedReceiver<MonitorNotice>,
) {
    while let Some(notice) = notices.recv().await {
        let Some(manager) = manager.upgrade() else {
            break;
        };
        match notice {
            MonitorNotice::Lost(loss) => manager.handle_loss(loss).await,
            MonitorNotice::WatchFailed {
                session_id,
                subscriptions,
            } => manager.prune_monitors(session_id, &subscriptions),
        }
    }
    debug!("Session notice handler exited");
}

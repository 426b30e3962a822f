//! Subscription handles and event receivers
//!
//! Every listener owns an unbounded queue, so a slow reader never loses
//! events; it only grows its backlog. The backlog is logged each time it
//! crosses another multiple of the configured threshold.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::stream::{self, Stream};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::warn;

use super::types::{KeyChangeEvent, SubscriptionId, SubscriptionInfo, SubscriptionState};
use crate::connection::KeyMonitorConfig;
use crate::session::SessionId;

/// Sending half of one listener queue
struct Listener {
    tx: mpsc::UnboundedSender<KeyChangeEvent>,
    backlog: Arc<AtomicUsize>,
}

/// Receiving half, before it is wrapped in a [`KeyEventReceiver`]
struct Queue {
    rx: mpsc::UnboundedReceiver<KeyChangeEvent>,
    backlog: Arc<AtomicUsize>,
}

fn listener_pair() -> (Listener, Queue) {
    let (tx, rx) = mpsc::unbounded_channel();
    let backlog = Arc::new(AtomicUsize::new(0));
    (
        Listener {
            tx,
            backlog: backlog.clone(),
        },
        Queue { rx, backlog },
    )
}

/// State shared between the engine and every handle of one subscription
pub(crate) struct SubscriptionShared {
    pub(crate) id: SubscriptionId,
    pub(crate) session_id: SessionId,
    pub(crate) config: KeyMonitorConfig,
    state: Mutex<SubscriptionState>,
    /// Emptied on close; dropping the senders ends every receiver
    listeners: Mutex<Vec<Listener>>,
    /// Queue created at registration, handed to the first listener
    parked: Mutex<Option<Queue>>,
    backlog_warning: usize,
}

impl SubscriptionShared {
    pub(crate) fn new(
        id: SubscriptionId,
        session_id: SessionId,
        config: KeyMonitorConfig,
        state: SubscriptionState,
        backlog_warning: usize,
    ) -> Arc<Self> {
        let (listener, queue) = listener_pair();
        Arc::new(Self {
            id,
            session_id,
            config,
            state: Mutex::new(state),
            listeners: Mutex::new(vec![listener]),
            parked: Mutex::new(Some(queue)),
            backlog_warning: backlog_warning.max(1),
        })
    }

    pub(crate) fn state(&self) -> SubscriptionState {
        *self.state.lock()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state() == SubscriptionState::Closed
    }

    /// Armed -> Active; any other state is left alone
    pub(crate) fn activate(&self) {
        let mut state = self.state.lock();
        if *state == SubscriptionState::Armed {
            *state = SubscriptionState::Active;
        }
    }

    /// Move to Closed and end all receivers. Returns false if already closed.
    pub(crate) fn close(&self) -> bool {
        {
            let mut state = self.state.lock();
            if *state == SubscriptionState::Closed {
                return false;
            }
            *state = SubscriptionState::Closed;
        }
        self.listeners.lock().clear();
        self.parked.lock().take();
        true
    }

    /// Queue `event` for every listener; dropped silently once closed
    pub(crate) fn send(&self, event: KeyChangeEvent) {
        if self.is_closed() {
            return;
        }
        let mut listeners = self.listeners.lock();
        listeners.retain(|listener| {
            if listener.tx.send(event.clone()).is_err() {
                // Receiver dropped
                return false;
            }
            let backlog = listener.backlog.fetch_add(1, Ordering::Relaxed) + 1;
            if backlog % self.backlog_warning == 0 {
                warn!(
                    "Listener of subscription {} is {} events behind",
                    self.id, backlog
                );
            }
            true
        });
    }

    fn receiver(self: &Arc<Self>) -> KeyEventReceiver {
        let queue = match self.parked.lock().take() {
            Some(queue) => queue,
            None => {
                let (listener, queue) = listener_pair();
                let mut listeners = self.listeners.lock();
                if !self.is_closed() {
                    listeners.push(listener);
                }
                queue
            }
        };
        KeyEventReceiver {
            shared: Arc::clone(self),
            queue,
        }
    }

    #[cfg(test)]
    fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }
}

/// Handle to a registered key subscription
///
/// Cheap to clone. Dropping handles does not cancel the subscription; use
/// the engine's `cancel` for that.
#[derive(Clone)]
pub struct KeySubscription {
    shared: Arc<SubscriptionShared>,
}

impl KeySubscription {
    pub(crate) fn new(shared: Arc<SubscriptionShared>) -> Self {
        Self { shared }
    }

    pub fn id(&self) -> SubscriptionId {
        self.shared.id
    }

    pub fn session_id(&self) -> SessionId {
        self.shared.session_id
    }

    pub fn config(&self) -> &KeyMonitorConfig {
        &self.shared.config
    }

    pub fn state(&self) -> SubscriptionState {
        self.shared.state()
    }

    pub fn info(&self) -> SubscriptionInfo {
        SubscriptionInfo {
            id: self.shared.id,
            session_id: self.shared.session_id,
            config: self.shared.config.clone(),
            state: self.shared.state(),
        }
    }

    /// New independent listener
    ///
    /// The first call returns the queue created at registration, so it
    /// sees every event since then.
    pub fn subscribe(&self) -> KeyEventReceiver {
        self.shared.receiver()
    }
}

impl fmt::Debug for KeySubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeySubscription")
            .field("id", &self.shared.id)
            .field("session_id", &self.shared.session_id)
            .field("key", &self.shared.config.key)
            .field("state", &self.shared.state())
            .finish()
    }
}

/// One listener of a subscription
pub struct KeyEventReceiver {
    shared: Arc<SubscriptionShared>,
    queue: Queue,
}

impl KeyEventReceiver {
    pub fn subscription_id(&self) -> SubscriptionId {
        self.shared.id
    }

    /// Events queued for this listener and not yet received
    pub fn backlog(&self) -> usize {
        self.queue.backlog.load(Ordering::Relaxed)
    }

    /// Next event, or `None` once the subscription is closed
    ///
    /// Events still queued when the subscription closes are discarded.
    pub async fn recv(&mut self) -> Option<KeyChangeEvent> {
        if self.shared.is_closed() {
            return None;
        }
        let event = self.queue.rx.recv().await?;
        self.queue.backlog.fetch_sub(1, Ordering::Relaxed);
        if self.shared.is_closed() {
            return None;
        }
        Some(event)
    }

    /// Adapt into a `Stream` that ends with the subscription
    pub fn into_stream(self) -> impl Stream<Item = KeyChangeEvent> + Send + 'static {
        stream::unfold(self, |mut receiver| async move {
            receiver.recv().await.map(|event| (event, receiver))
        })
    }
}

impl fmt::Debug for KeyEventReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyEventReceiver")
            .field("subscription_id", &self.shared.id)
            .field("backlog", &self.backlog())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::types::ChangeKind;
    use futures_util::StreamExt;

    fn event(shared: &SubscriptionShared, revision: i64) -> KeyChangeEvent {
        KeyChangeEvent {
            session_id: shared.session_id,
            subscription_id: shared.id,
            key: shared.config.key.clone(),
            kind: ChangeKind::Create,
            value: b"v".to_vec(),
            prev_value: None,
            lease: 0,
            prev_lease: None,
            revision,
        }
    }

    fn shared() -> Arc<SubscriptionShared> {
        SubscriptionShared::new(
            SubscriptionId::from_raw(1),
            SessionId::from_raw(1),
            KeyMonitorConfig::all("/k"),
            SubscriptionState::Armed,
            8,
        )
    }

    #[tokio::test]
    async fn test_first_receiver_sees_early_events() {
        let shared = shared();
        let subscription = KeySubscription::new(shared.clone());
        shared.activate();
        shared.send(event(&shared, 1));

        let mut first = subscription.subscribe();
        let mut second = subscription.subscribe();
        shared.send(event(&shared, 2));

        assert_eq!(first.recv().await.unwrap().revision, 1);
        assert_eq!(first.recv().await.unwrap().revision, 2);
        assert_eq!(second.recv().await.unwrap().revision, 2);
    }

    #[tokio::test]
    async fn test_closed_discards_buffered_events() {
        let shared = shared();
        let subscription = KeySubscription::new(shared.clone());
        let mut receiver = subscription.subscribe();
        shared.activate();
        shared.send(event(&shared, 1));

        assert!(shared.close());
        assert!(!shared.close());
        assert_eq!(subscription.state(), SubscriptionState::Closed);
        assert!(receiver.recv().await.is_none());

        // Closed is terminal
        shared.activate();
        assert_eq!(subscription.state(), SubscriptionState::Closed);
        assert!(subscription.subscribe().recv().await.is_none());
    }

    #[tokio::test]
    async fn test_slow_listener_receives_every_event() {
        let shared = SubscriptionShared::new(
            SubscriptionId::from_raw(1),
            SessionId::from_raw(1),
            KeyMonitorConfig::all("/k"),
            SubscriptionState::Active,
            2,
        );
        let subscription = KeySubscription::new(shared.clone());
        let mut receiver = subscription.subscribe();

        for revision in 1..=5 {
            shared.send(event(&shared, revision));
        }
        assert_eq!(receiver.backlog(), 5);

        let mut revisions = Vec::new();
        for _ in 0..5 {
            revisions.push(receiver.recv().await.unwrap().revision);
        }
        assert_eq!(revisions, vec![1, 2, 3, 4, 5]);
        assert_eq!(receiver.backlog(), 0);
    }

    #[tokio::test]
    async fn test_dropped_listener_is_pruned() {
        let shared = shared();
        let subscription = KeySubscription::new(shared.clone());
        let first = subscription.subscribe();
        let mut second = subscription.subscribe();
        assert_eq!(shared.listener_count(), 2);
        assert!(format!("{:?}", first).contains("subscription_id"));

        drop(first);
        shared.send(event(&shared, 1));
        assert_eq!(shared.listener_count(), 1);
        assert_eq!(second.recv().await.unwrap().revision, 1);
    }

    #[tokio::test]
    async fn test_stream_ends_on_close() {
        let shared = shared();
        let subscription = KeySubscription::new(shared.clone());
        let stream = subscription.subscribe().into_stream();
        shared.activate();
        shared.send(event(&shared, 1));

        let closer = shared.clone();
        let events: Vec<_> = stream
            .inspect(move |_| {
                closer.close();
            })
            .collect()
            .await;
        assert_eq!(events.len(), 1);
    }
}

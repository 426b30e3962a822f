//! Key Monitor Commands

use super::state::WorkbenchState;
use crate::connection::KeyMonitorConfig;
use crate::error::{ErrorPayload, WorkbenchError};
use crate::monitor::{KeyEventReceiver, SubscriptionId, SubscriptionInfo, SubscriptionState};
use crate::session::SessionId;

/// Monitor a key on a live session, replacing any monitor on the same key
pub async fn register_key_monitor(
    state: &WorkbenchState,
    session_id: SessionId,
    config: KeyMonitorConfig,
) -> Result<SubscriptionInfo, ErrorPayload> {
    let subscription = state.sessions.add_key_monitor(session_id, config)?;
    Ok(subscription.info())
}

/// Stop monitoring `key` on a session
pub async fn remove_key_monitor(
    state: &WorkbenchState,
    session_id: SessionId,
    key: String,
) -> Result<(), ErrorPayload> {
    state.sessions.remove_key_monitor(session_id, &key)?;
    Ok(())
}

/// Close one subscription and drop its key from the session's monitor
/// list; unknown or closed ids are ignored
pub async fn cancel_key_monitor(state: &WorkbenchState, subscription_id: SubscriptionId) {
    state.sessions.cancel_subscription(subscription_id);
}

/// Attach a listener to a live subscription
pub async fn key_monitor_events(
    state: &WorkbenchState,
    subscription_id: SubscriptionId,
) -> Result<KeyEventReceiver, ErrorPayload> {
    let subscription = state
        .sessions
        .monitors()
        .subscription(subscription_id)
        .filter(|s| s.state() != SubscriptionState::Closed)
        .ok_or(WorkbenchError::SubscriptionNotFound(subscription_id.as_u64()))?;
    Ok(subscription.subscribe())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::connection::connect;
    use crate::config::ConfigStorage;
    use crate::connection::Connection;
    use crate::monitor::ChangeKind;
    use crate::store::memory::{MemoryConnector, MemoryStore};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_monitor_lifecycle_through_commands() {
        let temp = tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let store = MemoryStore::new();
        let state = WorkbenchState::with_connector(
            ConfigStorage::with_path(temp.path().join("connections.json")),
            Arc::new(MemoryConnector::new(store.clone())),
        )
        .await
        .unwrap();

        let data = connect(&state, Connection::plain("127.0.0.1", port), None)
            .await
            .unwrap();

        let err = register_key_monitor(&state, data.id, KeyMonitorConfig::all(""))
            .await
            .unwrap_err();
        assert_eq!(err.err_type, "InvalidKeyPattern");

        let info = register_key_monitor(&state, data.id, KeyMonitorConfig::all("/k"))
            .await
            .unwrap();
        assert_eq!(info.session_id, data.id);
        let mut events = key_monitor_events(&state, info.id).await.unwrap();

        let subscription = state.sessions.monitors().subscription(info.id).unwrap();
        for _ in 0..200 {
            if subscription.state() == SubscriptionState::Active {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        store.put("/k", b"v1", 0);
        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.kind, ChangeKind::Create);
        assert_eq!(event.subscription_id, info.id);

        cancel_key_monitor(&state, info.id).await;
        cancel_key_monitor(&state, info.id).await;
        assert!(events.recv().await.is_none());
        let session = state.sessions.session(data.id).unwrap();
        assert!(session.key_monitor_list.is_empty());
        assert!(state.sessions.key_monitor(data.id, "/k").unwrap().is_none());

        let err = key_monitor_events(&state, info.id).await.unwrap_err();
        assert_eq!(err.err_type, "SubscriptionNotFound");

        remove_key_monitor(&state, data.id, "/k".to_string())
            .await
            .unwrap();
        let err = remove_key_monitor(&state, SessionId::from_raw(9999), "/k".to_string())
            .await
            .unwrap_err();
        assert_eq!(err.err_type, "SessionNotFound");
    }
}

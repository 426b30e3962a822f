//! Connection Commands
//!
//! Connection testing, session lifecycle and saved profile management.
//! Every command reports failures as an [`ErrorPayload`].

use tokio::sync::broadcast;
use tracing::info;

use super::state::WorkbenchState;
use crate::config::ConnectionInfo;
use crate::connection::Connection;
use crate::error::ErrorPayload;
use crate::session::{SessionData, SessionEvent, SessionId, SessionScope};

/// Handshake against a connection without creating a session
pub async fn connect_test(
    state: &WorkbenchState,
    connection: Connection,
) -> Result<(), ErrorPayload> {
    state.sessions.connect_test(&connection).await?;
    Ok(())
}

/// Open a session for an ad-hoc connection
pub async fn connect(
    state: &WorkbenchState,
    connection: Connection,
    scope: Option<SessionScope>,
) -> Result<SessionData, ErrorPayload> {
    let data = state
        .sessions
        .connect(&connection, scope.unwrap_or_default())
        .await?;
    Ok(data)
}

/// Open a session for a saved profile, arming its monitors
pub async fn connect_saved(state: &WorkbenchState, name: String) -> Result<SessionData, ErrorPayload> {
    let info = state.profiles.get(&name).await?;
    let data = state
        .sessions
        .connect(&info.connection, SessionScope::from(&info))
        .await?;
    info!("Profile {} opened as session {}", name, data.id);
    Ok(data)
}

pub async fn disconnect(state: &WorkbenchState, session_id: SessionId) -> Result<(), ErrorPayload> {
    state.sessions.disconnect(session_id).await?;
    Ok(())
}

pub async fn get_connection_list(
    state: &WorkbenchState,
) -> Result<Vec<ConnectionInfo>, ErrorPayload> {
    Ok(state.profiles.list().await)
}

/// Save (create or update) a profile
pub async fn save_connection(
    state: &WorkbenchState,
    info: ConnectionInfo,
) -> Result<(), ErrorPayload> {
    state.profiles.save(info).await?;
    Ok(())
}

pub async fn remove_connection(state: &WorkbenchState, name: String) -> Result<(), ErrorPayload> {
    state.profiles.remove(&name).await?;
    Ok(())
}

/// Make `name` the default profile, or clear the default with `None`
pub async fn set_default_connection(
    state: &WorkbenchState,
    name: Option<String>,
) -> Result<(), ErrorPayload> {
    state.profiles.set_default(name.as_deref()).await?;
    Ok(())
}

/// Session lifecycle events (`ConnectionLost`)
pub fn session_events(state: &WorkbenchState) -> broadcast::Receiver<SessionEvent> {
    state.sessions.subscribe_events()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigStorage;
    use crate::connection::KeyMonitorConfig;
    use crate::store::memory::{MemoryConnector, MemoryStore};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};
    use tokio::net::TcpListener;

    struct Fixture {
        state: Arc<WorkbenchState>,
        store: Arc<MemoryStore>,
        port: u16,
        _listener: TcpListener,
        _temp: TempDir,
    }

    async fn fixture() -> Fixture {
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
        Fixture {
            state,
            store,
            port,
            _listener: listener,
            _temp: temp,
        }
    }

    #[tokio::test]
    async fn test_connect_saved_arms_profile_monitors() {
        let f = fixture().await;
        let mut info = ConnectionInfo::new("local", Connection::plain("127.0.0.1", f.port));
        info.key_collection = vec!["/cfg/a".to_string()];
        info.key_monitor_list = vec![KeyMonitorConfig::all("/cfg/a")];
        save_connection(&f.state, info).await.unwrap();

        let data = connect_saved(&f.state, "local".to_string()).await.unwrap();
        assert_eq!(data.key_collection, vec!["/cfg/a".to_string()]);
        assert_eq!(data.key_monitor_list.len(), 1);
        assert_eq!(f.state.sessions.session_count(), 1);

        disconnect(&f.state, data.id).await.unwrap();
        let err = disconnect(&f.state, data.id).await.unwrap_err();
        assert_eq!(err.err_type, "SessionNotFound");
    }

    #[tokio::test]
    async fn test_unknown_profile_reported_as_payload() {
        let f = fixture().await;
        let err = connect_saved(&f.state, "missing".to_string())
            .await
            .unwrap_err();
        assert_eq!(err.err_type, "ProfileNotFound");
        assert!(err.err_msg.contains("missing"));
    }

    #[tokio::test]
    async fn test_profile_commands() {
        let f = fixture().await;
        let conn = Connection::plain("127.0.0.1", f.port);
        save_connection(&f.state, ConnectionInfo::new("a", conn.clone()).as_default())
            .await
            .unwrap();
        save_connection(&f.state, ConnectionInfo::new("b", conn).as_default())
            .await
            .unwrap();

        let list = get_connection_list(&f.state).await.unwrap();
        let defaults: Vec<_> = list.iter().filter(|c| c.default).map(|c| c.name.as_str()).collect();
        assert_eq!(defaults, vec!["b"]);

        set_default_connection(&f.state, None).await.unwrap();
        remove_connection(&f.state, "a".to_string()).await.unwrap();
        let list = get_connection_list(&f.state).await.unwrap();
        assert_eq!(list.len(), 1);
        assert!(!list[0].default);

        let err = set_default_connection(&f.state, Some("a".to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.err_type, "ProfileNotFound");
    }

    #[tokio::test]
    async fn test_connect_test_leaves_no_session() {
        let f = fixture().await;
        connect_test(&f.state, Connection::plain("127.0.0.1", f.port))
            .await
            .unwrap();
        assert_eq!(f.state.sessions.session_count(), 0);
        assert!(get_connection_list(&f.state).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_session_events_report_loss() {
        let f = fixture().await;
        let mut events = session_events(&f.state);
        let scope = SessionScope {
            key_collection: Vec::new(),
            key_monitor_list: vec![KeyMonitorConfig::all("/k")],
        };
        let data = connect(&f.state, Connection::plain("127.0.0.1", f.port), Some(scope))
            .await
            .unwrap();

        let subscription = f
            .state
            .sessions
            .key_monitor(data.id, "/k")
            .unwrap()
            .unwrap();
        for _ in 0..200 {
            if subscription.state() == crate::monitor::SubscriptionState::Active {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        f.store.break_watches();

        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.session_id(), data.id);

        f.state.shutdown().await;
        assert_eq!(f.state.sessions.session_count(), 0);
    }
}

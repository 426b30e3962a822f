//! Shared application state behind the command boundary

use std::sync::Arc;

use tracing::info;

use crate::config::{ConfigStorage, ProfileStore};
use crate::error::WorkbenchResult;
use crate::session::SessionManager;
use crate::store::{EtcdConnector, StoreConnector};

/// Everything a command needs: the profile registry and live sessions
pub struct WorkbenchState {
    pub profiles: ProfileStore,
    pub sessions: Arc<SessionManager>,
}

impl WorkbenchState {
    /// Load profiles from the default config location and talk to etcd
    ///
    /// Must be called from within a Tokio runtime.
    pub async fn new() -> WorkbenchResult<Arc<Self>> {
        let storage = ConfigStorage::new()?;
        Self::with_connector(storage, Arc::new(EtcdConnector)).await
    }

    /// Build state over a custom storage location and store connector
    pub async fn with_connector(
        storage: ConfigStorage,
        connector: Arc<dyn StoreConnector>,
    ) -> WorkbenchResult<Arc<Self>> {
        let profiles = ProfileStore::load(storage).await?;
        let settings = profiles.settings().await;
        let sessions = SessionManager::new(connector, settings);

        Ok(Arc::new(Self { profiles, sessions }))
    }

    /// Tear down every session before exit
    pub async fn shutdown(&self) {
        info!("Shutting down {} session(s)", self.sessions.session_count());
        self.sessions.disconnect_all().await;
    }
}

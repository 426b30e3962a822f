//! Connection Profile Store
//!
//! Named, reusable connection profiles persisted to `connections.json`.
//! At most one profile is the default.

use tokio::sync::Mutex;
use tracing::{debug, info};

use super::storage::ConfigStorage;
use super::types::{ConfigFile, ConnectionInfo, Settings};
use crate::connection::resolve_connection;
use crate::error::{WorkbenchError, WorkbenchResult};

/// Durable profile registry
///
/// Every mutation holds the mutex across the disk write, so concurrent
/// callers observe saves in a single order.
pub struct ProfileStore {
    storage: ConfigStorage,
    config: Mutex<ConfigFile>,
}

impl ProfileStore {
    /// Load the registry from disk
    pub async fn load(storage: ConfigStorage) -> WorkbenchResult<Self> {
        let config = storage.load().await?;

        let defaults: Vec<&str> = config
            .connections
            .iter()
            .filter(|c| c.default)
            .map(|c| c.name.as_str())
            .collect();
        if defaults.len() > 1 {
            return Err(WorkbenchError::ProfileConflict(format!(
                "{} is marked default by {} profiles: {}",
                storage.path().display(),
                defaults.len(),
                defaults.join(", ")
            )));
        }

        info!(
            "Loaded {} connection profile(s) from {:?}",
            config.connections.len(),
            storage.path()
        );

        Ok(Self {
            storage,
            config: Mutex::new(config),
        })
    }

    /// All profiles in insertion order
    pub async fn list(&self) -> Vec<ConnectionInfo> {
        self.config.lock().await.connections.clone()
    }

    pub async fn get(&self, name: &str) -> WorkbenchResult<ConnectionInfo> {
        self.config
            .lock()
            .await
            .connections
            .iter()
            .find(|c| c.name == name)
            .cloned()
            .ok_or_else(|| WorkbenchError::ProfileNotFound(name.to_string()))
    }

    pub async fn default_profile(&self) -> Option<ConnectionInfo> {
        self.config
            .lock()
            .await
            .connections
            .iter()
            .find(|c| c.default)
            .cloned()
    }

    pub async fn settings(&self) -> Settings {
        self.config.lock().await.settings.clone()
    }

    /// Insert or replace a profile by name
    ///
    /// Saving a profile flagged default clears the flag on every other one.
    pub async fn save(&self, info: ConnectionInfo) -> WorkbenchResult<()> {
        let name = info.name.trim().to_string();
        if name.is_empty() {
            return Err(WorkbenchError::InvalidProfile(
                "profile name is empty".to_string(),
            ));
        }
        let info = ConnectionInfo { name, ..info };

        let mut config = self.config.lock().await;
        resolve_connection(&info.connection, &config.settings)?;

        let mut next = config.clone();
        if info.default {
            for other in next.connections.iter_mut() {
                other.default = false;
            }
        }
        match next.connections.iter_mut().find(|c| c.name == info.name) {
            Some(existing) => *existing = info.clone(),
            None => next.connections.push(info.clone()),
        }

        self.persist(&mut config, next).await?;
        debug!("Saved connection profile {}", info.name);
        Ok(())
    }

    /// Remove a profile; removing the default leaves no default
    pub async fn remove(&self, name: &str) -> WorkbenchResult<()> {
        let mut config = self.config.lock().await;
        if !config.connections.iter().any(|c| c.name == name) {
            return Err(WorkbenchError::ProfileNotFound(name.to_string()));
        }

        let mut next = config.clone();
        next.connections.retain(|c| c.name != name);

        self.persist(&mut config, next).await?;
        debug!("Removed connection profile {}", name);
        Ok(())
    }

    /// Mark `name` as the only default, or clear the default with `None`
    pub async fn set_default(&self, name: Option<&str>) -> WorkbenchResult<()> {
        let mut config = self.config.lock().await;
        if let Some(name) = name {
            if !config.connections.iter().any(|c| c.name == name) {
                return Err(WorkbenchError::ProfileNotFound(name.to_string()));
            }
        }

        let mut next = config.clone();
        for profile in next.connections.iter_mut() {
            profile.default = Some(profile.name.as_str()) == name;
        }

        self.persist(&mut config, next).await?;
        debug!("Default connection profile set to {:?}", name);
        Ok(())
    }

    /// Write `next` to disk, then swap it in. A failed write leaves memory untouched.
    async fn persist(&self, current: &mut ConfigFile, next: ConfigFile) -> WorkbenchResult<()> {
        self.storage.save(&next).await?;
        *current = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Connection, ConnectionSsh, ConnectionTls};
    use tempfile::{tempdir, TempDir};

    async fn store() -> (TempDir, ProfileStore) {
        let temp = tempdir().unwrap();
        let storage = ConfigStorage::with_path(temp.path().join("connections.json"));
        let store = ProfileStore::load(storage).await.unwrap();
        (temp, store)
    }

    fn profile(name: &str) -> ConnectionInfo {
        ConnectionInfo::new(name, Connection::plain("127.0.0.1", 2379))
    }

    async fn reload(temp: &TempDir) -> ProfileStore {
        let storage = ConfigStorage::with_path(temp.path().join("connections.json"));
        ProfileStore::load(storage).await.unwrap()
    }

    #[tokio::test]
    async fn test_save_keeps_insertion_order_and_upserts() {
        let (temp, store) = store().await;
        store.save(profile("b")).await.unwrap();
        store.save(profile("a")).await.unwrap();

        let mut updated = profile("b");
        updated.key_collection = vec!["/app/config".to_string()];
        store.save(updated).await.unwrap();

        let names: Vec<_> = store.list().await.into_iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["b", "a"]);

        let reloaded = reload(&temp).await;
        let b = reloaded.get("b").await.unwrap();
        assert_eq!(b.key_collection, vec!["/app/config".to_string()]);
    }

    #[tokio::test]
    async fn test_default_switching() {
        let (temp, store) = store().await;
        store.save(profile("A").as_default()).await.unwrap();
        store.save(profile("B").as_default()).await.unwrap();

        let list = store.list().await;
        assert_eq!(list.iter().filter(|c| c.default).count(), 1);
        assert_eq!(store.default_profile().await.unwrap().name, "B");
        assert!(!store.get("A").await.unwrap().default);

        store.set_default(Some("A")).await.unwrap();
        assert_eq!(store.default_profile().await.unwrap().name, "A");

        store.set_default(None).await.unwrap();
        assert!(store.default_profile().await.is_none());

        let reloaded = reload(&temp).await;
        assert!(reloaded.default_profile().await.is_none());
        assert_eq!(reloaded.list().await.len(), 2);
    }

    #[tokio::test]
    async fn test_removing_default_leaves_none() {
        let (_temp, store) = store().await;
        store.save(profile("A").as_default()).await.unwrap();
        store.save(profile("B")).await.unwrap();

        store.remove("A").await.unwrap();
        assert!(store.default_profile().await.is_none());
        assert_eq!(store.list().await.len(), 1);

        let err = store.remove("A").await.unwrap_err();
        assert_eq!(err.kind(), "ProfileNotFound");
    }

    #[tokio::test]
    async fn test_invalid_profiles_rejected() {
        let (temp, store) = store().await;

        let err = store.save(profile("   ")).await.unwrap_err();
        assert_eq!(err.kind(), "InvalidProfile");

        let both = Connection::plain("127.0.0.1", 2379)
            .with_tls(ConnectionTls::default())
            .with_ssh(ConnectionSsh {
                host: "bastion".to_string(),
                port: 22,
                user: "ops".to_string(),
                identity: None,
                host_key_fingerprint: None,
            });
        let err = store
            .save(ConnectionInfo::new("both", both))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "InvalidCredential");

        let err = store.set_default(Some("missing")).await.unwrap_err();
        assert_eq!(err.kind(), "ProfileNotFound");

        assert!(store.list().await.is_empty());
        assert!(!temp.path().join("connections.json").exists());
    }

    #[tokio::test]
    async fn test_names_are_trimmed() {
        let (_temp, store) = store().await;
        store.save(profile("  local  ")).await.unwrap();
        assert!(store.get("local").await.is_ok());
    }

    #[tokio::test]
    async fn test_conflicting_file_refused() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("connections.json");
        let mut config = ConfigFile::default();
        config.connections.push(profile("A").as_default());
        config.connections.push(profile("B").as_default());
        std::fs::write(&path, serde_json::to_string(&config).unwrap()).unwrap();

        let err = match ProfileStore::load(ConfigStorage::with_path(path)).await {
            Ok(_) => panic!("conflicting defaults accepted"),
            Err(err) => err,
        };
        assert_eq!(err.kind(), "ProfileConflict");
    }

    #[tokio::test]
    async fn test_concurrent_saves_all_persist() {
        let (temp, store) = store().await;
        let store = std::sync::Arc::new(store);

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.save(profile(&format!("p{}", i))).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let reloaded = reload(&temp).await;
        assert_eq!(reloaded.list().await.len(), 8);
    }
}

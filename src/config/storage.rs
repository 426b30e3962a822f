//! Profile file on disk
//!
//! `connections.json` lives in `~/.etcd-workbench` (macOS/Linux) or
//! `%APPDATA%\EtcdWorkbench` (Windows). Writes go to a sibling temp file
//! that is renamed over the original, so readers never see half a file.

use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{error, warn};

use super::types::{ConfigFile, CONFIG_VERSION};
use crate::error::WorkbenchError;

const FILE_NAME: &str = "connections.json";

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("no home directory to keep workbench settings in")]
    NoHomeDir,

    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot encode profiles: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("profile file version {found} is newer than this build understands ({supported})")]
    VersionTooNew { found: u32, supported: u32 },
}

impl From<StorageError> for WorkbenchError {
    fn from(err: StorageError) -> Self {
        WorkbenchError::Storage(err.to_string())
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StorageError + '_ {
    move |source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Directory holding workbench settings
pub fn config_dir() -> Result<PathBuf, StorageError> {
    #[cfg(windows)]
    {
        if let Some(app_data) = dirs::config_dir() {
            return Ok(app_data.join("EtcdWorkbench"));
        }
    }

    dirs::home_dir()
        .map(|home| home.join(".etcd-workbench"))
        .ok_or(StorageError::NoHomeDir)
}

pub fn connections_file() -> Result<PathBuf, StorageError> {
    Ok(config_dir()?.join(FILE_NAME))
}

/// Reads and atomically rewrites one profile file
#[derive(Debug, Clone)]
pub struct ConfigStorage {
    path: PathBuf,
}

impl ConfigStorage {
    /// Storage at the platform default location
    pub fn new() -> Result<Self, StorageError> {
        Ok(Self::with_path(connections_file()?))
    }

    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the profile file
    ///
    /// A missing file is an empty registry. An unparsable file is set aside
    /// as `connections.json.corrupt-<timestamp>` and also reads as empty.
    pub async fn load(&self) -> Result<ConfigFile, StorageError> {
        let raw = match fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ConfigFile::default()),
            Err(e) => return Err(io_error(&self.path)(e)),
        };

        let config: ConfigFile = match serde_json::from_str(&raw) {
            Ok(config) => config,
            Err(e) => {
                warn!("{:?} is not a valid profile file: {}", self.path, e);
                self.quarantine().await;
                return Ok(ConfigFile::default());
            }
        };

        if config.version > CONFIG_VERSION {
            return Err(StorageError::VersionTooNew {
                found: config.version,
                supported: CONFIG_VERSION,
            });
        }
        Ok(config)
    }

    /// Replace the profile file with `config`
    pub async fn save(&self, config: &ConfigFile) -> Result<(), StorageError> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).await.map_err(io_error(dir))?;
        }

        let body = serde_json::to_vec_pretty(config)?;
        let staging = self.path.with_extension("json.tmp");

        let mut file = fs::File::create(&staging)
            .await
            .map_err(io_error(&staging))?;
        file.write_all(&body).await.map_err(io_error(&staging))?;
        file.sync_all().await.map_err(io_error(&staging))?;
        drop(file);

        fs::rename(&staging, &self.path)
            .await
            .map_err(io_error(&self.path))
    }

    /// Move an unreadable file out of the way so the next save starts clean
    async fn quarantine(&self) {
        let stamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
        let aside = self.path.with_extension(format!("json.corrupt-{}", stamp));
        match fs::rename(&self.path, &aside).await {
            Ok(()) => warn!("Unreadable profiles kept at {:?}; starting empty", aside),
            Err(e) => error!("Could not set aside {:?}: {}", self.path, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::ConnectionInfo;
    use crate::connection::Connection;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_missing_file_reads_empty() {
        let dir = tempdir().unwrap();
        let storage = ConfigStorage::with_path(dir.path().join(FILE_NAME));

        let config = storage.load().await.unwrap();
        assert_eq!(config, ConfigFile::default());
    }

    #[tokio::test]
    async fn test_write_then_read_back() {
        let dir = tempdir().unwrap();
        let storage = ConfigStorage::with_path(dir.path().join("nested").join(FILE_NAME));

        let mut config = ConfigFile::default();
        config
            .connections
            .push(ConnectionInfo::new("local", Connection::plain("127.0.0.1", 2379)));
        config.settings.request_timeout_seconds = 7;
        storage.save(&config).await.unwrap();

        assert!(!storage.path().with_extension("json.tmp").exists());
        assert_eq!(storage.load().await.unwrap(), config);
    }

    #[tokio::test]
    async fn test_unparsable_file_is_set_aside() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(FILE_NAME);
        std::fs::write(&path, "{ not json").unwrap();
        let storage = ConfigStorage::with_path(path.clone());

        let config = storage.load().await.unwrap();
        assert!(config.connections.is_empty());
        assert!(!path.exists());

        let aside: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| name.contains(".corrupt-"))
            .collect();
        assert_eq!(aside.len(), 1);
    }

    #[tokio::test]
    async fn test_future_version_refused() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(FILE_NAME);
        std::fs::write(&path, r#"{"version": 99, "connections": []}"#).unwrap();

        let err = ConfigStorage::with_path(path).load().await.unwrap_err();
        assert!(matches!(err, StorageError::VersionTooNew { found: 99, .. }));
        assert_eq!(WorkbenchError::from(err).kind(), "Storage");
    }
}

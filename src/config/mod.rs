//! Configuration Management Module
//!
//! Persistent storage of connection profiles and workbench settings.

pub mod profiles;
pub mod storage;
pub mod types;

pub use profiles::ProfileStore;
pub use storage::{config_dir, connections_file, ConfigStorage, StorageError};
pub use types::{ConfigFile, ConnectionInfo, Settings, CONFIG_VERSION};

//! Persisted configuration types

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::connection::{Connection, KeyMonitorConfig};

/// Current config file format version
pub const CONFIG_VERSION: u32 = 1;

/// A named, reusable connection profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub name: String,
    pub connection: Connection,
    #[serde(default)]
    pub key_collection: Vec<String>,
    #[serde(default)]
    pub key_monitor_list: Vec<KeyMonitorConfig>,
    #[serde(default)]
    pub default: bool,
}

impl ConnectionInfo {
    pub fn new(name: impl Into<String>, connection: Connection) -> Self {
        Self {
            name: name.into(),
            connection,
            key_collection: Vec::new(),
            key_monitor_list: Vec::new(),
            default: false,
        }
    }

    pub fn as_default(mut self) -> Self {
        self.default = true;
        self
    }
}

/// Tunables for negotiation and monitoring
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// Bound for each of DNS, TCP and store connect (TLS + gRPC)
    pub connect_timeout_seconds: u64,
    /// Bound for individual store requests
    pub request_timeout_seconds: u64,
    /// Bound for each SSH layer (TCP, handshake, authentication)
    pub ssh_connect_timeout_seconds: u64,
    pub ssh_keepalive_interval_seconds: u64,
    pub ssh_keepalive_max: usize,
    pub ssh_inactivity_timeout_seconds: u64,
    /// Allow SSH tunnels without identity (authentication method `none`)
    pub allow_anonymous_ssh: bool,
    /// Listener backlog, in events, at which a warning is logged (and at
    /// each further multiple); listeners never drop events
    pub monitor_event_buffer: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            connect_timeout_seconds: 5,
            request_timeout_seconds: 3,
            ssh_connect_timeout_seconds: 10,
            ssh_keepalive_interval_seconds: 5,
            ssh_keepalive_max: 6,
            ssh_inactivity_timeout_seconds: 10,
            allow_anonymous_ssh: false,
            monitor_event_buffer: 256,
        }
    }
}

impl Settings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    pub fn ssh_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.ssh_connect_timeout_seconds)
    }
}

/// On-disk layout of `connections.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigFile {
    pub version: u32,
    #[serde(default)]
    pub connections: Vec<ConnectionInfo>,
    #[serde(default)]
    pub settings: Settings,
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            connections: Vec::new(),
            settings: Settings::default(),
        }
    }
}

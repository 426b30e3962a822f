//! Session data types

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::ConnectionInfo;
use crate::connection::KeyMonitorConfig;

/// Opaque session handle
///
/// Ids are allocated from a monotonic counter and never reused while the
/// manager runs. Crosses the IPC boundary as a plain number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(u64);

impl SessionId {
    /// Rebuild an id received from the UI
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a session was opened for: key groupings and monitors to arm
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionScope {
    #[serde(default)]
    pub key_collection: Vec<String>,
    #[serde(default)]
    pub key_monitor_list: Vec<KeyMonitorConfig>,
}

impl From<&ConnectionInfo> for SessionScope {
    fn from(info: &ConnectionInfo) -> Self {
        Self {
            key_collection: info.key_collection.clone(),
            key_monitor_list: info.key_monitor_list.clone(),
        }
    }
}

/// Snapshot of a live session as reported to the UI
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionData {
    pub id: SessionId,
    /// Store user the session authenticated as
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    pub root: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub key_collection: Vec<String>,
    pub key_monitor_list: Vec<KeyMonitorConfig>,
}

/// Session lifecycle notifications
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type")]
pub enum SessionEvent {
    /// The transport died; the session is already torn down
    ConnectionLost {
        #[serde(rename = "sessionId")]
        session_id: SessionId,
        message: String,
    },
}

impl SessionEvent {
    pub fn session_id(&self) -> SessionId {
        match self {
            SessionEvent::ConnectionLost { session_id, .. } => *session_id,
        }
    }
}

//! Workbench error taxonomy
//!
//! Every failure that crosses the command boundary is a [`WorkbenchError`]
//! and is reported to the UI as an [`ErrorPayload`] (`{errType, errMsg}`).

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Transport layer that produced a negotiation failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layer {
    /// Host name resolution
    Dns,
    /// Plain TCP connect
    Tcp,
    /// TLS handshake toward the store
    Tls,
    /// SSH handshake, authentication or channel setup
    Ssh,
    /// Store protocol (gRPC channel, store authentication, requests)
    Store,
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Layer::Dns => "dns",
            Layer::Tcp => "tcp",
            Layer::Tls => "tls",
            Layer::Ssh => "ssh",
            Layer::Store => "store",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkbenchError {
    #[error("Invalid credential: {0}")]
    InvalidCredential(String),

    #[error("[{layer}] unreachable: {message}")]
    Unreachable { layer: Layer, message: String },

    #[error("[{layer}] timed out after {seconds}s")]
    Timeout { layer: Layer, seconds: u64 },

    #[error("[{layer}] authentication rejected: {message}")]
    AuthRejected { layer: Layer, message: String },

    #[error("Invalid key pattern: {0}")]
    InvalidKeyPattern(String),

    #[error("Session not found: {0}")]
    SessionNotFound(u64),

    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(u64),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Profile conflict: {0}")]
    ProfileConflict(String),

    #[error("Invalid profile: {0}")]
    InvalidProfile(String),

    #[error("Profile not found: {0}")]
    ProfileNotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl WorkbenchError {
    pub fn unreachable(layer: Layer, message: impl Into<String>) -> Self {
        Self::Unreachable {
            layer,
            message: message.into(),
        }
    }

    pub fn auth_rejected(layer: Layer, message: impl Into<String>) -> Self {
        Self::AuthRejected {
            layer,
            message: message.into(),
        }
    }

    /// Taxonomy tag used as `errType`
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidCredential(_) => "InvalidCredential",
            Self::Unreachable { .. } => "Unreachable",
            Self::Timeout { .. } => "Timeout",
            Self::AuthRejected { .. } => "AuthRejected",
            Self::InvalidKeyPattern(_) => "InvalidKeyPattern",
            Self::SessionNotFound(_) => "SessionNotFound",
            Self::SubscriptionNotFound(_) => "SubscriptionNotFound",
            Self::ConnectionLost(_) => "ConnectionLost",
            Self::ProfileConflict(_) => "ProfileConflict",
            Self::InvalidProfile(_) => "InvalidProfile",
            Self::ProfileNotFound(_) => "ProfileNotFound",
            Self::Storage(_) => "Storage",
        }
    }

    /// The transport layer that failed, for negotiation errors
    pub fn layer(&self) -> Option<Layer> {
        match self {
            Self::Unreachable { layer, .. }
            | Self::Timeout { layer, .. }
            | Self::AuthRejected { layer, .. } => Some(*layer),
            _ => None,
        }
    }

    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload {
            err_type: self.kind().to_string(),
            err_msg: self.to_string(),
        }
    }
}

/// Uniform error shape reported to the UI
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub err_type: String,
    pub err_msg: String,
}

impl From<WorkbenchError> for ErrorPayload {
    fn from(err: WorkbenchError) -> Self {
        err.to_payload()
    }
}

impl fmt::Display for ErrorPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.err_type, self.err_msg)
    }
}

// Serialize as the IPC payload rather than as a bare string
impl Serialize for WorkbenchError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.to_payload().serialize(serializer)
    }
}

pub type WorkbenchResult<T> = Result<T, WorkbenchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_shape() {
        let err = WorkbenchError::unreachable(Layer::Tcp, "connection refused");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["errType"], "Unreachable");
        assert_eq!(json["errMsg"], "[tcp] unreachable: connection refused");
    }

    #[test]
    fn test_layer_is_preserved() {
        let err = WorkbenchError::Timeout {
            layer: Layer::Ssh,
            seconds: 10,
        };
        assert_eq!(err.layer(), Some(Layer::Ssh));
        assert_eq!(err.kind(), "Timeout");
        assert_eq!(WorkbenchError::SessionNotFound(3).layer(), None);
    }
}

//! SSH Error types

use thiserror::Error;

use crate::error::{Layer, WorkbenchError};

#[derive(Error, Debug)]
pub enum SshError {
    #[error("Address resolution failed: {0}")]
    ResolveFailed(String),

    #[error("Address resolution timed out after {0}s")]
    ResolveTimeout(u64),

    #[error("TCP connect failed: {0}")]
    TcpConnectFailed(String),

    #[error("TCP connect timed out after {0}s")]
    TcpTimeout(u64),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Host key mismatch: expected {expected}, got {actual}")]
    HostKeyMismatch { expected: String, actual: String },

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("SSH protocol error: {0}")]
    ProtocolError(String),

    #[error("Key error: {0}")]
    KeyError(String),

    #[error("Timeout after {0}s")]
    Timeout(u64),

    #[error("Disconnected")]
    Disconnected,
}

impl From<russh::Error> for SshError {
    fn from(err: russh::Error) -> Self {
        SshError::ProtocolError(err.to_string())
    }
}

impl From<russh::keys::Error> for SshError {
    fn from(err: russh::keys::Error) -> Self {
        SshError::KeyError(err.to_string())
    }
}

impl From<SshError> for WorkbenchError {
    fn from(err: SshError) -> Self {
        match err {
            SshError::ResolveFailed(msg) => WorkbenchError::unreachable(Layer::Dns, msg),
            SshError::ResolveTimeout(seconds) => WorkbenchError::Timeout {
                layer: Layer::Dns,
                seconds,
            },
            SshError::TcpConnectFailed(msg) => WorkbenchError::unreachable(Layer::Tcp, msg),
            SshError::TcpTimeout(seconds) => WorkbenchError::Timeout {
                layer: Layer::Tcp,
                seconds,
            },
            SshError::Timeout(seconds) => WorkbenchError::Timeout {
                layer: Layer::Ssh,
                seconds,
            },
            SshError::AuthenticationFailed(msg) => WorkbenchError::auth_rejected(Layer::Ssh, msg),
            err @ SshError::HostKeyMismatch { .. } => {
                WorkbenchError::auth_rejected(Layer::Ssh, err.to_string())
            }
            SshError::KeyError(msg) => WorkbenchError::InvalidCredential(msg),
            SshError::Disconnected => {
                WorkbenchError::ConnectionLost("ssh tunnel disconnected".to_string())
            }
            other => WorkbenchError::unreachable(Layer::Ssh, other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layer_mapping() {
        let err: WorkbenchError = SshError::AuthenticationFailed("denied".into()).into();
        assert_eq!(err.kind(), "AuthRejected");
        assert_eq!(err.layer(), Some(Layer::Ssh));

        let err: WorkbenchError = SshError::Timeout(10).into();
        assert_eq!(err.kind(), "Timeout");

        let err: WorkbenchError = SshError::ResolveFailed("no such host".into()).into();
        assert_eq!(err.kind(), "Unreachable");
        assert_eq!(err.layer(), Some(Layer::Dns));

        let err: WorkbenchError = SshError::ResolveTimeout(5).into();
        assert_eq!(
            err,
            WorkbenchError::Timeout {
                layer: Layer::Dns,
                seconds: 5
            }
        );

        let err: WorkbenchError = SshError::TcpConnectFailed("refused".into()).into();
        assert_eq!(err.kind(), "Unreachable");
        assert_eq!(err.layer(), Some(Layer::Tcp));

        let err: WorkbenchError = SshError::ConnectionFailed("handshake".into()).into();
        assert_eq!(err.layer(), Some(Layer::Ssh));
    }
}

//! Connection descriptors and credential resolution

pub mod credentials;
pub mod types;

pub use credentials::{
    resolve_connection, ResolvedConnection, Secret, SshAuth, SshTunnelSpec, StoreCredentials,
    TlsMaterial, TransportSecurity,
};
pub use types::{
    Connection, ConnectionSsh, ConnectionTls, ConnectionUser, KeyMonitorConfig, SshIdentity,
    SshPrivateKey, TlsIdentity, DEFAULT_STORE_PORT,
};

//! etcd Workbench - connection and session core
//!
//! Negotiates plain, TLS and SSH-tunneled connections to etcd clusters,
//! keeps the resulting sessions, monitors keys on them and persists named
//! connection profiles.

pub mod commands;
pub mod config;
pub mod connection;
pub mod error;
pub mod monitor;
pub mod session;
pub mod ssh;
pub mod store;
pub mod transport;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use commands::WorkbenchState;
pub use error::{ErrorPayload, Layer, WorkbenchError, WorkbenchResult};

/// Install the global tracing subscriber
///
/// Filter defaults to `info` and can be overridden through `RUST_LOG`.
/// Calling it more than once is harmless.
pub fn init_logging() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

//! Command boundary
//!
//! The operations exposed to the UI. Arguments and results are serde
//! types; failures cross as `ErrorPayload { errType, errMsg }`.

pub mod connection;
pub mod monitor;
mod state;

pub use connection::*;
pub use monitor::*;
pub use state::WorkbenchState;

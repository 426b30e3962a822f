//! Session Management Module
//!
//! - Monotonic, opaque session ids
//! - Root privilege derived from store-side roles
//! - Thread-safe session access via DashMap
//! - Single `ConnectionLost` broadcast per failed session

mod manager;
mod types;

pub use manager::SessionManager;
pub use types::{SessionData, SessionEvent, SessionId, SessionScope};

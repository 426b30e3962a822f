//! Key Monitor Engine
//!
//! Per-session key subscriptions multiplexed onto store watches.

mod engine;
mod subscription;
mod types;

pub use engine::{KeyMonitorEngine, MonitorNotice, TransportLoss};
pub use subscription::{KeyEventReceiver, KeySubscription};
pub use types::{
    classify, ChangeKind, KeyChangeEvent, SubscriptionId, SubscriptionInfo, SubscriptionState,
};

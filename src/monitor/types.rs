//! Key monitor types and change classification

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::connection::KeyMonitorConfig;
use crate::session::SessionId;
use crate::store::{StoreEvent, StoreEventKind};

/// Identifier of one key subscription, unique across sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Subscription lifecycle
///
/// `Armed -> Active -> Closed` or `Armed -> Closed`. Closed is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SubscriptionState {
    /// Registered, store watch not yet confirmed
    Armed,
    /// Store watch confirmed, events flow
    Active,
    Closed,
}

/// Change class reported to listeners
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeKind {
    ValueChange,
    Create,
    Remove,
    LeaseChange,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyChangeEvent {
    pub session_id: SessionId,
    pub subscription_id: SubscriptionId,
    pub key: String,
    pub kind: ChangeKind,
    /// Value after the change (empty for removals)
    pub value: Vec<u8>,
    pub prev_value: Option<Vec<u8>>,
    /// Lease after the change (0 when none)
    pub lease: i64,
    pub prev_lease: Option<i64>,
    pub revision: i64,
}

/// Public view of a subscription
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionInfo {
    pub id: SubscriptionId,
    pub session_id: SessionId,
    pub config: KeyMonitorConfig,
    pub state: SubscriptionState,
}

/// Change classes a store event produces for `config`
///
/// Each class appears at most once. A delete of a leased key also counts
/// as a lease change since the lease is detached.
pub fn classify(config: &KeyMonitorConfig, event: &StoreEvent) -> Vec<ChangeKind> {
    let mut kinds = Vec::with_capacity(2);

    match event.kind {
        StoreEventKind::Delete => {
            if config.monitor_remove {
                kinds.push(ChangeKind::Remove);
            }
            let had_lease = event.prev.as_ref().is_some_and(|prev| prev.lease != 0);
            if config.monitor_lease_change && had_lease {
                kinds.push(ChangeKind::LeaseChange);
            }
        }
        StoreEventKind::Put => match &event.prev {
            None => {
                if config.monitor_create {
                    kinds.push(ChangeKind::Create);
                }
            }
            Some(prev) => {
                if config.monitor_value_change && prev.value != event.value {
                    kinds.push(ChangeKind::ValueChange);
                }
                if config.monitor_lease_change && prev.lease != event.lease {
                    kinds.push(ChangeKind::LeaseChange);
                }
            }
        },
    }

    kinds
}

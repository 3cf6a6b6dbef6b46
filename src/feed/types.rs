//! Types exposed by the change-feed listener.

use crate::types::{ChangeEntry, DocumentId, Namespace};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Connection lifecycle of a listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenerState {
    /// Never started, or shut down.
    Disconnected,
    /// Opening the change stream.
    Connecting,
    /// Reading and dispatching entries.
    Tailing,
    /// Waiting before the next connection attempt.
    Backoff,
}

/// Unique identifier for a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

/// Receives the change entries dispatched for a namespace.
///
/// Handlers run on the listener's worker thread, one entry at a time, in log
/// order. They must not block on the listener itself.
pub trait OperationHandler: Send + Sync {
    fn on_operation(&self, entry: &ChangeEntry);
}

impl<F> OperationHandler for F
where
    F: Fn(&ChangeEntry) + Send + Sync,
{
    fn on_operation(&self, entry: &ChangeEntry) {
        self(entry)
    }
}

/// Operational events published by a listener.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ListenerEvent {
    /// The first connection was established.
    Connected,
    /// A connection attempt failed; another follows after `retry_in`.
    ConnectFailed { error: String, retry_in: Duration },
    /// An established connection was lost.
    Disconnected { error: String },
    /// Connection re-established; existing subscriptions resume.
    Reconnected { subscriptions: usize },
    /// An entry could not be resolved and was not dispatched.
    EntryDropped {
        namespace: Namespace,
        id: DocumentId,
        reason: String,
    },
    /// An entry arrived later than the latency threshold.
    SlowEntry { namespace: Namespace, lag: Duration },
}

/// Counters and latency figures for a listener.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListenerDiagnostics {
    /// Entries read from the change stream.
    pub entries_received: u64,
    /// Entries delivered to at least one subscription.
    pub entries_dispatched: u64,
    /// Partial updates resolved through a point lookup.
    pub entries_resolved: u64,
    /// Entries dropped because resolution failed or found nothing.
    pub entries_dropped: u64,
    /// Successful connections after the first one.
    pub reconnects: u64,
    /// Log timestamp to receipt, for the last entry.
    pub last_receive_lag: Option<Duration>,
    /// Receipt to end of dispatch, for the last dispatched entry.
    pub last_dispatch_time: Option<Duration>,
    /// Periodic self-checks performed.
    pub ticks: u64,
}

//! Live-query observers.
//!
//! An observer keeps a caller's view of a query result in sync and reports
//! every delta through [`ObserveCallbacks`]. Two strategies exist:
//!
//! - [`ChangeFeedObserver`] reconciles each change-log entry against the
//!   filter and a membership cache of matching ids. Cheap per change, but
//!   it only knows the "after" state of a document. Cursor option changes
//!   reload the result and report the difference.
//! - [`PollingObserver`] re-runs the query when the collection signals a
//!   change (or on a timer) and diffs full snapshots, which also yields
//!   `before` values and moves.
//!
//! Both are stopped through the returned [`ObserveHandle`].

mod callbacks;
mod oplog;
mod poll;

pub use callbacks::{Notification, ObserveCallbacks};
pub use oplog::ChangeFeedObserver;
pub use poll::PollingObserver;

use crate::error::Result;
use crate::query::Query;
use crate::store::DocumentStore;
use crate::types::{Document, DocumentId, Namespace};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Lifecycle of an observer. There is no way back from `Stopped`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObserverStatus {
    /// Loading the initial snapshot.
    Initializing,
    /// Receiving changes.
    Active,
    Stopped,
}

/// A result row: the id of the stored document and its projected form.
pub(crate) type Row = (DocumentId, Document);

/// Why an observer thread woke up.
pub(crate) enum Wake {
    Refresh,
    Stop,
    PulsesClosed,
}

/// Run `query` and pair each result with its id. The query runs
/// unprojected so ids survive projections that drop `_id`.
pub(crate) fn fetch(store: &dyn DocumentStore, namespace: &Namespace, query: &Query) -> Result<Vec<Row>> {
    let mut raw = query.clone();
    raw.options.projection = None;

    let mut rows = Vec::new();
    for document in store.find(namespace, &raw)? {
        let Some(id) = DocumentId::of(&document) else {
            continue;
        };
        let projected = query.options.project(&document)?;
        rows.push((id, projected));
    }
    Ok(rows)
}

pub(crate) trait LiveObserver: Send + Sync {
    fn stop(&self);
    fn status(&self) -> ObserverStatus;
    fn membership(&self) -> Vec<DocumentId>;
}

/// Handle to a running observer. Dropping the handle stops the observer.
pub struct ObserveHandle {
    observer: Arc<dyn LiveObserver>,
}

impl ObserveHandle {
    pub(crate) fn new(observer: Arc<dyn LiveObserver>) -> Self {
        Self { observer }
    }

    /// Stop receiving changes. Idempotent; no callback fires once this
    /// returns.
    pub fn stop(&self) {
        self.observer.stop();
    }

    /// Same as [`stop`](Self::stop).
    pub fn dispose(&self) {
        self.stop();
    }

    pub fn status(&self) -> ObserverStatus {
        self.observer.status()
    }

    /// Ids currently believed to be in the result set, in cache order.
    /// Empty once stopped.
    pub fn membership(&self) -> Vec<DocumentId> {
        self.observer.membership()
    }
}

impl Drop for ObserveHandle {
    fn drop(&mut self) {
        self.observer.stop();
    }
}

impl std::fmt::Debug for ObserveHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserveHandle")
            .field("status", &self.status())
            .finish()
    }
}

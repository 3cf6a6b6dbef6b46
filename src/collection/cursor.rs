//! Cursors with live, shared query options.

use crate::collection::Collection;
use crate::config::ObserveMode;
use crate::error::Result;
use crate::observe::{ChangeFeedObserver, ObserveCallbacks, ObserveHandle, PollingObserver};
use crate::query::{validate_projection, Query, SortOrder};
use crate::types::Document;
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::Arc;

/// The result of [`Collection::find`].
///
/// Clones share the same query, so option changes made through one clone
/// (for example from inside an observer callback) are seen by all of them
/// and by observers created from the cursor. Every option change
/// pulses the collection so those observers refresh.
#[derive(Clone)]
pub struct Cursor {
    collection: Collection,
    query: Arc<RwLock<Query>>,
}

impl Cursor {
    pub(crate) fn new(collection: Collection, query: Query) -> Self {
        Self {
            collection,
            query: Arc::new(RwLock::new(query)),
        }
    }

    pub fn skip(&self, skip: usize) -> &Self {
        self.query.write().options.skip = skip;
        self.collection.notify_changed();
        self
    }

    pub fn limit(&self, limit: usize) -> &Self {
        self.query.write().options.limit = Some(limit);
        self.collection.notify_changed();
        self
    }

    /// Add a sort key, less significant than the ones already set.
    pub fn sort(&self, path: impl Into<String>, order: SortOrder) -> &Self {
        self.query.write().options.sort.push((path.into(), order));
        self.collection.notify_changed();
        self
    }

    pub fn project(&self, projection: Value) -> Result<&Self> {
        validate_projection(&projection)?;
        self.query.write().options.projection = Some(projection);
        self.collection.notify_changed();
        Ok(self)
    }

    /// Snapshot of the current query.
    pub fn query(&self) -> Query {
        self.query.read().clone()
    }

    /// Run the query with the current options.
    pub fn to_vec(&self) -> Result<Vec<Document>> {
        let query = self.query();
        self.collection.store.find(&self.collection.namespace, &query)
    }

    /// Number of results with skip and limit applied.
    pub fn count(&self) -> Result<usize> {
        self.to_vec().map(|docs| docs.len())
    }

    /// Observe the query result.
    ///
    /// Uses the change feed when the store has a listener and the observer
    /// mode is [`ObserveMode::Auto`], and a polling observer otherwise.
    /// Either way the observer follows this cursor's options as they
    /// change.
    pub fn observe(&self, callbacks: ObserveCallbacks) -> Result<ObserveHandle> {
        let collection = &self.collection;
        let config = &collection.observer_config;
        let pulses = collection.notifier.subscribe();
        match (&collection.listener, config.mode) {
            (Some(listener), ObserveMode::Auto) => ChangeFeedObserver::observe(
                Arc::clone(&collection.store),
                listener,
                Arc::clone(&collection.evaluator),
                collection.namespace.clone(),
                Arc::clone(&self.query),
                pulses,
                callbacks,
            ),
            _ => PollingObserver::observe(
                Arc::clone(&collection.store),
                collection.evaluator.as_ref(),
                collection.namespace.clone(),
                Arc::clone(&self.query),
                pulses,
                config.poll_interval,
                callbacks,
            ),
        }
    }
}

impl std::fmt::Debug for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("namespace", &self.collection.namespace)
            .field("query", &*self.query.read())
            .finish()
    }
}

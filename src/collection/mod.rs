//! Collection handles: store passthrough plus change pulses.

mod cursor;
mod notifier;

pub use cursor::Cursor;
pub use notifier::ChangeNotifier;

use crate::config::ObserverConfig;
use crate::error::Result;
use crate::feed::ChangeFeedListener;
use crate::query::{PredicateEvaluator, Query, QueryOptions};
use crate::store::DocumentStore;
use crate::types::{Document, DocumentId, Namespace};
use serde_json::Value;
use std::sync::Arc;
use tracing::trace;

/// A named collection of a [`LiveStore`](crate::LiveStore).
///
/// Reads and writes go straight to the store. Every successful write pulses
/// the namespace's [`ChangeNotifier`] so polling observers refresh.
#[derive(Clone)]
pub struct Collection {
    namespace: Namespace,
    store: Arc<dyn DocumentStore>,
    evaluator: Arc<dyn PredicateEvaluator>,
    listener: Option<Arc<ChangeFeedListener>>,
    notifier: Arc<ChangeNotifier>,
    observer_config: ObserverConfig,
}

impl Collection {
    pub(crate) fn new(
        namespace: Namespace,
        store: Arc<dyn DocumentStore>,
        evaluator: Arc<dyn PredicateEvaluator>,
        listener: Option<Arc<ChangeFeedListener>>,
        notifier: Arc<ChangeNotifier>,
        observer_config: ObserverConfig,
    ) -> Self {
        Self {
            namespace,
            store,
            evaluator,
            listener,
            notifier,
            observer_config,
        }
    }

    pub fn name(&self) -> &str {
        &self.namespace.collection
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn insert(&self, document: Document) -> Result<DocumentId> {
        let id = self.store.insert(&self.namespace, document)?;
        self.notify_changed();
        Ok(id)
    }

    /// Insert several documents, stopping at the first failure.
    pub fn insert_many(&self, documents: Vec<Document>) -> Result<Vec<DocumentId>> {
        let mut ids = Vec::with_capacity(documents.len());
        let mut outcome = Ok(());
        for document in documents {
            match self.store.insert(&self.namespace, document) {
                Ok(id) => ids.push(id),
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            }
        }
        if !ids.is_empty() {
            self.notify_changed();
        }
        outcome.map(|()| ids)
    }

    pub fn save(&self, document: Document) -> Result<DocumentId> {
        let id = self.store.save(&self.namespace, document)?;
        self.notify_changed();
        Ok(id)
    }

    /// Apply `mutation` (`$set`, `$unset`, `$inc`) to the document with
    /// `id`. Returns the updated document, or `None` if it does not exist
    /// and `upsert` is false.
    pub fn update(&self, id: &DocumentId, mutation: &Value, upsert: bool) -> Result<Option<Document>> {
        let updated = self.store.update(&self.namespace, id, mutation, upsert)?;
        if updated.is_some() {
            self.notify_changed();
        }
        Ok(updated)
    }

    pub fn remove(&self, filter: &Value) -> Result<usize> {
        let removed = self.store.remove(&self.namespace, filter)?;
        if removed > 0 {
            self.notify_changed();
        }
        Ok(removed)
    }

    pub fn count(&self, filter: &Value) -> Result<usize> {
        self.store.count(&self.namespace, filter)
    }

    pub fn find_one(&self, id: &DocumentId) -> Result<Option<Document>> {
        self.store.find_one(&self.namespace, id)
    }

    /// A cursor over documents matching `filter`.
    pub fn find(&self, filter: Value) -> Result<Cursor> {
        self.find_with_options(filter, QueryOptions::default())
    }

    pub fn find_with_options(&self, filter: Value, options: QueryOptions) -> Result<Cursor> {
        self.evaluator.validate(&filter)?;
        options.validate()?;
        Ok(Cursor::new(self.clone(), Query::new(filter).with_options(options)))
    }

    /// Signal that the collection changed, waking polling observers.
    pub fn notify_changed(&self) {
        trace!(namespace = %self.namespace, "collection changed");
        self.notifier.pulse();
    }
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("namespace", &self.namespace)
            .field("change_feed", &self.listener.is_some())
            .finish()
    }
}

//! Entry point tying a store, its change feed and collections together.

use crate::collection::{ChangeNotifier, Collection};
use crate::config::LiveStoreConfig;
use crate::error::Result;
use crate::feed::{ChangeFeedListener, ChangeLogSource};
use crate::query::{PredicateEvaluator, QueryMatcher};
use crate::store::DocumentStore;
use crate::types::Namespace;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// A document store with live queries.
///
/// Without a change feed every observer polls. With one, a single
/// [`ChangeFeedListener`] is shared by all change-feed observers of the
/// store.
pub struct LiveStore {
    config: LiveStoreConfig,
    store: Arc<dyn DocumentStore>,
    evaluator: Arc<dyn PredicateEvaluator>,
    listener: Option<Arc<ChangeFeedListener>>,
    notifiers: Mutex<HashMap<Namespace, Arc<ChangeNotifier>>>,
}

impl LiveStore {
    /// A live store whose observers poll.
    pub fn new(store: Arc<dyn DocumentStore>, config: LiveStoreConfig) -> Self {
        Self {
            config,
            store,
            evaluator: Arc::new(QueryMatcher),
            listener: None,
            notifiers: Mutex::new(HashMap::new()),
        }
    }

    /// A live store backed by a change feed.
    ///
    /// The listener is started right away. A failed first connection is not
    /// fatal: the listener keeps retrying in the background and observers
    /// pick up entries once it connects.
    pub fn with_change_feed(
        store: Arc<dyn DocumentStore>,
        source: Arc<dyn ChangeLogSource>,
        config: LiveStoreConfig,
    ) -> Result<Self> {
        let listener = ChangeFeedListener::new(source, Arc::clone(&store), config.listener.clone())?;
        match listener.start() {
            Ok(()) => info!(database = %config.database, "change feed connected"),
            Err(e) => warn!(
                database = %config.database,
                error = %e,
                "change feed not connected yet, retrying in background"
            ),
        }

        let mut live = Self::new(store, config);
        live.listener = Some(Arc::new(listener));
        Ok(live)
    }

    /// Use `evaluator` for filter validation and change-feed matching.
    ///
    /// The store applies its own evaluator to reads; the two should agree.
    pub fn with_evaluator(mut self, evaluator: Arc<dyn PredicateEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    /// Handle to the collection `name` in the configured database.
    pub fn collection(&self, name: &str) -> Collection {
        let namespace = Namespace::new(self.config.database.clone(), name);
        let notifier = Arc::clone(
            self.notifiers
                .lock()
                .entry(namespace.clone())
                .or_insert_with(|| Arc::new(ChangeNotifier::new())),
        );
        Collection::new(
            namespace,
            Arc::clone(&self.store),
            Arc::clone(&self.evaluator),
            self.listener.clone(),
            notifier,
            self.config.observer.clone(),
        )
    }

    pub fn listener(&self) -> Option<&Arc<ChangeFeedListener>> {
        self.listener.as_ref()
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn config(&self) -> &LiveStoreConfig {
        &self.config
    }
}

impl std::fmt::Debug for LiveStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveStore")
            .field("database", &self.config.database)
            .field("change_feed", &self.listener.is_some())
            .finish()
    }
}

//! Observer driven by the change feed.

use crate::error::Result;
use crate::feed::{ChangeFeedListener, OperationHandler, Subscription};
use crate::observe::callbacks::{Notification, ObserveCallbacks};
use crate::observe::{fetch, LiveObserver, ObserveHandle, ObserverStatus, Wake};
use crate::query::{PredicateEvaluator, Query, QueryOptions};
use crate::store::DocumentStore;
use crate::types::{ChangeEntry, Document, DocumentId, Namespace, OperationKind};
use crossbeam_channel::{bounded, select, Receiver, Sender};
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use serde_json::Value;
use std::sync::Arc;
use std::thread;
use tracing::{debug, trace, warn};

struct ObserverState {
    status: ObserverStatus,
    /// Ids of matching documents in delivery order. `None` once stopped.
    cache: Option<Vec<DocumentId>>,
    subscription: Option<Subscription>,
    /// Options the cache was last loaded with.
    loaded: QueryOptions,
}

/// Keeps a query result live by reconciling change-log entries against the
/// filter.
///
/// The observer only sees the document after each operation, so `changed`
/// notifications carry no `before` value and `moved` is never reported.
/// Indexes are positions in the membership cache: new members are appended
/// and removals shift later members down.
///
/// The query is shared with its cursor. When a pulse arrives and the
/// options differ from the ones last loaded, the result is reloaded and the
/// difference is reported as `removed` then `added`.
pub struct ChangeFeedObserver {
    namespace: Namespace,
    filter: Value,
    store: Arc<dyn DocumentStore>,
    query: Arc<RwLock<Query>>,
    evaluator: Arc<dyn PredicateEvaluator>,
    callbacks: ObserveCallbacks,
    /// Serializes callback delivery. Reentrant so callbacks may stop the
    /// observer.
    delivery: ReentrantMutex<()>,
    state: Mutex<ObserverState>,
    stop_tx: Sender<()>,
    stop_rx: Receiver<()>,
}

impl ChangeFeedObserver {
    /// Load the initial result of `query`, deliver it, then subscribe to
    /// `namespace` on `listener` and reconcile every entry that follows.
    ///
    /// `pulses` should be subscribed before this call so that option
    /// changes made from initial callbacks trigger a reload.
    pub fn observe(
        store: Arc<dyn DocumentStore>,
        listener: &ChangeFeedListener,
        evaluator: Arc<dyn PredicateEvaluator>,
        namespace: Namespace,
        query: Arc<RwLock<Query>>,
        pulses: Receiver<()>,
        callbacks: ObserveCallbacks,
    ) -> Result<ObserveHandle> {
        {
            let current = query.read();
            evaluator.validate(&current.filter)?;
            current.options.validate()?;
        }

        let observer = Arc::new(Self::new(namespace, store, query, evaluator, callbacks));
        observer.load_initial()?;

        let handler: Arc<dyn OperationHandler> = {
            let observer = Arc::clone(&observer);
            Arc::new(move |entry: &ChangeEntry| observer.on_operation(entry))
        };
        let subscription = listener.listen(observer.namespace.clone(), handler);

        {
            let mut state = observer.state.lock();
            if state.status == ObserverStatus::Stopped {
                // Stopped from inside an initial callback; `subscription`
                // is disposed on drop.
                debug!(namespace = %observer.namespace, "observer stopped during initial load");
                return Ok(ObserveHandle::new(observer.clone()));
            }
            state.status = ObserverStatus::Active;
            state.subscription = Some(subscription);
        }

        let worker = Arc::clone(&observer);
        thread::Builder::new()
            .name("livequery-reload".into())
            .spawn(move || worker.run(pulses))?;

        debug!(namespace = %observer.namespace, "change-feed observer active");
        Ok(ObserveHandle::new(observer))
    }

    fn new(
        namespace: Namespace,
        store: Arc<dyn DocumentStore>,
        query: Arc<RwLock<Query>>,
        evaluator: Arc<dyn PredicateEvaluator>,
        callbacks: ObserveCallbacks,
    ) -> Self {
        let (filter, loaded) = {
            let current = query.read();
            (current.filter.clone(), current.options.clone())
        };
        let (stop_tx, stop_rx) = bounded(1);
        Self {
            namespace,
            filter,
            store,
            query,
            evaluator,
            callbacks,
            delivery: ReentrantMutex::new(()),
            state: Mutex::new(ObserverState {
                status: ObserverStatus::Initializing,
                cache: Some(Vec::new()),
                subscription: None,
                loaded,
            }),
            stop_tx,
            stop_rx,
        }
    }

    /// Run the query with the current options, fill the cache and deliver
    /// the documents as the initial result.
    fn load_initial(&self) -> Result<()> {
        let _delivery = self.delivery.lock();
        let options = self.query.read().options.clone();
        let query = Query::new(self.filter.clone()).with_options(options.clone());
        let rows = fetch(self.store.as_ref(), &self.namespace, &query)?;

        let documents = {
            let mut state = self.state.lock();
            let Some(cache) = state.cache.as_mut() else {
                return Ok(());
            };
            let (ids, documents): (Vec<_>, Vec<_>) = rows.into_iter().unzip();
            *cache = ids;
            state.loaded = options;
            documents
        };
        self.callbacks.deliver_initial(documents);
        Ok(())
    }

    fn run(self: Arc<Self>, pulses: Receiver<()>) {
        let stop = self.stop_rx.clone();
        loop {
            let wake = select! {
                recv(stop) -> _ => Wake::Stop,
                recv(pulses) -> msg => match msg {
                    Ok(()) => Wake::Refresh,
                    Err(_) => Wake::PulsesClosed,
                },
            };
            match wake {
                Wake::Stop => break,
                Wake::PulsesClosed => {
                    // Notifier gone; entries still arrive through the listener.
                    debug!(namespace = %self.namespace, "pulses closed, options no longer followed");
                    break;
                }
                Wake::Refresh => {}
            }
            if self.status() == ObserverStatus::Stopped {
                break;
            }
            self.reload();
        }
        debug!(namespace = %self.namespace, "reload thread exiting");
    }

    /// Reload the result if the cursor options changed since the last load
    /// and deliver the difference.
    fn reload(&self) {
        let _delivery = self.delivery.lock();
        let options = self.query.read().options.clone();
        {
            let state = self.state.lock();
            if state.cache.is_none() || state.loaded == options {
                return;
            }
        }

        let query = Query::new(self.filter.clone()).with_options(options.clone());
        let rows = match fetch(self.store.as_ref(), &self.namespace, &query) {
            Ok(rows) => rows,
            Err(e) => {
                warn!(namespace = %self.namespace, error = %e, "reload after option change failed");
                return;
            }
        };

        let notifications = {
            let mut state = self.state.lock();
            let ObserverState { cache, loaded, .. } = &mut *state;
            let Some(cache) = cache.as_mut() else {
                return;
            };
            let mut notifications = Vec::new();

            let mut index = 0;
            while index < cache.len() {
                if rows.iter().any(|(id, _)| *id == cache[index]) {
                    index += 1;
                    continue;
                }
                let id = cache.remove(index);
                notifications.push(Notification::Removed {
                    document: self.removed_document(&id, &options),
                    index,
                });
            }
            for (id, document) in rows {
                if cache.contains(&id) {
                    continue;
                }
                cache.push(id);
                notifications.push(Notification::Added {
                    document,
                    index: cache.len() - 1,
                });
            }

            *loaded = options;
            notifications
        };

        trace!(
            namespace = %self.namespace,
            changes = notifications.len(),
            "reloaded after option change"
        );
        for notification in notifications {
            if self.status() == ObserverStatus::Stopped {
                break;
            }
            self.callbacks.notify(notification);
        }
    }

    /// Current form of a document leaving the result, or its bare id if it
    /// is gone from the store.
    fn removed_document(&self, id: &DocumentId, options: &QueryOptions) -> Document {
        match self.store.find_one(&self.namespace, id) {
            Ok(Some(document)) => self.present(&document, options),
            Ok(None) => serde_json::json!({ "_id": id.as_str() }),
            Err(e) => {
                warn!(namespace = %self.namespace, id = %id, error = %e, "failed to read removed document");
                serde_json::json!({ "_id": id.as_str() })
            }
        }
    }

    /// Reconcile one change-log entry and deliver the resulting
    /// notification, if any.
    fn on_operation(&self, entry: &ChangeEntry) {
        let _delivery = self.delivery.lock();
        let notification = {
            let mut state = self.state.lock();
            let ObserverState { cache, loaded, .. } = &mut *state;
            let Some(cache) = cache.as_mut() else {
                debug!(
                    namespace = %self.namespace,
                    id = %entry.document_id,
                    "entry for stopped observer ignored"
                );
                return;
            };
            self.reconcile(cache, loaded, entry)
        };

        if let Some(notification) = notification {
            self.callbacks.notify(notification);
        }
    }

    fn reconcile(
        &self,
        cache: &mut Vec<DocumentId>,
        options: &QueryOptions,
        entry: &ChangeEntry,
    ) -> Option<Notification> {
        let id = &entry.document_id;
        let position = cache.iter().position(|cached| cached == id);

        match entry.operation {
            OperationKind::NoOp => None,
            OperationKind::Insert => {
                // Already reported by the initial load.
                if position.is_some() {
                    return None;
                }
                let document = entry.document.as_ref()?;
                if !self.matches(document) {
                    return None;
                }
                cache.push(id.clone());
                Some(Notification::Added {
                    document: self.present(document, options),
                    index: cache.len() - 1,
                })
            }
            OperationKind::Update => {
                let Some(document) = entry.document.as_ref() else {
                    warn!(
                        namespace = %self.namespace,
                        id = %id,
                        "unresolved update reached observer"
                    );
                    return None;
                };
                match (self.matches(document), position) {
                    (true, Some(index)) => Some(Notification::Changed {
                        before: None,
                        after: self.present(document, options),
                        index,
                    }),
                    (true, None) => {
                        cache.push(id.clone());
                        Some(Notification::Added {
                            document: self.present(document, options),
                            index: cache.len() - 1,
                        })
                    }
                    (false, Some(index)) => {
                        cache.remove(index);
                        Some(Notification::Removed {
                            document: self.present(document, options),
                            index,
                        })
                    }
                    (false, None) => None,
                }
            }
            OperationKind::Delete => {
                let index = position?;
                cache.remove(index);
                let document = entry
                    .document
                    .clone()
                    .unwrap_or_else(|| serde_json::json!({ "_id": id.as_str() }));
                Some(Notification::Removed {
                    document: self.present(&document, options),
                    index,
                })
            }
        }
    }

    fn matches(&self, document: &Document) -> bool {
        self.evaluator
            .matches(&self.filter, document)
            .unwrap_or_else(|e| {
                warn!(namespace = %self.namespace, error = %e, "filter evaluation failed");
                false
            })
    }

    fn present(&self, document: &Document, options: &QueryOptions) -> Document {
        options.project(document).unwrap_or_else(|e| {
            warn!(namespace = %self.namespace, error = %e, "projection failed");
            document.clone()
        })
    }
}

impl LiveObserver for ChangeFeedObserver {
    fn stop(&self) {
        let _delivery = self.delivery.lock();
        let subscription = {
            let mut state = self.state.lock();
            if state.status == ObserverStatus::Stopped {
                return;
            }
            state.status = ObserverStatus::Stopped;
            state.cache = None;
            state.subscription.take()
        };
        if let Some(subscription) = subscription {
            subscription.dispose();
        }
        let _ = self.stop_tx.try_send(());
        debug!(namespace = %self.namespace, "change-feed observer stopped");
    }

    fn status(&self) -> ObserverStatus {
        self.state.lock().status
    }

    fn membership(&self) -> Vec<DocumentId> {
        self.state.lock().cache.clone().unwrap_or_default()
    }
}

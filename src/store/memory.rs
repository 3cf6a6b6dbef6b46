//! In-process document store with a tailable change log.

use crate::error::{LiveError, Result};
use crate::feed::{ChangeLogSource, ChangeStream};
use crate::query::{PredicateEvaluator, Query, QueryMatcher};
use crate::store::mutation::{apply_mutation, validate_mutation};
use crate::store::DocumentStore;
use crate::types::{ChangeEntry, Document, DocumentId, Namespace, ID_FIELD};
use crossbeam_channel::{unbounded, Sender};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

struct Inner {
    /// Documents per namespace, in insertion order.
    collections: HashMap<Namespace, Vec<Document>>,
    /// Open tails on the change log.
    tailers: Vec<Sender<Result<ChangeEntry>>>,
    /// Number of upcoming `tail` calls that fail.
    failing_tails: usize,
    /// Total entries appended to the log.
    log_len: u64,
}

impl Inner {
    fn documents(&self, namespace: &Namespace) -> &[Document] {
        self.collections
            .get(namespace)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn position(&self, namespace: &Namespace, id: &DocumentId) -> Option<usize> {
        self.documents(namespace)
            .iter()
            .position(|doc| DocumentId::of(doc).as_ref() == Some(id))
    }

    /// Append to the change log. Called with the store lock held so that
    /// log order equals mutation order.
    fn emit(&mut self, entry: ChangeEntry) {
        self.log_len += 1;
        self.tailers.retain(|tx| tx.send(Ok(entry.clone())).is_ok());
    }
}

/// A document store kept in memory.
///
/// Every mutation is appended to a change log that any number of tails can
/// follow. Field-level updates are logged as partial entries carrying only
/// the mutation, the way a replication log records them.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    evaluator: Arc<dyn PredicateEvaluator>,
}

impl MemoryStore {
    /// Create an empty store using the built-in [`QueryMatcher`].
    pub fn new() -> Self {
        Self::with_evaluator(Arc::new(QueryMatcher))
    }

    /// Create an empty store using a custom predicate evaluator.
    pub fn with_evaluator(evaluator: Arc<dyn PredicateEvaluator>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                collections: HashMap::new(),
                tailers: Vec::new(),
                failing_tails: 0,
                log_len: 0,
            }),
            evaluator,
        }
    }

    /// Append a no-op (heartbeat) entry for `namespace`.
    pub fn heartbeat(&self, namespace: &Namespace) {
        self.inner.lock().emit(ChangeEntry::no_op(namespace.clone()));
    }

    /// Break every open tail, as if the connection to the log dropped.
    pub fn interrupt_feed(&self) {
        let mut inner = self.inner.lock();
        let tailers = std::mem::take(&mut inner.tailers);
        debug!(tails = tailers.len(), "interrupting change log tails");
        for tx in tailers {
            let _ = tx.send(Err(LiveError::Connection("change log interrupted".into())));
        }
    }

    /// Make the next `n` calls to `tail` fail.
    pub fn fail_next_tails(&self, n: usize) {
        self.inner.lock().failing_tails = n;
    }

    /// Number of open tails.
    pub fn tail_count(&self) -> usize {
        self.inner.lock().tailers.len()
    }

    /// Number of entries appended to the change log so far.
    pub fn log_len(&self) -> u64 {
        self.inner.lock().log_len
    }

    fn require_id(document: &Document) -> Result<DocumentId> {
        if !document.is_object() {
            return Err(LiveError::InvalidDocument(format!(
                "document must be an object, got {document}"
            )));
        }
        DocumentId::of(document).ok_or_else(|| {
            LiveError::InvalidDocument("`_id` must be a string, number or boolean".into())
        })
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentStore for MemoryStore {
    fn find(&self, namespace: &Namespace, query: &Query) -> Result<Vec<Document>> {
        let inner = self.inner.lock();
        query.execute(self.evaluator.as_ref(), inner.documents(namespace))
    }

    fn find_one(&self, namespace: &Namespace, id: &DocumentId) -> Result<Option<Document>> {
        let inner = self.inner.lock();
        Ok(inner
            .position(namespace, id)
            .map(|pos| inner.documents(namespace)[pos].clone()))
    }

    fn count(&self, namespace: &Namespace, filter: &Value) -> Result<usize> {
        let inner = self.inner.lock();
        Ok(self.evaluator.matching(filter, inner.documents(namespace))?.len())
    }

    fn insert(&self, namespace: &Namespace, mut document: Document) -> Result<DocumentId> {
        if let Value::Object(map) = &mut document {
            map.entry(ID_FIELD.to_string())
                .or_insert_with(|| Value::String(uuid::Uuid::new_v4().to_string()));
        }
        let id = Self::require_id(&document)?;

        let mut inner = self.inner.lock();
        if inner.position(namespace, &id).is_some() {
            return Err(LiveError::DuplicateId {
                namespace: namespace.clone(),
                id,
            });
        }
        inner
            .collections
            .entry(namespace.clone())
            .or_default()
            .push(document.clone());
        inner.emit(ChangeEntry::insert(namespace.clone(), id.clone(), document));
        Ok(id)
    }

    fn save(&self, namespace: &Namespace, document: Document) -> Result<DocumentId> {
        let id = Self::require_id(&document)?;

        let mut inner = self.inner.lock();
        match inner.position(namespace, &id) {
            Some(pos) => {
                if let Some(docs) = inner.collections.get_mut(namespace) {
                    docs[pos] = document.clone();
                }
                inner.emit(ChangeEntry::replace(namespace.clone(), id.clone(), document));
            }
            None => {
                inner
                    .collections
                    .entry(namespace.clone())
                    .or_default()
                    .push(document.clone());
                inner.emit(ChangeEntry::insert(namespace.clone(), id.clone(), document));
            }
        }
        Ok(id)
    }

    fn update(
        &self,
        namespace: &Namespace,
        id: &DocumentId,
        mutation: &Value,
        upsert: bool,
    ) -> Result<Option<Document>> {
        validate_mutation(mutation)?;

        let mut inner = self.inner.lock();
        match inner.position(namespace, id) {
            Some(pos) => {
                let docs = inner.collections.entry(namespace.clone()).or_default();
                let mut updated = docs[pos].clone();
                apply_mutation(&mut updated, mutation)?;
                docs[pos] = updated.clone();
                inner.emit(ChangeEntry::partial_update(
                    namespace.clone(),
                    id.clone(),
                    mutation.clone(),
                ));
                Ok(Some(updated))
            }
            None if upsert => {
                let mut created = serde_json::json!({ ID_FIELD: id.as_str() });
                apply_mutation(&mut created, mutation)?;
                inner
                    .collections
                    .entry(namespace.clone())
                    .or_default()
                    .push(created.clone());
                inner.emit(ChangeEntry::insert(namespace.clone(), id.clone(), created.clone()));
                Ok(Some(created))
            }
            None => Ok(None),
        }
    }

    fn remove(&self, namespace: &Namespace, filter: &Value) -> Result<usize> {
        self.evaluator.validate(filter)?;

        let mut inner = self.inner.lock();
        let Some(docs) = inner.collections.get_mut(namespace) else {
            return Ok(0);
        };

        let mut hits = Vec::with_capacity(docs.len());
        for doc in docs.iter() {
            hits.push(self.evaluator.matches(filter, doc)?);
        }

        let mut removed = Vec::new();
        let mut kept = Vec::with_capacity(docs.len());
        for (doc, hit) in docs.drain(..).zip(hits) {
            if hit {
                removed.extend(DocumentId::of(&doc));
            } else {
                kept.push(doc);
            }
        }
        *docs = kept;

        let count = removed.len();
        for id in removed {
            inner.emit(ChangeEntry::delete(namespace.clone(), id));
        }
        Ok(count)
    }
}

impl ChangeLogSource for MemoryStore {
    fn tail(&self) -> Result<ChangeStream> {
        let mut inner = self.inner.lock();
        if inner.failing_tails > 0 {
            inner.failing_tails -= 1;
            return Err(LiveError::Connection("change log unavailable".into()));
        }
        let (tx, rx) = unbounded();
        inner.tailers.push(tx);
        Ok(rx)
    }
}

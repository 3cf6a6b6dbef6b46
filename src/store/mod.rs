//! Document store capability consumed by collections, observers and the
//! change-feed listener.

mod memory;
mod mutation;

pub use memory::MemoryStore;
pub use mutation::{apply_mutation, validate_mutation};

use crate::error::Result;
use crate::query::Query;
use crate::types::{Document, DocumentId, Namespace};
use serde_json::Value;

/// A document store addressed by namespace.
///
/// Reads serve initial snapshots, polling and partial-update resolution;
/// writes are forwarded by [`Collection`](crate::Collection).
pub trait DocumentStore: Send + Sync {
    /// Documents matching `query`, with its options applied.
    fn find(&self, namespace: &Namespace, query: &Query) -> Result<Vec<Document>>;

    /// Point lookup by id.
    fn find_one(&self, namespace: &Namespace, id: &DocumentId) -> Result<Option<Document>>;

    /// Number of documents matching `filter`.
    fn count(&self, namespace: &Namespace, filter: &Value) -> Result<usize>;

    /// Insert a new document, returning its id.
    fn insert(&self, namespace: &Namespace, document: Document) -> Result<DocumentId>;

    /// Replace the document with the same id, inserting it if absent.
    fn save(&self, namespace: &Namespace, document: Document) -> Result<DocumentId>;

    /// Apply a field-level mutation. Returns the resulting document, or
    /// `None` when the id does not exist and `upsert` is false.
    fn update(
        &self,
        namespace: &Namespace,
        id: &DocumentId,
        mutation: &Value,
        upsert: bool,
    ) -> Result<Option<Document>>;

    /// Remove every document matching `filter`, returning how many were removed.
    fn remove(&self, namespace: &Namespace, filter: &Value) -> Result<usize>;
}

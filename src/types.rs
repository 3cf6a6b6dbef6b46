//! Core types shared by the listener, the observers and the store.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::LiveError;

/// A stored document. Always a JSON object carrying an `_id` field.
pub type Document = Value;

/// Name of the identity field every document carries.
pub const ID_FIELD: &str = "_id";

/// Identity of a document within a namespace.
///
/// String ids are kept verbatim. Numbers are keyed by value, so `1`, `1.0`
/// and `"1"` are all the same id; booleans use their JSON rendering.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentId(pub String);

impl DocumentId {
    pub fn new(id: impl Into<String>) -> Self {
        DocumentId(id.into())
    }

    /// Id from an `_id` value. Objects, arrays and null are not valid ids.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(DocumentId(s.clone())),
            Value::Number(n) => Some(DocumentId(canonical_number(n))),
            Value::Bool(b) => Some(DocumentId(b.to_string())),
            _ => None,
        }
    }

    /// Id of a document, read from its `_id` field.
    pub fn of(document: &Document) -> Option<Self> {
        document.get(ID_FIELD).and_then(Self::from_value)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn canonical_number(n: &serde_json::Number) -> String {
    if let Some(i) = n.as_i64() {
        i.to_string()
    } else if let Some(u) = n.as_u64() {
        u.to_string()
    } else {
        // f64 Display drops the fractional part of integral values.
        n.as_f64().map_or_else(|| n.to_string(), |f| f.to_string())
    }
}

impl fmt::Debug for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DocumentId({})", self.0)
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(s: &str) -> Self {
        DocumentId(s.to_string())
    }
}

impl From<String> for DocumentId {
    fn from(s: String) -> Self {
        DocumentId(s)
    }
}

/// Logical address of a collection: database plus collection name.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Namespace {
    pub database: String,
    pub collection: String,
}

impl Namespace {
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
        }
    }
}

impl fmt::Debug for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Namespace({}.{})", self.database, self.collection)
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.collection)
    }
}

impl FromStr for Namespace {
    type Err = LiveError;

    /// Parses `database.collection`. The collection part may itself contain dots.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((db, coll)) if !db.is_empty() && !coll.is_empty() => Ok(Namespace::new(db, coll)),
            _ => Err(LiveError::InvalidDocument(format!(
                "namespace must look like `database.collection`, got `{s}`"
            ))),
        }
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_micros() as i64)
    }

    /// Time elapsed from `self` until `later`, zero if `later` is earlier.
    pub fn elapsed_until(self, later: Timestamp) -> Duration {
        Duration::from_micros(later.0.saturating_sub(self.0).max(0) as u64)
    }

    pub fn saturating_sub(self, duration: Duration) -> Self {
        Timestamp(self.0.saturating_sub(duration.as_micros() as i64))
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Kind of mutation a change-log entry describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
    /// Heartbeats and metadata-only entries.
    NoOp,
}

/// A single entry of the change log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeEntry {
    pub operation: OperationKind,
    pub namespace: Namespace,
    pub document_id: DocumentId,
    /// Full document after the operation. For deletes this is `{_id}` only.
    pub document: Option<Document>,
    /// Field-level mutation descriptor of a partial update.
    pub mutation: Option<Document>,
    /// When the operation was applied at the source.
    pub timestamp: Timestamp,
}

impl ChangeEntry {
    pub fn insert(namespace: Namespace, document_id: DocumentId, document: Document) -> Self {
        Self::full(OperationKind::Insert, namespace, document_id, document)
    }

    /// A replace-style update carrying the whole resulting document.
    pub fn replace(namespace: Namespace, document_id: DocumentId, document: Document) -> Self {
        Self::full(OperationKind::Update, namespace, document_id, document)
    }

    /// A field-level update that must be resolved before matching.
    pub fn partial_update(namespace: Namespace, document_id: DocumentId, mutation: Document) -> Self {
        Self {
            operation: OperationKind::Update,
            namespace,
            document_id,
            document: None,
            mutation: Some(mutation),
            timestamp: Timestamp::now(),
        }
    }

    pub fn delete(namespace: Namespace, document_id: DocumentId) -> Self {
        let document = serde_json::json!({ ID_FIELD: document_id.as_str() });
        Self::full(OperationKind::Delete, namespace, document_id, document)
    }

    pub fn no_op(namespace: Namespace) -> Self {
        Self {
            operation: OperationKind::NoOp,
            namespace,
            document_id: DocumentId::default(),
            document: None,
            mutation: None,
            timestamp: Timestamp::now(),
        }
    }

    fn full(
        operation: OperationKind,
        namespace: Namespace,
        document_id: DocumentId,
        document: Document,
    ) -> Self {
        Self {
            operation,
            namespace,
            document_id,
            document: Some(document),
            mutation: None,
            timestamp: Timestamp::now(),
        }
    }

    /// Override the source timestamp.
    pub fn at(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// True for update entries that lack the resulting document.
    pub fn is_partial(&self) -> bool {
        self.operation == OperationKind::Update && self.document.is_none()
    }

    /// This entry with the resolved full document in place.
    pub fn resolved(mut self, document: Document) -> Self {
        self.document = Some(document);
        self
    }
}

impl Default for DocumentId {
    fn default() -> Self {
        DocumentId(String::new())
    }
}

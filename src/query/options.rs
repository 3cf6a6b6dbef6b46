//! Query options: pagination, ordering and projection.

use crate::error::{LiveError, Result};
use crate::query::matcher::{compare_values, lookup, PredicateEvaluator};
use crate::query::projection::{project, validate_projection};
use crate::types::Document;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;

/// Sort direction for one key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// Options applied on top of a filter.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryOptions {
    pub skip: usize,
    /// Maximum number of results. `Some(0)` means no limit.
    pub limit: Option<usize>,
    /// Sort keys (dotted paths), most significant first.
    pub sort: Vec<(String, SortOrder)>,
    pub projection: Option<Value>,
}

impl QueryOptions {
    pub fn with_skip(mut self, skip: usize) -> Self {
        self.skip = skip;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_sort(mut self, path: impl Into<String>, order: SortOrder) -> Self {
        self.sort.push((path.into(), order));
        self
    }

    pub fn with_projection(mut self, projection: Value) -> Self {
        self.projection = Some(projection);
        self
    }

    /// Parse a `{path: 1 | -1}` sort specification.
    pub fn sort_from_value(spec: &Value) -> Result<Vec<(String, SortOrder)>> {
        let Value::Object(keys) = spec else {
            return Err(LiveError::InvalidFilter(format!("sort must be an object, got {spec}")));
        };
        keys.iter()
            .map(|(path, dir)| match dir.as_i64() {
                Some(1) => Ok((path.clone(), SortOrder::Ascending)),
                Some(-1) => Ok((path.clone(), SortOrder::Descending)),
                _ => Err(LiveError::InvalidFilter(format!(
                    "sort direction for `{path}` must be 1 or -1"
                ))),
            })
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        match &self.projection {
            Some(spec) => validate_projection(spec),
            None => Ok(()),
        }
    }

    /// Project one document if a projection is configured.
    pub fn project(&self, document: &Document) -> Result<Document> {
        match &self.projection {
            Some(spec) => project(document, spec),
            None => Ok(document.clone()),
        }
    }

    fn compare(&self, a: &Document, b: &Document) -> Ordering {
        for (path, order) in &self.sort {
            let null = Value::Null;
            let left = lookup(a, path).unwrap_or(&null);
            let right = lookup(b, path).unwrap_or(&null);
            let ord = match order {
                SortOrder::Ascending => compare_values(left, right),
                SortOrder::Descending => compare_values(right, left),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }
}

/// A filter together with its options.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub filter: Value,
    pub options: QueryOptions,
}

impl Query {
    pub fn new(filter: Value) -> Self {
        Self {
            filter,
            options: QueryOptions::default(),
        }
    }

    /// Match everything.
    pub fn all() -> Self {
        Self::new(Value::Object(Map::new()))
    }

    pub fn with_options(mut self, options: QueryOptions) -> Self {
        self.options = options;
        self
    }

    /// Evaluate this query over `documents` (in natural order): filter,
    /// stable sort, skip, limit and project.
    pub fn execute<'a, I>(&self, evaluator: &dyn PredicateEvaluator, documents: I) -> Result<Vec<Document>>
    where
        I: IntoIterator<Item = &'a Document>,
    {
        evaluator.validate(&self.filter)?;
        self.options.validate()?;

        let mut matched = Vec::new();
        for doc in documents {
            if evaluator.matches(&self.filter, doc)? {
                matched.push(doc);
            }
        }
        if !self.options.sort.is_empty() {
            matched.sort_by(|a, b| self.options.compare(a, b));
        }

        // A zero limit means no limit.
        let limit = self.options.limit.filter(|l| *l > 0).unwrap_or(usize::MAX);
        matched
            .into_iter()
            .skip(self.options.skip)
            .take(limit)
            .map(|doc| self.options.project(doc))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::QueryMatcher;
    use serde_json::json;

    fn docs() -> Vec<Document> {
        vec![
            json!({"_id": "a", "age": 30, "name": "x"}),
            json!({"_id": "b", "age": 10, "name": "y"}),
            json!({"_id": "c", "age": 20, "name": "z"}),
        ]
    }

    #[test]
    fn test_execute_sort_skip_limit() {
        let docs = docs();
        let query = Query::all().with_options(
            QueryOptions::default()
                .with_sort("age", SortOrder::Ascending)
                .with_skip(1)
                .with_limit(1),
        );
        let out = query.execute(&QueryMatcher, &docs).unwrap();
        assert_eq!(out, vec![json!({"_id": "c", "age": 20, "name": "z"})]);
    }

    #[test]
    fn test_execute_natural_order_and_projection() {
        let docs = docs();
        let query = Query::new(json!({"age": {"$gte": 20}}))
            .with_options(QueryOptions::default().with_projection(json!({"name": 0})));
        let out = query.execute(&QueryMatcher, &docs).unwrap();
        assert_eq!(out, vec![json!({"_id": "a", "age": 30}), json!({"_id": "c", "age": 20})]);
    }

    #[test]
    fn test_zero_limit_is_unlimited() {
        let docs = docs();
        let query = Query::all().with_options(QueryOptions::default().with_limit(0).with_skip(1));
        let out = query.execute(&QueryMatcher, &docs).unwrap();
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_skip_past_end() {
        let docs = docs();
        let query = Query::all().with_options(QueryOptions::default().with_skip(3).with_limit(1));
        assert!(query.execute(&QueryMatcher, &docs).unwrap().is_empty());
    }

    #[test]
    fn test_sort_from_value() {
        let sort = QueryOptions::sort_from_value(&json!({"age": -1})).unwrap();
        assert_eq!(sort, vec![("age".to_string(), SortOrder::Descending)]);
        assert!(QueryOptions::sort_from_value(&json!({"age": 2})).is_err());
    }

    #[test]
    fn test_execute_rejects_bad_input() {
        let docs = docs();
        assert!(Query::new(json!(5)).execute(&QueryMatcher, &docs).is_err());
        let bad_projection = Query::all().with_options(QueryOptions::default().with_projection(json!(1)));
        assert!(bad_projection.execute(&QueryMatcher, &docs).is_err());
    }
}

//! Query evaluation: filters, options and projection.

mod matcher;
mod options;
mod projection;

pub use matcher::{compare_values, lookup, PredicateEvaluator, QueryMatcher};
pub use options::{Query, QueryOptions, SortOrder};
pub use projection::{project, validate_projection};

//! # medrepo-search
//!
//! Write-time search indexing and search query evaluation.
//!
//! - [`catalog`]: static extraction rules keyed by resource type
//! - [`extract`]: typed value extraction from resource JSON
//! - [`indexer`]: `SearchIndexer`, turning a resource version into index rows
//! - [`query`]: `SearchQuery` parsing and in-memory evaluation

pub mod catalog;
pub mod error;
pub mod extract;
pub mod indexer;
pub mod query;
pub mod types;

pub use error::SearchError;
pub use indexer::SearchIndexer;
pub use query::{ParamFilter, Predicate, Prefix, SearchQuery, StringMatch, TokenSystem};
pub use types::{ExtractionRule, IndexValue, SearchIndexRow, ValueKind};

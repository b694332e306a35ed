//! Write-time search indexer.

use serde_json::Value;

use crate::catalog;
use crate::extract;
use crate::types::SearchIndexRow;

/// Derives index rows from resource content.
///
/// Indexing is a pure function of the content and the static extraction
/// catalog; callers replace all prior rows of the lineage with the result.
#[derive(Debug, Clone, Copy, Default)]
pub struct SearchIndexer;

impl SearchIndexer {
    pub fn new() -> Self {
        Self
    }

    /// Produces the index rows for one resource version.
    ///
    /// Unindexed and unknown types yield no rows. A repeating element yields
    /// one row per occurrence, in document order, grouped by rule order.
    pub fn index(
        &self,
        resource_type: &str,
        resource_id: &str,
        version_id: u64,
        content: &Value,
    ) -> Vec<SearchIndexRow> {
        let Some(rules) = catalog::rules_for(resource_type) else {
            tracing::trace!(resource_type, "no extraction rules; not indexed");
            return Vec::new();
        };

        let mut rows = Vec::new();
        for rule in rules {
            for value in extract::extract(content, rule.path, rule.kind) {
                rows.push(SearchIndexRow {
                    resource_type: resource_type.to_string(),
                    resource_id: resource_id.to_string(),
                    version_id,
                    param: rule.param.to_string(),
                    value,
                });
            }
        }
        rows
    }
}

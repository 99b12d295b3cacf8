//! Query options understood by every object store.

use mongodb::bson::{Document, doc};
use serde::{Deserialize, Serialize};

/// Sort direction for a single field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Ascending,
    Descending,
}

impl SortDirection {
    fn as_i32(self) -> i32 {
        match self {
            Self::Ascending => 1,
            Self::Descending => -1,
        }
    }
}

/// One sort key. Sort keys are ordered, so they live in a list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    pub field: String,
    pub direction: SortDirection,
}

/// Sort, skip and limit for a query.
///
/// Projections are deliberately absent: the object cache stores whole
/// documents and shares them between queries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryOptions {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sort: Vec<SortKey>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
}

impl QueryOptions {
    /// Append an ascending sort key.
    #[must_use]
    pub fn sort_asc(mut self, field: impl Into<String>) -> Self {
        self.sort.push(SortKey {
            field: field.into(),
            direction: SortDirection::Ascending,
        });
        self
    }

    /// Append a descending sort key.
    #[must_use]
    pub fn sort_desc(mut self, field: impl Into<String>) -> Self {
        self.sort.push(SortKey {
            field: field.into(),
            direction: SortDirection::Descending,
        });
        self
    }

    #[must_use]
    pub fn skip(mut self, skip: u64) -> Self {
        self.skip = Some(skip);
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Sort keys as a MongoDB sort document, in order.
    pub fn sort_document(&self) -> Option<Document> {
        if self.sort.is_empty() {
            return None;
        }
        let mut sort = doc! {};
        for key in &self.sort {
            sort.insert(key.field.clone(), key.direction.as_i32());
        }
        Some(sort)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sort_document_keeps_order() {
        let options = QueryOptions::default().sort_desc("created_at").sort_asc("name");
        let sort = options.sort_document().unwrap();
        let keys: Vec<_> = sort.keys().cloned().collect();
        assert_eq!(keys, vec!["created_at", "name"]);
        assert_eq!(sort.get_i32("created_at").unwrap(), -1);
    }

    #[test]
    fn test_empty_options_serialize_compactly() {
        let json = serde_json::to_string(&QueryOptions::default()).unwrap();
        assert_eq!(json, "{}");
        assert!(QueryOptions::default().sort_document().is_none());
    }
}

//! Change events produced by an object store's change feed.

use std::fmt;

use futures::stream::BoxStream;
use mongodb::bson::Document;
use serde::{Deserialize, Serialize};

use super::DocumentId;
use crate::error::ObjectStoreError;

/// Kind of write that produced a change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Insert,
    Update,
    Replace,
    Delete,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::Delete => "delete",
        };
        f.write_str(name)
    }
}

/// Opaque, per-collection increasing position in a change feed.
///
/// Used both to resume a feed and to derive idempotency keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SequenceToken(String);

impl SequenceToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A single write observed on a collection.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub token: SequenceToken,
    pub operation: OperationKind,
    pub collection: String,
    pub document_id: DocumentId,
    /// Full post-image for insert/update/replace, absent for delete.
    pub document: Option<Document>,
}

/// Ordered stream of change events for one collection.
pub type ChangeFeed = BoxStream<'static, Result<ChangeEvent, ObjectStoreError>>;

/// A change feed together with the position it was opened at.
pub struct OpenFeed {
    pub events: ChangeFeed,
    /// Resume point that covers everything before the first delivered event.
    /// Resuming from it after a failure loses nothing written in between.
    pub start: Option<SequenceToken>,
}

impl fmt::Debug for OpenFeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenFeed").field("start", &self.start).finish()
    }
}

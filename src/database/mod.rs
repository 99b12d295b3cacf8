//! Object store: the document database that is the source of truth.
//!
//! - `MongoObjectStore` - MongoDB driver backed store with change streams
//! - `MemoryObjectStore` - In-process store with a replayable change log

mod change;
mod id;
mod memory;
mod mongo;
mod options;

use async_trait::async_trait;
use mongodb::bson::Document;

pub use change::{ChangeEvent, ChangeFeed, OpenFeed, OperationKind, SequenceToken};
pub use id::DocumentId;
pub use memory::{MemoryObjectStore, ReadCounters};
pub use mongo::{Database, MongoObjectStore};
pub use options::{QueryOptions, SortDirection, SortKey};

use crate::error::ObjectStoreError;

/// Query and change-feed contract of the document database.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// All documents matching `filter`.
    async fn find(
        &self,
        collection: &str,
        filter: Document,
        options: &QueryOptions,
    ) -> Result<Vec<Document>, ObjectStoreError>;

    /// First document matching `filter`, or `None`.
    async fn find_one(
        &self,
        collection: &str,
        filter: Document,
        options: &QueryOptions,
    ) -> Result<Option<Document>, ObjectStoreError>;

    /// Documents with the given ids. Ids that no longer exist are skipped.
    async fn find_by_ids(
        &self,
        collection: &str,
        ids: &[DocumentId],
    ) -> Result<Vec<Document>, ObjectStoreError>;

    /// Number of documents matching `filter`.
    async fn count(
        &self,
        collection: &str,
        filter: Document,
        options: &QueryOptions,
    ) -> Result<u64, ObjectStoreError>;

    /// Open the change feed of a collection.
    ///
    /// With `resume_after`, delivery restarts right after that token;
    /// otherwise only writes from now on are delivered. Non-delete events
    /// carry the full current document. The returned `start` token lets a
    /// caller resume even if the feed fails before its first event.
    async fn watch(
        &self,
        collection: &str,
        resume_after: Option<SequenceToken>,
    ) -> Result<OpenFeed, ObjectStoreError>;
}

//! In-process object store.
//!
//! Supports equality filters, `_id: {$in: [...]}`, sort/skip/limit and a
//! change feed backed by a replayable log. Every read is counted, so callers
//! can tell whether a request reached the store at all. Used by the tests
//! and for running the cache without a database.

use std::cmp::Ordering;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use mongodb::bson::{Bson, Document, oid::ObjectId};
use parking_lot::Mutex;
use tokio::sync::broadcast;

use super::{ChangeEvent, DocumentId, ObjectStore, OpenFeed, OperationKind, QueryOptions, SequenceToken, SortDirection};
use crate::error::ObjectStoreError;

const FEED_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
enum FeedMessage {
    Event(ChangeEvent),
    Interrupt,
}

/// Per-collection state, guarded by one mutex so writes, log appends and
/// feed subscription are totally ordered.
struct CollectionState {
    documents: Vec<Document>,
    log: Vec<(u64, ChangeEvent)>,
    /// Sequence numbers at or below this are no longer in the log.
    floor: u64,
    feed: broadcast::Sender<FeedMessage>,
}

impl CollectionState {
    fn new() -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            documents: Vec::new(),
            log: Vec::new(),
            floor: 0,
            feed,
        }
    }

    fn position(&self, id: &DocumentId) -> Option<usize> {
        self.documents
            .iter()
            .position(|doc| DocumentId::of(doc).as_ref() == Some(id))
    }
}

/// Read counters, one per object store operation.
#[derive(Debug, Default)]
pub struct ReadCounters {
    pub finds: AtomicU64,
    pub find_ones: AtomicU64,
    pub id_fetches: AtomicU64,
    pub counts: AtomicU64,
}

impl ReadCounters {
    /// Total number of reads of any kind.
    pub fn total(&self) -> u64 {
        self.finds.load(AtomicOrdering::Relaxed)
            + self.find_ones.load(AtomicOrdering::Relaxed)
            + self.id_fetches.load(AtomicOrdering::Relaxed)
            + self.counts.load(AtomicOrdering::Relaxed)
    }
}

/// In-memory object store with a change feed.
#[derive(Clone, Default)]
pub struct MemoryObjectStore {
    collections: Arc<DashMap<String, Arc<Mutex<CollectionState>>>>,
    sequence: Arc<AtomicU64>,
    reads: Arc<ReadCounters>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reads(&self) -> &ReadCounters {
        &self.reads
    }

    fn state(&self, collection: &str) -> Arc<Mutex<CollectionState>> {
        self.collections
            .entry(collection.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(CollectionState::new())))
            .clone()
    }

    fn record(
        &self,
        state: &mut CollectionState,
        collection: &str,
        operation: OperationKind,
        document_id: DocumentId,
        document: Option<Document>,
    ) {
        let seq = self.sequence.fetch_add(1, AtomicOrdering::SeqCst) + 1;
        let event = ChangeEvent {
            token: SequenceToken::new(seq.to_string()),
            operation,
            collection: collection.to_string(),
            document_id,
            document,
        };
        state.log.push((seq, event.clone()));
        // No receivers is fine: nobody is watching yet.
        let _ = state.feed.send(FeedMessage::Event(event));
    }

    /// Insert a document, assigning an ObjectId if it has no `_id`.
    pub fn insert(&self, collection: &str, mut document: Document) -> DocumentId {
        let id = match document.get("_id") {
            Some(id) => DocumentId::from_bson(id),
            None => {
                let oid = ObjectId::new();
                document.insert("_id", oid);
                DocumentId::object_id(oid)
            }
        };

        let state = self.state(collection);
        let mut state = state.lock();
        state.documents.push(document.clone());
        self.record(&mut state, collection, OperationKind::Insert, id.clone(), Some(document));
        id
    }

    /// Set fields on an existing document. Returns `false` if it does not exist.
    pub fn update(&self, collection: &str, id: &DocumentId, changes: Document) -> bool {
        let state = self.state(collection);
        let mut state = state.lock();
        let Some(index) = state.position(id) else {
            return false;
        };
        for (key, value) in changes {
            state.documents[index].insert(key, value);
        }
        let post_image = state.documents[index].clone();
        self.record(&mut state, collection, OperationKind::Update, id.clone(), Some(post_image));
        true
    }

    /// Replace a whole document, keyed by its `_id`.
    pub fn replace(&self, collection: &str, document: Document) -> bool {
        let Some(id) = DocumentId::of(&document) else {
            return false;
        };
        let state = self.state(collection);
        let mut state = state.lock();
        let Some(index) = state.position(&id) else {
            return false;
        };
        state.documents[index] = document.clone();
        self.record(&mut state, collection, OperationKind::Replace, id, Some(document));
        true
    }

    pub fn delete(&self, collection: &str, id: &DocumentId) -> bool {
        let state = self.state(collection);
        let mut state = state.lock();
        let Some(index) = state.position(id) else {
            return false;
        };
        state.documents.remove(index);
        self.record(&mut state, collection, OperationKind::Delete, id.clone(), None);
        true
    }

    /// Break every open change feed of a collection.
    pub fn interrupt_feeds(&self, collection: &str) {
        let state = self.state(collection);
        let state = state.lock();
        let _ = state.feed.send(FeedMessage::Interrupt);
    }

    /// Drop the change log, so older resume tokens can no longer be used.
    pub fn expire_history(&self, collection: &str) {
        let state = self.state(collection);
        let mut state = state.lock();
        state.floor = self.sequence.load(AtomicOrdering::SeqCst);
        state.log.clear();
    }

    fn matching(&self, collection: &str, filter: &Document, options: &QueryOptions) -> Vec<Document> {
        let state = self.state(collection);
        let state = state.lock();
        let mut documents: Vec<Document> = state
            .documents
            .iter()
            .filter(|doc| matches_filter(doc, filter))
            .cloned()
            .collect();
        drop(state);

        if !options.sort.is_empty() {
            documents.sort_by(|a, b| {
                for key in &options.sort {
                    let ordering = compare_bson(a.get(&key.field), b.get(&key.field));
                    let ordering = match key.direction {
                        SortDirection::Ascending => ordering,
                        SortDirection::Descending => ordering.reverse(),
                    };
                    if ordering != Ordering::Equal {
                        return ordering;
                    }
                }
                Ordering::Equal
            });
        }

        let skip = options.skip.unwrap_or(0) as usize;
        let limit = options.limit.map(|limit| limit as usize).unwrap_or(usize::MAX);
        documents.into_iter().skip(skip).take(limit).collect()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn find(
        &self,
        collection: &str,
        filter: Document,
        options: &QueryOptions,
    ) -> Result<Vec<Document>, ObjectStoreError> {
        self.reads.finds.fetch_add(1, AtomicOrdering::Relaxed);
        Ok(self.matching(collection, &filter, options))
    }

    async fn find_one(
        &self,
        collection: &str,
        filter: Document,
        options: &QueryOptions,
    ) -> Result<Option<Document>, ObjectStoreError> {
        self.reads.find_ones.fetch_add(1, AtomicOrdering::Relaxed);
        let options = QueryOptions {
            limit: Some(1),
            ..options.clone()
        };
        Ok(self.matching(collection, &filter, &options).into_iter().next())
    }

    async fn find_by_ids(
        &self,
        collection: &str,
        ids: &[DocumentId],
    ) -> Result<Vec<Document>, ObjectStoreError> {
        self.reads.id_fetches.fetch_add(1, AtomicOrdering::Relaxed);
        let state = self.state(collection);
        let state = state.lock();
        Ok(state
            .documents
            .iter()
            .filter(|doc| DocumentId::of(doc).is_some_and(|id| ids.contains(&id)))
            .cloned()
            .collect())
    }

    async fn count(
        &self,
        collection: &str,
        filter: Document,
        options: &QueryOptions,
    ) -> Result<u64, ObjectStoreError> {
        self.reads.counts.fetch_add(1, AtomicOrdering::Relaxed);
        let options = QueryOptions {
            sort: Vec::new(),
            ..options.clone()
        };
        Ok(self.matching(collection, &filter, &options).len() as u64)
    }

    async fn watch(
        &self,
        collection: &str,
        resume_after: Option<SequenceToken>,
    ) -> Result<OpenFeed, ObjectStoreError> {
        let state = self.state(collection);
        let state = state.lock();
        // Writes are recorded under this lock, so nothing can slip between
        // reading the position and subscribing to the live feed.
        let start = SequenceToken::new(self.sequence.load(AtomicOrdering::SeqCst).to_string());

        let backlog: Vec<ChangeEvent> = match resume_after {
            Some(token) => {
                let after: u64 = token.as_str().parse().map_err(|_| {
                    ObjectStoreError::InvalidId(format!("resume token {}", token.as_str()))
                })?;
                if after < state.floor {
                    return Err(ObjectStoreError::HistoryLost {
                        collection: collection.to_string(),
                    });
                }
                state
                    .log
                    .iter()
                    .filter(|(seq, _)| *seq > after)
                    .map(|(_, event)| event.clone())
                    .collect()
            }
            None => Vec::new(),
        };
        let receiver = state.feed.subscribe();
        drop(state);

        let name = collection.to_string();
        let live = futures::stream::unfold(Some(receiver), move |receiver| {
            let name = name.clone();
            async move {
                let mut receiver = receiver?;
                match receiver.recv().await {
                    Ok(FeedMessage::Event(event)) => Some((Ok(event), Some(receiver))),
                    Ok(FeedMessage::Interrupt) => Some((
                        Err(ObjectStoreError::FeedInterrupted { collection: name }),
                        None,
                    )),
                    Err(broadcast::error::RecvError::Lagged(_)) => Some((
                        Err(ObjectStoreError::HistoryLost { collection: name }),
                        None,
                    )),
                    Err(broadcast::error::RecvError::Closed) => None,
                }
            }
        });

        Ok(OpenFeed {
            events: futures::stream::iter(backlog.into_iter().map(Ok))
                .chain(live)
                .boxed(),
            start: Some(start),
        })
    }
}

fn matches_filter(document: &Document, filter: &Document) -> bool {
    filter.iter().all(|(key, expected)| {
        let actual = document.get(key);
        match expected {
            Bson::Document(operator) if operator.contains_key("$in") => match operator.get("$in") {
                Some(Bson::Array(candidates)) => {
                    actual.is_some_and(|actual| candidates.iter().any(|c| c == actual))
                }
                _ => false,
            },
            expected => actual == Some(expected),
        }
    })
}

fn compare_bson(a: Option<&Bson>, b: Option<&Bson>) -> Ordering {
    fn number(value: &Bson) -> Option<f64> {
        match value {
            Bson::Int32(v) => Some(f64::from(*v)),
            Bson::Int64(v) => Some(*v as f64),
            Bson::Double(v) => Some(*v),
            _ => None,
        }
    }

    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => match (number(a), number(b), a, b) {
            (Some(x), Some(y), _, _) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            (_, _, Bson::String(x), Bson::String(y)) => x.cmp(y),
            (_, _, Bson::Boolean(x), Bson::Boolean(y)) => x.cmp(y),
            (_, _, Bson::DateTime(x), Bson::DateTime(y)) => x.cmp(y),
            _ => a.to_string().cmp(&b.to_string()),
        },
    }
}

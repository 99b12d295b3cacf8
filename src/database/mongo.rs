//! MongoDB object store.

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use mongodb::bson::{self, Bson, Document, doc};
use mongodb::change_stream::event::{ChangeStreamEvent, OperationType, ResumeToken};
use mongodb::error::ErrorKind;
use mongodb::options::{ClientOptions, CountOptions, FindOneOptions, FindOptions, FullDocumentType};
use mongodb::{Client, Collection};
use tracing::{debug, info};

use super::{ChangeEvent, DocumentId, ObjectStore, OpenFeed, OperationKind, QueryOptions, SequenceToken};
use crate::error::ObjectStoreError;

/// Server error codes meaning the resume point is gone for good.
const HISTORY_LOST_CODES: [i32; 2] = [280, 286];

/// Database wrapper for MongoDB operations.
#[derive(Debug, Clone)]
pub struct Database {
    client: Client,
    db: mongodb::Database,
}

impl Database {
    /// Connect to MongoDB with the given URI and database name.
    ///
    /// # Errors
    /// Returns error if connection fails.
    pub async fn connect(uri: &str, db_name: &str) -> Result<Self, ObjectStoreError> {
        let options = ClientOptions::parse(uri).await?;
        let client = Client::with_options(options)?;

        // Ping the database to verify connection
        client.database("admin").run_command(doc! { "ping": 1 }).await?;

        info!("Successfully connected to MongoDB");

        let db = client.database(db_name);

        Ok(Self { client, db })
    }

    /// Get a reference to the underlying MongoDB client.
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Get an untyped collection from the database.
    pub fn collection(&self, name: &str) -> Collection<Document> {
        self.db.collection(name)
    }
}

/// Object store over a MongoDB database.
#[derive(Debug, Clone)]
pub struct MongoObjectStore {
    db: Database,
}

impl MongoObjectStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }
}

#[async_trait]
impl ObjectStore for MongoObjectStore {
    async fn find(
        &self,
        collection: &str,
        filter: Document,
        options: &QueryOptions,
    ) -> Result<Vec<Document>, ObjectStoreError> {
        let mut find_options = FindOptions::default();
        find_options.sort = options.sort_document();
        find_options.skip = options.skip;
        find_options.limit = options.limit.map(|limit| limit as i64);

        let cursor = self
            .db
            .collection(collection)
            .find(filter)
            .with_options(find_options)
            .await?;
        let documents: Vec<Document> = cursor.try_collect().await?;

        debug!("DB find on {}: {} documents", collection, documents.len());
        Ok(documents)
    }

    async fn find_one(
        &self,
        collection: &str,
        filter: Document,
        options: &QueryOptions,
    ) -> Result<Option<Document>, ObjectStoreError> {
        let mut find_options = FindOneOptions::default();
        find_options.sort = options.sort_document();
        find_options.skip = options.skip;

        let result = self
            .db
            .collection(collection)
            .find_one(filter)
            .with_options(find_options)
            .await?;

        debug!("DB find_one on {}: {:?}", collection, result.is_some());
        Ok(result)
    }

    async fn find_by_ids(
        &self,
        collection: &str,
        ids: &[DocumentId],
    ) -> Result<Vec<Document>, ObjectStoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids = ids
            .iter()
            .map(DocumentId::to_bson)
            .collect::<Result<Vec<Bson>, _>>()?;

        let cursor = self
            .db
            .collection(collection)
            .find(doc! { "_id": { "$in": ids } })
            .await?;
        Ok(cursor.try_collect().await?)
    }

    async fn count(
        &self,
        collection: &str,
        filter: Document,
        options: &QueryOptions,
    ) -> Result<u64, ObjectStoreError> {
        let mut count_options = CountOptions::default();
        count_options.skip = options.skip;
        count_options.limit = options.limit;

        let count = self
            .db
            .collection(collection)
            .count_documents(filter)
            .with_options(count_options)
            .await?;
        Ok(count)
    }

    async fn watch(
        &self,
        collection: &str,
        resume_after: Option<SequenceToken>,
    ) -> Result<OpenFeed, ObjectStoreError> {
        let coll = self.db.collection(collection);
        let mut watch = coll.watch().full_document(FullDocumentType::UpdateLookup);
        if let Some(token) = resume_after {
            watch = watch.resume_after(decode_token(&token)?);
        }

        let stream = watch
            .await
            .map_err(|err| classify(collection, err))?;

        // Post-batch token of the opening aggregate: the stream's position
        // before any event has been read.
        let start = stream.resume_token().as_ref().map(encode_token).transpose()?;
        debug!("Opened change stream on {} (start token: {})", collection, start.is_some());

        let name = collection.to_string();
        let feed = stream.filter_map(move |item| {
            let result = match item {
                Ok(event) => convert_event(&name, event).transpose(),
                Err(err) => Some(Err(classify(&name, err))),
            };
            futures::future::ready(result)
        });

        Ok(OpenFeed {
            events: feed.boxed(),
            start,
        })
    }
}

/// Turn a driver event into a change event; non-CRUD events are skipped.
fn convert_event(
    collection: &str,
    event: ChangeStreamEvent<Document>,
) -> Result<Option<ChangeEvent>, ObjectStoreError> {
    let operation = match event.operation_type {
        OperationType::Insert => OperationKind::Insert,
        OperationType::Update => OperationKind::Update,
        OperationType::Replace => OperationKind::Replace,
        OperationType::Delete => OperationKind::Delete,
        other => {
            debug!("Skipping {:?} event on {}", other, collection);
            return Ok(None);
        }
    };

    let Some(id) = event.document_key.as_ref().and_then(|key| key.get("_id")) else {
        return Err(ObjectStoreError::InvalidId(format!("{} event without _id", operation)));
    };

    let document = match operation {
        OperationKind::Delete => None,
        _ => event.full_document,
    };

    Ok(Some(ChangeEvent {
        token: encode_token(&event.id)?,
        operation,
        collection: collection.to_string(),
        document_id: DocumentId::from_bson(id),
        document,
    }))
}

fn encode_token(token: &ResumeToken) -> Result<SequenceToken, ObjectStoreError> {
    let bson = bson::to_bson(token)
        .map_err(|err| ObjectStoreError::InvalidId(format!("resume token: {}", err)))?;
    Ok(SequenceToken::new(bson.into_canonical_extjson().to_string()))
}

fn decode_token(token: &SequenceToken) -> Result<ResumeToken, ObjectStoreError> {
    let invalid = || ObjectStoreError::InvalidId(format!("resume token {}", token.as_str()));
    let value: serde_json::Value = serde_json::from_str(token.as_str()).map_err(|_| invalid())?;
    let bson = Bson::try_from(value).map_err(|_| invalid())?;
    Ok(bson::from_bson(bson)?)
}

fn classify(collection: &str, err: mongodb::error::Error) -> ObjectStoreError {
    if let ErrorKind::Command(command) = err.kind.as_ref()
        && HISTORY_LOST_CODES.contains(&command.code)
    {
        return ObjectStoreError::HistoryLost {
            collection: collection.to_string(),
        };
    }
    ObjectStoreError::Database(err)
}

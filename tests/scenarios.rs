//! End-to-end behavior of the cache and change listener against the
//! in-process stores.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use mongodb::bson::{Document, doc};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use stratus::cache::{ReadThroughCache, ReadThroughConfig};
use stratus::database::{ChangeEvent, DocumentId, MemoryObjectStore, OperationKind, QueryOptions};
use stratus::events::{Backoff, ChangeListener, ListenerHandle, ListenerState, SubscriberRegistry};
use stratus::keyed::{MemoryKeyedStore, StoreConfig};

const WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, Deserialize, PartialEq)]
struct Emote {
    #[serde(rename = "_id")]
    id: String,
    name: String,
    status: String,
}

struct Harness {
    objects: MemoryObjectStore,
    keyed: Arc<MemoryKeyedStore>,
    cache: ReadThroughCache,
    registry: SubscriberRegistry,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(ReadThroughConfig::default())
    }

    fn with_config(config: ReadThroughConfig) -> Self {
        let objects = MemoryObjectStore::new();
        let keyed = Arc::new(MemoryKeyedStore::new(StoreConfig::default()));
        let cache = ReadThroughCache::new(Arc::new(objects.clone()), keyed.clone(), config);
        Self {
            objects,
            keyed,
            cache,
            registry: SubscriberRegistry::new(),
        }
    }

    fn seed_emotes(&self) {
        for (id, name, status) in [
            ("abc", "PogChamp", "live"),
            ("def", "Kappa", "live"),
            ("ghi", "LUL", "live"),
            ("jkl", "monkaS", "pending"),
        ] {
            self.objects
                .insert("emotes", doc! { "_id": id, "name": name, "status": status });
        }
    }

    async fn listen(&self, collection: &str) -> ListenerHandle {
        let handle = ChangeListener::new(
            collection,
            Arc::new(self.objects.clone()),
            self.keyed.clone(),
            self.registry.clone(),
        )
        .with_backoff(Backoff::constant(Duration::from_millis(20)))
        .spawn(CancellationToken::new());
        assert_eq!(handle.wait_for(ListenerState::Streaming).await, ListenerState::Streaming);
        handle
    }

    fn reads(&self) -> u64 {
        self.objects.reads().total()
    }

    async fn live_emotes(&self) -> Vec<Emote> {
        self.cache
            .find("emotes", None, doc! { "status": "live" }, &QueryOptions::default().sort_asc("name"))
            .await
            .unwrap()
    }
}

async fn next_event(events: &mut mpsc::Receiver<Arc<ChangeEvent>>) -> Arc<ChangeEvent> {
    tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("event not delivered in time")
        .expect("subscription closed")
}

fn names(emotes: &[Emote]) -> Vec<&str> {
    emotes.iter().map(|e| e.name.as_str()).collect()
}

#[tokio::test]
async fn cold_cache_populates_then_serves_repeat_without_object_store() {
    let h = Harness::new();
    h.seed_emotes();

    let first = h.live_emotes().await;
    assert_eq!(names(&first), vec!["Kappa", "LUL", "PogChamp"]);
    assert_eq!(h.reads(), 1);

    let second = h.live_emotes().await;
    assert_eq!(second, first);
    assert_eq!(h.reads(), 1);
}

#[tokio::test]
async fn evicted_object_is_refetched_transparently() {
    let h = Harness::new();
    h.seed_emotes();
    let first = h.live_emotes().await;

    assert!(h.keyed.evict_object("emotes", &DocumentId::string("def")));

    let second = h.live_emotes().await;
    assert_eq!(second, first);
    assert_eq!(h.objects.reads().finds.load(Ordering::Relaxed), 1);
    assert_eq!(h.objects.reads().id_fetches.load(Ordering::Relaxed), 1);

    // The refetched object was written back.
    h.live_emotes().await;
    assert_eq!(h.reads(), 2);
}

#[tokio::test]
async fn processed_update_is_visible_to_cached_find_one() {
    let h = Harness::new();
    h.seed_emotes();
    let listener = h.listen("emotes").await;
    let mut events = h.registry.subscribe_channel("emotes", "test", 16);

    let before: Option<Emote> = h
        .cache
        .find_one("emotes", None, doc! { "_id": "abc" }, &QueryOptions::default())
        .await
        .unwrap();
    assert_eq!(before.unwrap().name, "PogChamp");
    let reads = h.reads();

    h.objects
        .update("emotes", &DocumentId::string("abc"), doc! { "name": "PogChampion" });
    next_event(&mut events).await;

    let after: Option<Emote> = h
        .cache
        .find_one("emotes", None, doc! { "_id": "abc" }, &QueryOptions::default())
        .await
        .unwrap();
    assert_eq!(after.unwrap().name, "PogChampion");
    assert_eq!(h.reads(), reads);

    listener.shutdown().await.unwrap();
}

#[tokio::test]
async fn processed_delete_drops_document_from_cached_query() {
    let h = Harness::new();
    h.seed_emotes();
    let listener = h.listen("emotes").await;
    let mut events = h.registry.subscribe_channel("emotes", "test", 16);

    assert_eq!(h.live_emotes().await.len(), 3);

    h.objects.delete("emotes", &DocumentId::string("ghi"));
    let event = next_event(&mut events).await;
    assert_eq!(event.operation, OperationKind::Delete);

    let after = h.live_emotes().await;
    assert_eq!(names(&after), vec!["Kappa", "PogChamp"]);

    listener.shutdown().await.unwrap();
}

#[tokio::test]
async fn collection_size_is_cached_until_ttl_expires() {
    let h = Harness::with_config(
        ReadThroughConfig::default().collection_size_ttl(Duration::from_millis(100)),
    );
    h.seed_emotes();
    let options = QueryOptions::default();

    assert_eq!(h.cache.get_collection_size("emotes", Document::new(), &options).await.unwrap(), 4);

    h.objects
        .insert("emotes", doc! { "_id": "mno", "name": "OMEGALUL", "status": "live" });
    assert_eq!(h.cache.get_collection_size("emotes", Document::new(), &options).await.unwrap(), 4);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(h.cache.get_collection_size("emotes", Document::new(), &options).await.unwrap(), 5);
}

#[tokio::test]
async fn update_fans_out_to_every_subscriber_until_unsubscribed() {
    let h = Harness::new();
    let id = h.objects.insert("users", doc! { "_id": "u1", "username": "forsen" });
    let listener = h.listen("users").await;

    let mut first = h.registry.subscribe_channel("users", "first", 16);
    let mut second = h.registry.subscribe_channel("users", "second", 16);

    h.objects.update("users", &id, doc! { "username": "xqc" });
    assert_eq!(next_event(&mut first).await.document_id, id);
    assert_eq!(next_event(&mut second).await.document_id, id);

    assert!(h.registry.unsubscribe("first"));

    h.objects.update("users", &id, doc! { "username": "pokelawls" });
    let event = next_event(&mut second).await;
    assert_eq!(
        event.document.as_ref().and_then(|d| d.get_str("username").ok()),
        Some("pokelawls")
    );
    assert!(first.recv().await.is_none());

    listener.shutdown().await.unwrap();
}

#[tokio::test]
async fn group_invalidation_only_drops_tagged_queries() {
    let h = Harness::new();
    h.seed_emotes();
    let options = QueryOptions::default();

    let _: Vec<Emote> = h
        .cache
        .find("emotes", Some("set:1"), doc! { "status": "live" }, &options)
        .await
        .unwrap();
    let _: Vec<Emote> = h
        .cache
        .find("emotes", Some("set:2"), doc! { "status": "pending" }, &options)
        .await
        .unwrap();
    assert_eq!(h.reads(), 2);

    assert_eq!(h.cache.invalidate_group("emotes", "set:1").await.unwrap(), 1);

    let _: Vec<Emote> = h
        .cache
        .find("emotes", Some("set:2"), doc! { "status": "pending" }, &options)
        .await
        .unwrap();
    assert_eq!(h.reads(), 2);

    let _: Vec<Emote> = h
        .cache
        .find("emotes", Some("set:1"), doc! { "status": "live" }, &options)
        .await
        .unwrap();
    assert_eq!(h.reads(), 3);
}

#[tokio::test]
async fn cached_results_match_direct_object_store_reads() {
    let h = Harness::new();
    h.seed_emotes();
    let filters = [
        doc! { "status": "live" },
        doc! { "status": "pending" },
        doc! { "status": "retired" },
        Document::new(),
    ];

    for filter in filters {
        let options = QueryOptions::default().sort_desc("name");
        let cold = h
            .cache
            .find_documents("emotes", None, filter.clone(), &options)
            .await
            .unwrap();
        let warm = h
            .cache
            .find_documents("emotes", None, filter.clone(), &options)
            .await
            .unwrap();
        let direct = stratus::database::ObjectStore::find(&h.objects, "emotes", filter, &options)
            .await
            .unwrap();

        assert_eq!(cold, direct);
        assert_eq!(warm, direct);
    }
}

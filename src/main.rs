//! Stratus - cache coherence service.
//!
//! Connects to MongoDB and Redis, then runs one change listener per
//! watched collection until Ctrl-C.

use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use stratus::cache::ReadThroughCache;
use stratus::config::Config;
use stratus::database::{Database, MongoObjectStore, ObjectStore};
use stratus::events::{ChangeListener, SubscriberRegistry};
use stratus::keyed::{KeyedStore, RedisKeyedStore};

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file first (before anything else)
    dotenvy::dotenv().ok();

    // If RUST_LOG is not set, default to "info" level for our crate
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("stratus=info,mongodb=warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .init();

    info!("Starting Stratus...");

    let config = Config::from_env()?;
    info!("Configuration loaded successfully");

    info!("Connecting to MongoDB...");
    let db = Database::connect(&config.mongodb_uri, &config.mongodb_database).await?;
    let objects: Arc<dyn ObjectStore> = Arc::new(MongoObjectStore::new(db));

    let redis_url = config
        .redis_url
        .as_deref()
        .context("REDIS_URL must be set")?;
    info!("Connecting to Redis...");
    let keyed: Arc<dyn KeyedStore> =
        Arc::new(RedisKeyedStore::connect(redis_url, config.store_config()).await?);

    let cache = ReadThroughCache::new(
        Arc::clone(&objects),
        Arc::clone(&keyed),
        config.read_through_config(),
    );
    let registry = SubscriberRegistry::new();
    info!("Cache initialized");

    if config.watched_collections.is_empty() {
        warn!("No watched collections configured (WATCHED_COLLECTIONS is empty)");
    }

    let shutdown = CancellationToken::new();
    let listeners: Vec<_> = config
        .watched_collections
        .iter()
        .map(|collection| {
            ChangeListener::new(
                collection.as_str(),
                Arc::clone(&objects),
                Arc::clone(&keyed),
                registry.clone(),
            )
            .with_timeout(config.store_timeout.max(std::time::Duration::from_secs(1)))
            .spawn(shutdown.clone())
        })
        .collect();
    info!("Watching {} collection(s)", listeners.len());

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    shutdown.cancel();

    for listener in listeners {
        let collection = listener.collection().to_string();
        if let Err(err) = listener.join().await {
            error!("Change listener for {} ended with error: {}", collection, err);
        }
    }

    let stats = cache.stats();
    info!(
        "Cache stats: {} hits, {} partial hits, {} misses, {} fallbacks",
        stats.hits, stats.partial_hits, stats.misses, stats.fallbacks
    );

    Ok(())
}

//! Stratus - read-through, normalized document cache with change propagation.
//!
//! Sits between application code and a document database. Repeated
//! identical queries are answered from a shared keyed store, and a change
//! listener per collection keeps that store coherent with every write made
//! anywhere in the fleet.
//!
//! ## Architecture
//!
//! - `config` - Environment configuration
//! - `database` - Object store (MongoDB, in-process) and change feeds
//! - `keyed` - Keyed store atomic procedures (Redis, in-process)
//! - `fingerprint` - Query fingerprints and idempotency keys
//! - `cache` - Read-through cache: Find, FindOne, GetCollectionSize
//! - `events` - Change listeners and the subscriber registry
//! - `error` - Error types

pub mod cache;
pub mod config;
pub mod database;
pub mod error;
pub mod events;
pub mod fingerprint;
pub mod keyed;

pub use cache::{ReadThroughCache, ReadThroughConfig};
pub use config::Config;
pub use error::{CacheError, ConfigError, KeyedStoreError, ListenerError, ObjectStoreError};
pub use events::{ChangeListener, ListenerHandle, ListenerState, SubscriberRegistry};

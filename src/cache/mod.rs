//! Read-through cache in front of the object store.
//!
//! ## Flow
//!
//! ```text
//! query -> fingerprint -> keyed store (hit / partial hit / miss)
//!                      -> object store on miss or for missing ids
//!                      -> write-back to the keyed store
//! ```
//!
//! Query results are normalized: a cached query only remembers which ids it
//! returned, the documents themselves live in the per-collection object
//! table. Editing a document therefore updates every cached query that
//! references it at once, and only membership changes need the coarser
//! common-index invalidation.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let emotes: Vec<Emote> = cache
//!     .find("emotes", Some("owner:u1"), doc! { "owner": "u1" }, &QueryOptions::default())
//!     .await?;
//! ```

mod read_through;
mod stats;

pub use read_through::{ReadThroughCache, ReadThroughConfig};
pub use stats::{CacheStats, StatsSnapshot};

//! Change propagation: change-feed listeners and in-process fan-out.
//!
//! One `ChangeListener` runs per watched collection. For every write it
//! patches the keyed store's object table and then hands the raw event to
//! the `SubscriberRegistry`, which forwards it to whoever registered
//! interest in that collection.

mod listener;
mod registry;

pub use listener::{Backoff, ChangeListener, ListenerHandle, ListenerState};
pub use registry::{EventSender, SubscriberRegistry};

//! Subscriber registry - in-process fan-out of change events.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::database::ChangeEvent;

/// Channel end handed to the registry by a subscriber.
pub type EventSender = mpsc::Sender<Arc<ChangeEvent>>;

/// Table of collection -> subscribers interested in its changes.
///
/// Cloning is cheap; clones share the same table. Nothing here blocks:
/// delivery uses `try_send`, so a full or slow subscriber only loses its
/// own events.
#[derive(Clone, Default)]
pub struct SubscriberRegistry {
    collections: Arc<DashMap<String, HashMap<String, EventSender>>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `channel` for changes on `collection`.
    ///
    /// Registering the same subscriber id again replaces its channel.
    pub fn subscribe(&self, collection: &str, subscriber_id: &str, channel: EventSender) {
        self.collections
            .entry(collection.to_string())
            .or_default()
            .insert(subscriber_id.to_string(), channel);
        debug!("Subscriber {} registered for {}", subscriber_id, collection);
    }

    /// Register a new bounded channel and return its receiving end.
    pub fn subscribe_channel(
        &self,
        collection: &str,
        subscriber_id: &str,
        capacity: usize,
    ) -> mpsc::Receiver<Arc<ChangeEvent>> {
        let (sender, receiver) = mpsc::channel(capacity);
        self.subscribe(collection, subscriber_id, sender);
        receiver
    }

    /// Remove a subscriber from every collection. Returns whether it was registered.
    pub fn unsubscribe(&self, subscriber_id: &str) -> bool {
        let mut removed = false;
        for mut subscribers in self.collections.iter_mut() {
            removed |= subscribers.remove(subscriber_id).is_some();
        }
        self.collections.retain(|_, subscribers| !subscribers.is_empty());
        if removed {
            debug!("Subscriber {} unregistered", subscriber_id);
        }
        removed
    }

    /// Hand `event` to every subscriber of its collection.
    ///
    /// Returns the number of subscribers that accepted it. Subscribers whose
    /// receiver is gone are dropped from the table.
    pub fn publish(&self, event: Arc<ChangeEvent>) -> usize {
        let mut delivered = 0;
        let mut closed = Vec::new();

        if let Some(subscribers) = self.collections.get(&event.collection) {
            for (subscriber_id, sender) in subscribers.iter() {
                match sender.try_send(Arc::clone(&event)) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        warn!(
                            "Subscriber {} on {} is lagging, dropped event for {}",
                            subscriber_id, event.collection, event.document_id
                        );
                    }
                    Err(TrySendError::Closed(_)) => closed.push(subscriber_id.clone()),
                }
            }
        }

        if !closed.is_empty() {
            self.prune_closed(&event.collection, &closed);
        }

        delivered
    }

    /// Drop subscribers seen closed during a publish. An id that was
    /// re-registered with a live channel in the meantime stays.
    fn prune_closed(&self, collection: &str, closed: &[String]) {
        let Some(mut subscribers) = self.collections.get_mut(collection) else {
            return;
        };
        for subscriber_id in closed {
            if subscribers.get(subscriber_id).is_some_and(|sender| sender.is_closed()) {
                subscribers.remove(subscriber_id);
                debug!("Subscriber {} on {} went away", subscriber_id, collection);
            }
        }
    }

    /// Number of subscribers of a collection.
    pub fn subscriber_count(&self, collection: &str) -> usize {
        self.collections
            .get(collection)
            .map(|subscribers| subscribers.len())
            .unwrap_or(0)
    }
}

impl std::fmt::Debug for SubscriberRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberRegistry")
            .field("collections", &self.collections.len())
            .finish()
    }
}

//! Change listener - keeps the keyed store coherent with one collection.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::SubscriberRegistry;
use crate::database::{ChangeEvent, ChangeFeed, ObjectStore, OperationKind, SequenceToken};
use crate::error::{KeyedStoreError, ListenerError, ObjectStoreError};
use crate::fingerprint::idempotency_key;
use crate::keyed::{Invalidation, KeyedStore, encode_document};

const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle of a listener's subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Starting,
    Streaming,
    Reconnecting,
    Stopped,
}

/// Reconnect delays: start at `initial`, double per failed attempt, cap at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(30),
        }
    }
}

impl Backoff {
    pub fn constant(delay: Duration) -> Self {
        Self {
            initial: delay,
            max: delay,
        }
    }

    fn next(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max)
    }
}

/// Why a feed stopped being consumed.
enum Interruption {
    Cancelled,
    Closed,
    Feed(ObjectStoreError),
    Invalidate(KeyedStoreError),
}

/// Watches one collection's change feed.
///
/// Every event is applied to the keyed store (post-image written, or object
/// removed on delete) before it is published to subscribers. The resume
/// token only advances past an event once its invalidation succeeded, so a
/// failed invalidation is retried by reconnecting; the idempotency key
/// makes the redelivery harmless.
pub struct ChangeListener {
    collection: String,
    objects: Arc<dyn ObjectStore>,
    keyed: Arc<dyn KeyedStore>,
    registry: SubscriberRegistry,
    backoff: Backoff,
    store_timeout: Duration,
}

impl ChangeListener {
    pub fn new(
        collection: impl Into<String>,
        objects: Arc<dyn ObjectStore>,
        keyed: Arc<dyn KeyedStore>,
        registry: SubscriberRegistry,
    ) -> Self {
        Self {
            collection: collection.into(),
            objects,
            keyed,
            registry,
            backoff: Backoff::default(),
            store_timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Deadline for each keyed store invalidation.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Run the listener on the runtime until `cancel` (or the handle) stops it.
    pub fn spawn(self, cancel: CancellationToken) -> ListenerHandle {
        let cancel = cancel.child_token();
        let (state_tx, state_rx) = watch::channel(ListenerState::Starting);
        let collection = self.collection.clone();

        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { self.run(cancel, state_tx).await }
        });

        ListenerHandle {
            collection,
            state: state_rx,
            cancel,
            task,
        }
    }

    async fn run(
        self,
        cancel: CancellationToken,
        state: watch::Sender<ListenerState>,
    ) -> Result<(), ObjectStoreError> {
        info!("Change listener for {} starting", self.collection);

        let mut resume: Option<SequenceToken> = None;
        let mut delay = self.backoff.initial;

        let outcome = loop {
            let watched = tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                watched = self.objects.watch(&self.collection, resume.clone()) => watched,
            };

            let interruption = match watched {
                Ok(opened) => {
                    // A fresh feed has no event token yet. Keep its opening
                    // position so a failure before the first event resumes
                    // from there instead of from "now".
                    if resume.is_none() {
                        resume = opened.start;
                    }
                    let mut feed = opened.events;
                    self.transition(&state, ListenerState::Streaming);
                    self.consume(&mut feed, &mut resume, &mut delay, &cancel).await
                }
                Err(err) => Interruption::Feed(err),
            };

            match interruption {
                Interruption::Cancelled => break Ok(()),
                Interruption::Feed(err) if !err.is_resumable() => {
                    error!(
                        "Change listener for {} cannot resume, cache coherence is lost until restart: {}",
                        self.collection, err
                    );
                    break Err(err);
                }
                Interruption::Feed(err) => {
                    warn!("Change feed for {} failed: {}", self.collection, err);
                }
                Interruption::Invalidate(err) => {
                    warn!(
                        "Invalidation on {} failed, event will be redelivered: {}",
                        self.collection, err
                    );
                }
                Interruption::Closed => {
                    warn!("Change feed for {} closed", self.collection);
                }
            }

            self.transition(&state, ListenerState::Reconnecting);
            debug!("Reconnecting to {} in {:?}", self.collection, delay);
            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
            delay = self.backoff.next(delay);
        };

        self.transition(&state, ListenerState::Stopped);
        outcome
    }

    async fn consume(
        &self,
        feed: &mut ChangeFeed,
        resume: &mut Option<SequenceToken>,
        delay: &mut Duration,
        cancel: &CancellationToken,
    ) -> Interruption {
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Interruption::Cancelled,
                next = feed.next() => next,
            };

            let event = match next {
                Some(Ok(event)) => event,
                Some(Err(err)) => return Interruption::Feed(err),
                None => return Interruption::Closed,
            };

            if let Err(err) = self.apply(&event).await {
                return Interruption::Invalidate(err);
            }

            *resume = Some(event.token.clone());
            *delay = self.backoff.initial;
            self.registry.publish(Arc::new(event));
        }
    }

    /// Apply one event to the keyed store. Returns the number of entries affected.
    async fn apply(&self, event: &ChangeEvent) -> Result<u64, KeyedStoreError> {
        let key = idempotency_key(&self.collection, &event.token);
        // An update whose post-image could not be looked up is treated as a
        // removal; the next read refetches the document.
        let json = match (event.operation, &event.document) {
            (OperationKind::Delete, _) | (_, None) => None,
            (_, Some(document)) => Some(encode_document(document)),
        };

        let invalidation = Invalidation {
            idempotency_key: Some(&key),
            collection: &self.collection,
            document_id: &event.document_id,
            common_index: None,
            document_json: json.as_deref(),
        };

        let affected = tokio::time::timeout(self.store_timeout, self.keyed.invalidate(invalidation))
            .await
            .map_err(|_| KeyedStoreError::Timeout(self.store_timeout))??;

        debug!(
            "Applied {} of {} on {} ({} affected)",
            event.operation, event.document_id, self.collection, affected
        );
        Ok(affected)
    }

    fn transition(&self, state: &watch::Sender<ListenerState>, next: ListenerState) {
        let previous = state.send_replace(next);
        if previous != next {
            info!("Change listener for {}: {:?} -> {:?}", self.collection, previous, next);
        }
    }
}

/// Handle to a spawned listener.
pub struct ListenerHandle {
    collection: String,
    state: watch::Receiver<ListenerState>,
    cancel: CancellationToken,
    task: JoinHandle<Result<(), ObjectStoreError>>,
}

impl ListenerHandle {
    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn state(&self) -> ListenerState {
        *self.state.borrow()
    }

    /// A receiver that observes every state transition.
    pub fn watch_state(&self) -> watch::Receiver<ListenerState> {
        self.state.clone()
    }

    /// Wait until the listener reaches `target`.
    ///
    /// Returns `Stopped` if the listener ends without ever reaching it.
    pub async fn wait_for(&self, target: ListenerState) -> ListenerState {
        let mut state = self.state.clone();
        match state.wait_for(|current| *current == target || *current == ListenerState::Stopped).await {
            Ok(current) => *current,
            Err(_) => ListenerState::Stopped,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancel the listener and wait for it to release its subscription.
    pub async fn shutdown(self) -> Result<(), ListenerError> {
        self.cancel.cancel();
        self.join().await
    }

    /// Wait for the listener to end on its own.
    pub async fn join(self) -> Result<(), ListenerError> {
        self.task.await??;
        Ok(())
    }
}

impl std::fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("collection", &self.collection)
            .field("state", &self.state())
            .finish()
    }
}

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures_util::StreamExt;
use parking_lot::{Mutex, ReentrantMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::auth::AuthGate;
use crate::errors::{AppError, AppResult};
use crate::models::FromDocument;
use crate::store::{DocumentStore, FieldQuery, StoredDocument};

/// Complete remote truth for one query as of the latest observed change.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveSnapshot<T> {
    pub records: Vec<T>,
    /// Delivery counter within one subscription; higher supersedes lower.
    pub revision: u64,
}

impl<T> LiveSnapshot<T> {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.records.iter()
    }
}

type Registry = Mutex<HashMap<u64, Arc<Subscription>>>;

#[derive(Debug)]
struct Subscription {
    id: u64,
    collection: String,
    // Held for the duration of every delivery; re-entrant so a callback may unsubscribe.
    active: ReentrantMutex<Cell<bool>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Subscription {
    /// Returns true only for the call that actually deactivated it.
    fn cancel(&self) -> bool {
        let was_active = {
            let gate = self.active.lock();
            gate.replace(false)
        };
        if was_active {
            if let Some(task) = self.task.lock().take() {
                task.abort();
            }
        }
        was_active
    }

    fn is_active(&self) -> bool {
        self.active.lock().get()
    }
}

/// Caller-owned token for one standing watch.
///
/// Dropping the handle cancels the watch as well.
#[derive(Debug)]
pub struct SubscriptionHandle {
    subscription: Arc<Subscription>,
    registry: Weak<Registry>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> u64 {
        self.subscription.id
    }

    pub fn is_active(&self) -> bool {
        self.subscription.is_active()
    }

    /// Stops delivery. Safe to call repeatedly.
    pub fn unsubscribe(&self) {
        if self.subscription.cancel() {
            if let Some(registry) = self.registry.upgrade() {
                registry.lock().remove(&self.subscription.id);
            }
            debug!(
                target: "live_sync",
                id = self.subscription.id,
                collection = %self.subscription.collection,
                "subscription cancelled"
            );
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// Keeps per-user views of remote collections current.
pub struct LiveCollectionSync {
    store: Arc<dyn DocumentStore>,
    registry: Arc<Registry>,
    next_id: AtomicU64,
    session: Option<Arc<AuthGate>>,
}

impl LiveCollectionSync {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            registry: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            session: None,
        }
    }

    /// Expires `gate` whenever the store rejects a watch as unauthenticated.
    pub fn with_session_gate(mut self, gate: Arc<AuthGate>) -> Self {
        self.session = Some(gate);
        self
    }

    async fn expire_session(session: Option<&AuthGate>) {
        if let Some(gate) = session {
            gate.expire().await;
        }
    }

    /// Watches every document in `collection` owned by `owner_id`.
    ///
    /// Each delivery replaces the previous one wholesale. The caller must
    /// resolve `owner_id` from a completed session check before calling.
    pub async fn subscribe<T, F>(
        &self,
        owner_id: &str,
        collection: &str,
        on_snapshot: F,
    ) -> AppResult<SubscriptionHandle>
    where
        T: FromDocument + Send + 'static,
        F: Fn(LiveSnapshot<T>) + Send + Sync + 'static,
    {
        if owner_id.trim().is_empty() {
            return Err(AppError::Unauthenticated);
        }

        let mut stream = match self
            .store
            .watch(&FieldQuery::owned_by(collection, owner_id))
            .await
        {
            Ok(stream) => stream,
            Err(AppError::Unauthenticated) => {
                warn!(target: "live_sync", collection, "watch refused; session no longer valid");
                Self::expire_session(self.session.as_deref()).await;
                return Err(AppError::Unauthenticated);
            }
            Err(err) => return Err(err),
        };
        let subscription = Arc::new(Subscription {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            collection: collection.to_string(),
            active: ReentrantMutex::new(Cell::new(true)),
            task: Mutex::new(None),
        });
        self.registry
            .lock()
            .insert(subscription.id, Arc::clone(&subscription));

        let worker = Arc::clone(&subscription);
        let registry = Arc::downgrade(&self.registry);
        let session = self.session.clone();
        let task = tokio::spawn(async move {
            let mut revision = 0_u64;
            let mut rejected = false;
            while let Some(item) = stream.next().await {
                match item {
                    Ok(documents) => {
                        revision += 1;
                        let snapshot = LiveSnapshot {
                            records: decode_all::<T>(&documents, &worker.collection),
                            revision,
                        };
                        let delivered = {
                            let gate = worker.active.lock();
                            if gate.get() {
                                on_snapshot(snapshot);
                                true
                            } else {
                                false
                            }
                        };
                        if !delivered {
                            break;
                        }
                    }
                    Err(AppError::Unauthenticated) => {
                        warn!(
                            target: "live_sync",
                            id = worker.id,
                            collection = %worker.collection,
                            "watch rejected; session no longer valid"
                        );
                        rejected = worker.is_active();
                        break;
                    }
                    Err(err) => {
                        warn!(
                            target: "live_sync",
                            id = worker.id,
                            collection = %worker.collection,
                            error = %err,
                            "watch reported an error; waiting for next change"
                        );
                    }
                }
            }
            worker.active.lock().set(false);
            if let Some(registry) = registry.upgrade() {
                registry.lock().remove(&worker.id);
            }
            if rejected {
                Self::expire_session(session.as_deref()).await;
            }
        });

        *subscription.task.lock() = Some(task);
        if !subscription.is_active() {
            if let Some(task) = subscription.task.lock().take() {
                task.abort();
            }
        }

        info!(
            target: "live_sync",
            id = subscription.id,
            collection,
            owner_id,
            "subscription started"
        );
        Ok(SubscriptionHandle {
            subscription,
            registry: Arc::downgrade(&self.registry),
        })
    }

    pub fn unsubscribe(&self, handle: &SubscriptionHandle) {
        handle.unsubscribe();
    }

    /// Tears down every live subscription, e.g. on logout.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<_> = self.registry.lock().drain().map(|(_, sub)| sub).collect();
        let cancelled = drained.iter().filter(|sub| sub.cancel()).count();
        if cancelled > 0 {
            info!(target: "live_sync", cancelled, "cancelled all subscriptions");
        }
        cancelled
    }

    pub fn active_count(&self) -> usize {
        self.registry.lock().len()
    }
}

fn decode_all<T: FromDocument>(documents: &[StoredDocument], collection: &str) -> Vec<T> {
    documents
        .iter()
        .filter_map(|document| match T::from_document(document) {
            Ok(record) => Some(record),
            Err(err) => {
                warn!(
                    target: "live_sync",
                    collection,
                    id = %document.id,
                    error = %err,
                    "skipping undecodable document"
                );
                None
            }
        })
        .collect()
}

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{self, Stream};
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};
use serde_json::{Map, Value};
use tokio::sync::watch;
use tracing::trace;

#[cfg(test)]
use std::sync::atomic::{AtomicBool, Ordering};

use crate::errors::{AppError, AppResult};
use crate::models::OWNER_FIELD;

const DOCUMENT_ID_LENGTH: usize = 20;

pub type SnapshotStream = Pin<Box<dyn Stream<Item = AppResult<Vec<StoredDocument>>> + Send>>;

#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub id: String,
    pub fields: Map<String, Value>,
}

impl StoredDocument {
    pub fn string_field(&self, name: &str) -> AppResult<String> {
        self.optional_string_field(name).ok_or_else(|| {
            AppError::Remote(format!("document {} is missing field {name}", self.id))
        })
    }

    pub fn optional_string_field(&self, name: &str) -> Option<String> {
        self.fields
            .get(name)
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    pub fn integer_field(&self, name: &str) -> Option<i64> {
        let value = self.fields.get(name)?;
        value
            .as_i64()
            .or_else(|| value.as_f64().map(|v| v.round() as i64))
            .or_else(|| value.as_str().and_then(|v| v.trim().parse().ok()))
    }

    fn matches(&self, query: &FieldQuery) -> bool {
        self.fields.get(&query.field) == Some(&query.value)
    }
}

/// Equality filter on a single field of one collection.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldQuery {
    pub collection: String,
    pub field: String,
    pub value: Value,
}

impl FieldQuery {
    pub fn new(collection: impl Into<String>, field: impl Into<String>, value: Value) -> Self {
        Self {
            collection: collection.into(),
            field: field.into(),
            value,
        }
    }

    pub fn owned_by(collection: impl Into<String>, owner_id: &str) -> Self {
        Self::new(collection, OWNER_FIELD, Value::String(owner_id.to_string()))
    }
}

/// Remote document collection contract the sync core is written against.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Creates a document and returns it with its store-assigned id.
    async fn create(&self, collection: &str, fields: Map<String, Value>)
        -> AppResult<StoredDocument>;

    async fn delete(&self, collection: &str, id: &str) -> AppResult<()>;

    async fn query(&self, query: &FieldQuery) -> AppResult<Vec<StoredDocument>>;

    /// Streams the full matching set: once immediately, then after every change.
    async fn watch(&self, query: &FieldQuery) -> AppResult<SnapshotStream>;
}

/// In-process document store with live change notification.
#[derive(Clone)]
pub struct MemoryDocumentStore {
    inner: Arc<MemoryInner>,
}

struct MemoryInner {
    collections: Mutex<HashMap<String, Vec<StoredDocument>>>,
    revision: watch::Sender<u64>,
    #[cfg(test)]
    faults: StoreFaults,
}

impl Default for MemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            inner: Arc::new(MemoryInner {
                collections: Mutex::new(HashMap::new()),
                revision,
                #[cfg(test)]
                faults: StoreFaults::default(),
            }),
        }
    }

    /// Replaces the fields of an existing document, as another client would.
    pub fn update(&self, collection: &str, id: &str, fields: Map<String, Value>) -> AppResult<()> {
        {
            let mut collections = self.inner.collections.lock();
            let document = collections
                .get_mut(collection)
                .and_then(|docs| docs.iter_mut().find(|doc| doc.id == id))
                .ok_or_else(|| AppError::NotFound(id.to_string()))?;
            document.fields = fields;
        }
        self.bump();
        Ok(())
    }

    pub fn len(&self, collection: &str) -> usize {
        self.inner
            .collections
            .lock()
            .get(collection)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn is_empty(&self, collection: &str) -> bool {
        self.len(collection) == 0
    }

    fn snapshot(&self, query: &FieldQuery) -> Vec<StoredDocument> {
        self.inner
            .collections
            .lock()
            .get(&query.collection)
            .map(|docs| docs.iter().filter(|doc| doc.matches(query)).cloned().collect())
            .unwrap_or_default()
    }

    fn bump(&self) {
        self.inner.revision.send_modify(|revision| *revision += 1);
    }

    #[cfg(test)]
    pub(crate) fn faults(&self) -> &StoreFaults {
        &self.inner.faults
    }

    #[cfg(test)]
    fn injected_fault(&self) -> AppResult<()> {
        if self.inner.faults.unauthorized.swap(false, Ordering::SeqCst) {
            return Err(AppError::Unauthenticated);
        }
        if self.inner.faults.remote.swap(false, Ordering::SeqCst) {
            return Err(AppError::Remote("simulated store outage".into()));
        }
        Ok(())
    }

    #[cfg(not(test))]
    fn injected_fault(&self) -> AppResult<()> {
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn create(
        &self,
        collection: &str,
        fields: Map<String, Value>,
    ) -> AppResult<StoredDocument> {
        self.injected_fault()?;
        let document = StoredDocument {
            id: random_document_id(),
            fields,
        };
        self.inner
            .collections
            .lock()
            .entry(collection.to_string())
            .or_default()
            .push(document.clone());
        trace!(target: "document_store", collection, id = %document.id, "document created");
        self.bump();
        Ok(document)
    }

    async fn delete(&self, collection: &str, id: &str) -> AppResult<()> {
        self.injected_fault()?;
        let removed = {
            let mut collections = self.inner.collections.lock();
            match collections.get_mut(collection) {
                Some(docs) => {
                    let before = docs.len();
                    docs.retain(|doc| doc.id != id);
                    before != docs.len()
                }
                None => false,
            }
        };
        if !removed {
            return Err(AppError::NotFound(id.to_string()));
        }
        trace!(target: "document_store", collection, id, "document deleted");
        self.bump();
        Ok(())
    }

    async fn query(&self, query: &FieldQuery) -> AppResult<Vec<StoredDocument>> {
        self.injected_fault()?;
        Ok(self.snapshot(query))
    }

    async fn watch(&self, query: &FieldQuery) -> AppResult<SnapshotStream> {
        self.injected_fault()?;
        let receiver = self.inner.revision.subscribe();
        let state = (receiver, self.clone(), query.clone(), None::<Vec<StoredDocument>>);
        let stream = stream::unfold(state, |(mut receiver, store, query, last)| async move {
            loop {
                if last.is_some() && receiver.changed().await.is_err() {
                    return None;
                }
                let current = store.snapshot(&query);
                if last.as_ref() != Some(&current) {
                    return Some((Ok(current.clone()), (receiver, store, query, Some(current))));
                }
            }
        });
        Ok(Box::pin(stream))
    }
}

pub(crate) fn random_document_id() -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(DOCUMENT_ID_LENGTH)
        .map(char::from)
        .collect()
}

#[cfg(test)]
#[derive(Default)]
pub(crate) struct StoreFaults {
    remote: AtomicBool,
    unauthorized: AtomicBool,
}

#[cfg(test)]
impl StoreFaults {
    pub fn fail_next_remote(&self) {
        self.remote.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_unauthorized(&self) {
        self.unauthorized.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures_util::StreamExt;
    use serde_json::json;
    use tokio::time::timeout;

    use super::*;

    fn fields(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn query_filters_on_field_equality() {
        let store = MemoryDocumentStore::new();
        store
            .create("locations", fields(json!({ "name": "A", "userId": "u1" })))
            .await
            .unwrap();
        store
            .create("locations", fields(json!({ "name": "B", "userId": "u2" })))
            .await
            .unwrap();

        let mine = store
            .query(&FieldQuery::owned_by("locations", "u1"))
            .await
            .unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].string_field("name").unwrap(), "A");
        assert_eq!(mine[0].id.len(), DOCUMENT_ID_LENGTH);
    }

    #[tokio::test]
    async fn watch_emits_initial_and_changed_sets_only() {
        let store = MemoryDocumentStore::new();
        let mut stream = store
            .watch(&FieldQuery::owned_by("locations", "u1"))
            .await
            .unwrap();

        let initial = stream.next().await.unwrap().unwrap();
        assert!(initial.is_empty());

        store
            .create("locations", fields(json!({ "name": "other", "userId": "u2" })))
            .await
            .unwrap();
        let created = store
            .create("locations", fields(json!({ "name": "mine", "userId": "u1" })))
            .await
            .unwrap();

        let next = timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].id, created.id);
    }

    #[tokio::test]
    async fn deleting_unknown_document_is_not_found() {
        let store = MemoryDocumentStore::new();
        let err = store.delete("locations", "missing").await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn update_is_visible_to_queries() {
        let store = MemoryDocumentStore::new();
        let created = store
            .create("locations", fields(json!({ "name": "old", "userId": "u1" })))
            .await
            .unwrap();
        store
            .update(
                "locations",
                &created.id,
                fields(json!({ "name": "new", "userId": "u1" })),
            )
            .unwrap();
        let docs = store
            .query(&FieldQuery::owned_by("locations", "u1"))
            .await
            .unwrap();
        assert_eq!(docs[0].string_field("name").unwrap(), "new");
    }
}

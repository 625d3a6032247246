use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream;
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Map, Number, Value};
use tokio::time::sleep;
use tracing::{debug, trace};

use crate::build_http_client;
use crate::config::AppConfig;
use crate::credentials::CredentialStore;
use crate::errors::{AppError, AppResult};
use crate::store::{DocumentStore, FieldQuery, SnapshotStream, StoredDocument};

/// Firestore over its REST surface, authorised with the stored session token.
#[derive(Clone)]
pub struct FirestoreDocumentStore {
    http: reqwest::Client,
    documents_url: String,
    credentials: CredentialStore,
    poll_interval: Duration,
}

#[derive(Deserialize)]
struct RawDocument {
    name: String,
    #[serde(default)]
    fields: Map<String, Value>,
}

impl RawDocument {
    fn into_stored(self) -> StoredDocument {
        let id = self
            .name
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string();
        StoredDocument {
            id,
            fields: decode_fields(&self.fields),
        }
    }
}

#[derive(Deserialize)]
struct RunQueryRow {
    document: Option<RawDocument>,
}

impl FirestoreDocumentStore {
    pub fn new(config: &AppConfig, credentials: CredentialStore) -> AppResult<Self> {
        let project_id = config
            .firebase_project_id
            .as_deref()
            .ok_or_else(|| AppError::Config("FIREBASE_PROJECT_ID is not set".into()))?;
        Ok(Self {
            http: build_http_client(config.http_timeout_secs)?,
            documents_url: format!(
                "{}/projects/{project_id}/databases/(default)/documents",
                config.firestore_api_base.trim_end_matches('/')
            ),
            credentials,
            poll_interval: Duration::from_millis(config.sync_poll_interval_ms),
        })
    }

    async fn bearer(&self) -> AppResult<String> {
        match self.credentials.read().await? {
            Some(session) if session.is_valid() => Ok(session.token),
            _ => Err(AppError::Unauthenticated),
        }
    }

    async fn run_query(&self, query: &FieldQuery) -> AppResult<Vec<StoredDocument>> {
        let token = self.bearer().await?;
        let body = json!({
            "structuredQuery": {
                "from": [{ "collectionId": query.collection }],
                "where": {
                    "fieldFilter": {
                        "field": { "fieldPath": query.field },
                        "op": "EQUAL",
                        "value": encode_value(&query.value)
                    }
                }
            }
        });
        let response = self
            .http
            .post(format!("{}:runQuery", self.documents_url))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(remote_error)?;
        let rows: Vec<RunQueryRow> = checked(response, &query.collection)
            .await?
            .json()
            .await
            .map_err(remote_error)?;
        Ok(rows
            .into_iter()
            .filter_map(|row| row.document.map(RawDocument::into_stored))
            .collect())
    }
}

#[async_trait]
impl DocumentStore for FirestoreDocumentStore {
    async fn create(
        &self,
        collection: &str,
        fields: Map<String, Value>,
    ) -> AppResult<StoredDocument> {
        let token = self.bearer().await?;
        let response = self
            .http
            .post(format!("{}/{collection}", self.documents_url))
            .bearer_auth(token)
            .json(&json!({ "fields": encode_fields(&fields) }))
            .send()
            .await
            .map_err(remote_error)?;
        let document: RawDocument = checked(response, collection)
            .await?
            .json()
            .await
            .map_err(remote_error)?;
        let document = document.into_stored();
        debug!(target: "document_store", collection, id = %document.id, "document created");
        Ok(document)
    }

    async fn delete(&self, collection: &str, id: &str) -> AppResult<()> {
        let token = self.bearer().await?;
        let response = self
            .http
            .delete(format!("{}/{collection}/{id}", self.documents_url))
            .bearer_auth(token)
            .send()
            .await
            .map_err(remote_error)?;
        checked(response, id).await?;
        debug!(target: "document_store", collection, id, "document deleted");
        Ok(())
    }

    async fn query(&self, query: &FieldQuery) -> AppResult<Vec<StoredDocument>> {
        self.run_query(query).await
    }

    /// Polls `runQuery` and yields only when the matching set changed.
    async fn watch(&self, query: &FieldQuery) -> AppResult<SnapshotStream> {
        let state = (self.clone(), query.clone(), None::<Vec<StoredDocument>>, false);
        let stream = stream::unfold(state, |(store, query, last, polled)| async move {
            if polled {
                sleep(store.poll_interval).await;
            }
            loop {
                match store.run_query(&query).await {
                    Ok(current) if last.as_ref() == Some(&current) => {
                        trace!(target: "document_store", collection = %query.collection, "no change");
                        sleep(store.poll_interval).await;
                    }
                    Ok(current) => {
                        return Some((Ok(current.clone()), (store, query, Some(current), true)));
                    }
                    Err(err) => return Some((Err(err), (store, query, last, true))),
                }
            }
        });
        Ok(Box::pin(stream))
    }
}

async fn checked(response: Response, subject: &str) -> AppResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(AppError::Unauthenticated),
        StatusCode::NOT_FOUND => Err(AppError::NotFound(subject.to_string())),
        _ => {
            let body = response.text().await.unwrap_or_default();
            Err(AppError::Remote(format!("{status}: {}", body.trim())))
        }
    }
}

fn remote_error(err: reqwest::Error) -> AppError {
    AppError::Remote(err.to_string())
}

fn encode_fields(fields: &Map<String, Value>) -> Map<String, Value> {
    fields
        .iter()
        .map(|(name, value)| (name.clone(), encode_value(value)))
        .collect()
}

/// Plain JSON into Firestore's typed value envelope.
fn encode_value(value: &Value) -> Value {
    match value {
        Value::Null => json!({ "nullValue": null }),
        Value::Bool(flag) => json!({ "booleanValue": flag }),
        Value::Number(number) => match number.as_i64() {
            Some(integer) => json!({ "integerValue": integer.to_string() }),
            None => json!({ "doubleValue": number.as_f64().unwrap_or_default() }),
        },
        Value::String(text) => json!({ "stringValue": text }),
        Value::Array(items) => json!({
            "arrayValue": { "values": items.iter().map(encode_value).collect::<Vec<_>>() }
        }),
        Value::Object(fields) => json!({ "mapValue": { "fields": encode_fields(fields) } }),
    }
}

fn decode_fields(fields: &Map<String, Value>) -> Map<String, Value> {
    fields
        .iter()
        .map(|(name, value)| (name.clone(), decode_value(value)))
        .collect()
}

fn decode_value(value: &Value) -> Value {
    let Some((kind, inner)) = value.as_object().and_then(|object| object.iter().next()) else {
        return Value::Null;
    };
    match kind.as_str() {
        "integerValue" => inner
            .as_str()
            .and_then(|raw| raw.parse::<i64>().ok())
            .map(|integer| Value::Number(Number::from(integer)))
            .unwrap_or_else(|| inner.clone()),
        "arrayValue" => Value::Array(
            inner
                .get("values")
                .and_then(Value::as_array)
                .map(|values| values.iter().map(decode_value).collect())
                .unwrap_or_default(),
        ),
        "mapValue" => Value::Object(
            inner
                .get("fields")
                .and_then(Value::as_object)
                .map(decode_fields)
                .unwrap_or_default(),
        ),
        "nullValue" => Value::Null,
        _ => inner.clone(),
    }
}

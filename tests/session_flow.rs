use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use httptest::matchers::{all_of, contains, request, url_decoded};
use httptest::responders::json_encoded;
use httptest::{Expectation, Server};
use secrecy::SecretString;
use serde_json::json;
use tempfile::tempdir;
use tokio::sync::mpsc;
use tokio::time::timeout;

use mylocation_lib::{
    AppConfig, AppContext, AppError, AppResult, AuthState, Coordinates, CredentialStore,
    DocumentStore, FieldQuery, FirebaseIdentityClient, GeocodeFailure, Geocoder, LiveSnapshot,
    LocalStore, LocationRecord, MemoryDocumentStore, NewLocation, ResolveState, Screen,
    SnapshotStream, StoredDocument, SAVED_COUNTRIES_COLLECTION,
};

struct NoResults;

#[async_trait]
impl Geocoder for NoResults {
    async fn lookup(&self, _place_name: &str) -> AppResult<Vec<Coordinates>> {
        Ok(Vec::new())
    }
}

/// A backend whose security rules reject every request.
struct RejectingStore;

#[async_trait]
impl DocumentStore for RejectingStore {
    async fn create(
        &self,
        _collection: &str,
        _fields: serde_json::Map<String, serde_json::Value>,
    ) -> AppResult<StoredDocument> {
        Err(AppError::Unauthenticated)
    }

    async fn delete(&self, _collection: &str, _id: &str) -> AppResult<()> {
        Err(AppError::Unauthenticated)
    }

    async fn query(&self, _query: &FieldQuery) -> AppResult<Vec<StoredDocument>> {
        Err(AppError::Unauthenticated)
    }

    async fn watch(&self, _query: &FieldQuery) -> AppResult<SnapshotStream> {
        Err(AppError::Unauthenticated)
    }
}

fn expect_sign_in(server: &Server, times: usize) {
    server.expect(
        Expectation::matching(all_of![
            request::method_path("POST", "/v1/accounts:signInWithPassword"),
            request::query(url_decoded(contains(("key", "web-key")))),
        ])
        .times(times)
        .respond_with(json_encoded(json!({
            "localId": "u1",
            "idToken": "id-token-u1"
        }))),
    );
}

fn config(server: &Server) -> AppConfig {
    AppConfig {
        firebase_api_key: Some(SecretString::from("web-key")),
        identity_endpoint: server.url_str("/v1/accounts:signInWithPassword"),
        directory_endpoint: server.url_str("/v3.1/all"),
        ..AppConfig::default()
    }
}

fn context(
    config: AppConfig,
    credentials: CredentialStore,
    store: &MemoryDocumentStore,
) -> AppContext {
    let identity = Arc::new(FirebaseIdentityClient::new(&config).unwrap());
    AppContext::with_collaborators(
        config,
        credentials,
        identity,
        Arc::new(store.clone()),
        Arc::new(NoResults),
    )
    .unwrap()
}

async fn wait_for_len(
    rx: &mut mpsc::UnboundedReceiver<LiveSnapshot<LocationRecord>>,
    len: usize,
) -> LiveSnapshot<LocationRecord> {
    timeout(Duration::from_secs(2), async {
        loop {
            let snapshot = rx.recv().await.expect("subscription closed");
            if snapshot.len() == len {
                return snapshot;
            }
        }
    })
    .await
    .expect("snapshot not delivered")
}

#[tokio::test]
async fn signed_in_session_syncs_saves_and_tears_down_on_logout() {
    let server = Server::run();
    expect_sign_in(&server, 2);
    server.expect(
        Expectation::matching(request::method_path("GET", "/v3.1/all"))
            .times(2)
            .respond_with(json_encoded(json!([
                {
                    "cca2": "IT",
                    "name": { "common": "Italy" },
                    "capital": ["Rome"],
                    "flags": { "png": "x" }
                },
                {
                    "cca2": "RO",
                    "name": { "common": "Romania" },
                    "capital": ["Bucharest"],
                    "flags": { "png": "y" }
                }
            ]))),
    );

    let store = MemoryDocumentStore::new();
    let app = context(
        config(&server),
        CredentialStore::new(LocalStore::in_memory()),
        &store,
    );

    assert_eq!(app.auth().state(), AuthState::Checking);
    assert_eq!(app.start().await.unwrap(), Screen::Login);
    assert!(matches!(
        app.subscribe_locations(|_| {}).await,
        Err(AppError::Unauthenticated)
    ));

    let session = app.login("user@example.com", "pw").await.unwrap();
    assert_eq!(session.user_id, "u1");
    assert!(app.auth().state().can_reach(Screen::Map));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = app
        .subscribe_locations(move |snapshot| {
            let _ = tx.send(snapshot);
        })
        .await
        .unwrap();
    wait_for_len(&mut rx, 0).await;

    let added = app
        .locations()
        .add(NewLocation::new("Harbour", "Evening walk").with_rating(0))
        .await
        .unwrap();
    let snapshot = wait_for_len(&mut rx, 1).await;
    assert_eq!(snapshot.records[0].id, added.id);
    assert_eq!(snapshot.records[0].rating, 1);

    let hits = app.search_countries("rom").await;
    assert_eq!(hits.len(), 2);
    assert!(hits.iter().all(|entry| !entry.saved));

    let italy = hits[0].country.clone();
    app.saved().add(&italy).await.unwrap();
    assert!(matches!(
        app.saved().add(&italy).await,
        Err(AppError::DuplicateSave(_))
    ));
    let hits = app.search_countries("rom").await;
    assert!(hits[0].saved);
    assert!(!hits[1].saved);

    let health = app.health().await.unwrap();
    assert_eq!(health.auth_state, "authenticated");
    assert!(health.has_stored_session);
    assert_eq!(health.active_subscriptions, 1);
    assert_eq!(health.saved_mirror_len, 1);

    app.logout().await.unwrap();
    assert!(!handle.is_active());
    assert!(app.saved().mirror().is_empty());
    assert_eq!(store.len(SAVED_COUNTRIES_COLLECTION), 1);

    let health = app.health().await.unwrap();
    assert_eq!(health.auth_state, "unauthenticated");
    assert!(!health.has_stored_session);
    assert_eq!(health.active_subscriptions, 0);

    app.logout().await.unwrap();
    assert_eq!(app.start().await.unwrap(), Screen::Login);

    app.login("user@example.com", "pw").await.unwrap();
    assert!(matches!(
        app.saved().add(&italy).await,
        Err(AppError::DuplicateSave(ref name)) if name == "Italy"
    ));
    assert_eq!(store.len(SAVED_COUNTRIES_COLLECTION), 1);
    assert_eq!(app.saved().mirror().len(), 1);
}

#[tokio::test]
async fn session_survives_restart_with_file_credentials() {
    let server = Server::run();
    expect_sign_in(&server, 1);
    let dir = tempdir().unwrap();
    let path = dir.path().join("session.json");
    let store = MemoryDocumentStore::new();

    let first = context(
        config(&server),
        CredentialStore::new(LocalStore::file(&path)),
        &store,
    );
    first.start().await.unwrap();
    first.login("user@example.com", "pw").await.unwrap();
    drop(first);

    let second = context(
        config(&server),
        CredentialStore::new(LocalStore::file(&path)),
        &store,
    );
    assert_eq!(second.start().await.unwrap(), Screen::Locations);
    assert_eq!(
        second.auth().current_session().map(|s| s.user_id),
        Some("u1".to_string())
    );
}

#[tokio::test]
async fn unknown_place_keeps_the_default_region() {
    let server = Server::run();
    let store = MemoryDocumentStore::new();
    let app = context(
        config(&server),
        CredentialStore::new(LocalStore::in_memory()),
        &store,
    );

    let focus = app.map_focus();
    let before = focus.region();
    let region = focus.focus(Some("Nonexistentplacezzz")).await.unwrap();
    assert_eq!(region, before);
    assert_eq!(focus.state(), ResolveState::Failed(GeocodeFailure::NotFound));

    focus.focus(None).await.unwrap();
    assert_eq!(focus.state(), ResolveState::Fallback);
    assert_eq!(focus.region().center, app.config().default_region);
}

#[tokio::test]
async fn subscriptions_see_writes_from_other_clients() {
    let server = Server::run();
    expect_sign_in(&server, 1);
    let store = MemoryDocumentStore::new();
    let app = context(
        config(&server),
        CredentialStore::new(LocalStore::in_memory()),
        &store,
    );
    app.login("user@example.com", "pw").await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = app
        .subscribe_locations(move |snapshot| {
            let _ = tx.send(snapshot);
        })
        .await
        .unwrap();

    let other_client = store.clone();
    for name in ["A", "B", "C"] {
        other_client
            .create(
                "locations",
                json!({ "name": name, "description": "d", "rating": 4, "userId": "u1" })
                    .as_object()
                    .cloned()
                    .unwrap(),
            )
            .await
            .unwrap();
    }
    let snapshot = wait_for_len(&mut rx, 3).await;
    assert!(snapshot.iter().all(|record| record.rating == 4));
    app.sync().unsubscribe(&handle);
    assert_eq!(app.sync().active_count(), 0);
}

#[tokio::test]
async fn rejected_watch_signs_the_user_out() {
    let server = Server::run();
    expect_sign_in(&server, 2);
    let config = config(&server);
    let identity = Arc::new(FirebaseIdentityClient::new(&config).unwrap());
    let app = AppContext::with_collaborators(
        config,
        CredentialStore::new(LocalStore::in_memory()),
        identity,
        Arc::new(RejectingStore),
        Arc::new(NoResults),
    )
    .unwrap();

    app.login("user@example.com", "pw").await.unwrap();
    assert!(matches!(
        app.subscribe_locations(|_| {}).await,
        Err(AppError::Unauthenticated)
    ));
    assert_eq!(app.auth().state(), AuthState::Unauthenticated);
    let health = app.health().await.unwrap();
    assert!(!health.has_stored_session);
    assert_eq!(health.active_subscriptions, 0);

    app.login("user@example.com", "pw").await.unwrap();
    assert!(matches!(
        app.subscribe_saved_countries(|_| {}).await,
        Err(AppError::Unauthenticated)
    ));
    assert_eq!(app.start().await.unwrap(), Screen::Login);
}

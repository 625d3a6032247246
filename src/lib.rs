mod auth;
mod config;
mod credentials;
mod directory;
mod errors;
mod firestore;
mod geocode;
mod health;
mod local_store;
mod locations;
mod models;
mod saved;
mod store;
mod sync;

use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::OnceCell;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use crate::auth::{
    AuthGate, AuthState, AuthStatus, FirebaseIdentityClient, Identity, IdentityProvider, Screen,
};
pub use crate::config::{AppConfig, CredentialBackend, PublicAppConfig};
pub use crate::credentials::{CredentialStore, SESSION_KEY};
pub use crate::directory::{filter as filter_countries, CountryDirectory};
pub use crate::errors::{AppError, AppResult};
pub use crate::firestore::FirestoreDocumentStore;
pub use crate::geocode::{
    GeocodeFailure, GeocodeOutcome, GeocodeResolver, Geocoder, GoogleGeocoder, MapFocus,
    ResolveState,
};
pub use crate::health::ContextHealth;
pub use crate::local_store::LocalStore;
pub use crate::locations::LocationBook;
pub use crate::models::{
    clamp_rating, Coordinates, CountryRecord, FromDocument, LocationRecord, MapRegion,
    NewLocation, SavedCountryRecord, Session, LOCATIONS_COLLECTION, NO_CAPITAL,
    SAVED_COUNTRIES_COLLECTION,
};
pub use crate::saved::{DirectoryEntry, SavedSetReconciler};
pub use crate::store::{
    DocumentStore, FieldQuery, MemoryDocumentStore, SnapshotStream, StoredDocument,
};
pub use crate::sync::{LiveCollectionSync, LiveSnapshot, SubscriptionHandle};

/// Everything one signed-in (or signing-in) app instance needs, wired once.
pub struct AppContext {
    config: AppConfig,
    gate: Arc<AuthGate>,
    sync: LiveCollectionSync,
    saved: SavedSetReconciler,
    locations: LocationBook,
    directory: CountryDirectory,
    resolver: Arc<GeocodeResolver>,
}

impl AppContext {
    pub fn from_env() -> AppResult<Self> {
        Self::from_config(AppConfig::from_env())
    }

    pub fn from_config(config: AppConfig) -> AppResult<Self> {
        init_tracing();
        let credentials = CredentialStore::new(LocalStore::from_config(&config));
        let identity: Arc<dyn IdentityProvider> = Arc::new(FirebaseIdentityClient::new(&config)?);
        let store: Arc<dyn DocumentStore> = if config.firebase_project_id.is_some() {
            Arc::new(FirestoreDocumentStore::new(&config, credentials.clone())?)
        } else {
            warn!("FIREBASE_PROJECT_ID not set; documents are kept in memory only");
            Arc::new(MemoryDocumentStore::new())
        };
        let geocoder: Arc<dyn Geocoder> = Arc::new(GoogleGeocoder::new(&config)?);
        Self::with_collaborators(config, credentials, identity, store, geocoder)
    }

    pub fn with_collaborators(
        config: AppConfig,
        credentials: CredentialStore,
        identity: Arc<dyn IdentityProvider>,
        store: Arc<dyn DocumentStore>,
        geocoder: Arc<dyn Geocoder>,
    ) -> AppResult<Self> {
        let gate = Arc::new(AuthGate::new(credentials, identity));
        let directory = CountryDirectory::new(&config)?;
        let resolver = Arc::new(GeocodeResolver::new(geocoder, config.default_region));
        info!(
            backend = config.credential_backend.as_str(),
            remote = config.firebase_project_id.is_some(),
            "app context ready"
        );
        Ok(Self {
            sync: LiveCollectionSync::new(Arc::clone(&store))
                .with_session_gate(Arc::clone(&gate)),
            saved: SavedSetReconciler::new(Arc::clone(&gate), Arc::clone(&store)),
            locations: LocationBook::new(Arc::clone(&gate), store),
            gate,
            directory,
            resolver,
            config,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn auth(&self) -> &AuthGate {
        &self.gate
    }

    pub fn saved(&self) -> &SavedSetReconciler {
        &self.saved
    }

    pub fn locations(&self) -> &LocationBook {
        &self.locations
    }

    pub fn directory(&self) -> &CountryDirectory {
        &self.directory
    }

    pub fn sync(&self) -> &LiveCollectionSync {
        &self.sync
    }

    /// Cold start: settles the session check and returns the first screen.
    pub async fn start(&self) -> AppResult<Screen> {
        self.gate.check_session().await?;
        Ok(self.gate.state().initial_screen())
    }

    pub async fn login(&self, email: &str, password: &str) -> AppResult<Session> {
        self.gate.login(email, password).await
    }

    /// Signs out and tears down everything scoped to the session.
    pub async fn logout(&self) -> AppResult<()> {
        let result = self.gate.logout().await;
        self.sync.cancel_all();
        self.saved.clear();
        result
    }

    pub async fn subscribe_locations<F>(&self, on_snapshot: F) -> AppResult<SubscriptionHandle>
    where
        F: Fn(LiveSnapshot<LocationRecord>) + Send + Sync + 'static,
    {
        let owner_id = self.gate.require_owner().await?;
        self.sync
            .subscribe::<LocationRecord, F>(&owner_id, LOCATIONS_COLLECTION, on_snapshot)
            .await
    }

    pub async fn subscribe_saved_countries<F>(
        &self,
        on_snapshot: F,
    ) -> AppResult<SubscriptionHandle>
    where
        F: Fn(LiveSnapshot<SavedCountryRecord>) + Send + Sync + 'static,
    {
        let owner_id = self.gate.require_owner().await?;
        self.sync
            .subscribe::<SavedCountryRecord, F>(&owner_id, SAVED_COUNTRIES_COLLECTION, on_snapshot)
            .await
    }

    /// Directory search with each hit flagged against the saved mirror.
    pub async fn search_countries(&self, query: &str) -> Vec<DirectoryEntry> {
        let hits = self.directory.search(query).await;
        self.saved.annotate(&hits)
    }

    pub fn map_focus(&self) -> MapFocus {
        MapFocus::new(Arc::clone(&self.resolver))
    }

    pub async fn health(&self) -> AppResult<ContextHealth> {
        let has_stored_session = self.gate.credentials().read().await?.is_some();
        Ok(ContextHealth::new(
            self.config.public_profile(),
            self.gate.state().as_str(),
            has_stored_session,
            self.sync.active_count(),
            self.saved.mirror().len(),
        ))
    }
}

pub(crate) fn build_http_client(timeout_secs: u64) -> AppResult<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
        .timeout(Duration::from_secs(timeout_secs))
        .build()?)
}

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,mylocation_lib=debug"));
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init();
    });
}

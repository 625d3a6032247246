use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::auth::AuthGate;
use crate::errors::{AppError, AppResult};
use crate::models::{
    CountryRecord, FromDocument, SavedCountryRecord, SAVED_COUNTRIES_COLLECTION,
};
use crate::store::{DocumentStore, FieldQuery};

/// Directory row annotated with whether the current user already saved it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DirectoryEntry {
    pub country: CountryRecord,
    pub saved: bool,
}

#[derive(Default)]
struct MirrorState {
    owner_id: Option<String>,
    // Set once the mirror holds the remote truth for `owner_id`.
    loaded: bool,
    saved: Vec<SavedCountryRecord>,
    // Names whose create is awaiting remote confirmation.
    pending: HashSet<String>,
}

impl MirrorState {
    fn adopt_owner(&mut self, owner_id: &str) {
        if self.owner_id.as_deref() != Some(owner_id) {
            self.saved.clear();
            self.pending.clear();
            self.loaded = false;
            self.owner_id = Some(owner_id.to_string());
        }
    }

    fn is_loaded_for(&self, owner_id: &str) -> bool {
        self.loaded && self.owner_id.as_deref() == Some(owner_id)
    }

    fn contains_name(&self, common_name: &str) -> bool {
        self.saved.iter().any(|record| record.common_name == common_name)
    }
}

/// Current user's saved countries, kept in step with the remote store.
///
/// Duplicate detection compares `common_name` exactly. Two countries sharing
/// a display name would collide; the directory code is not used as the key.
pub struct SavedSetReconciler {
    gate: Arc<AuthGate>,
    store: Arc<dyn DocumentStore>,
    state: Mutex<MirrorState>,
}

impl SavedSetReconciler {
    pub fn new(gate: Arc<AuthGate>, store: Arc<dyn DocumentStore>) -> Self {
        Self {
            gate,
            store,
            state: Mutex::new(MirrorState::default()),
        }
    }

    /// One-shot reload of the mirror from the remote store.
    pub async fn refresh(&self) -> AppResult<Vec<SavedCountryRecord>> {
        let owner_id = self.gate.require_owner().await?;
        let documents = match self
            .store
            .query(&FieldQuery::owned_by(SAVED_COUNTRIES_COLLECTION, &owner_id))
            .await
        {
            Ok(documents) => documents,
            Err(err) => return Err(self.settle_remote_error(err).await),
        };

        let records: Vec<SavedCountryRecord> = documents
            .iter()
            .filter_map(|document| match SavedCountryRecord::from_document(document) {
                Ok(record) => Some(record),
                Err(err) => {
                    warn!(target: "saved_set", id = %document.id, error = %err, "skipping saved country");
                    None
                }
            })
            .collect();

        let mut state = self.state.lock();
        state.adopt_owner(&owner_id);
        state.saved = records.clone();
        state.loaded = true;
        debug!(target: "saved_set", owner_id, count = records.len(), "saved set refreshed");
        Ok(records)
    }

    /// Saves `country` unless the user already has it. The mirror is loaded
    /// from the remote store first if this session has not done so yet.
    pub async fn add(&self, country: &CountryRecord) -> AppResult<SavedCountryRecord> {
        let owner_id = self.gate.require_owner().await?;
        self.ensure_loaded(&owner_id).await?;
        let name = country.common_name.clone();
        {
            let mut state = self.state.lock();
            state.adopt_owner(&owner_id);
            if state.contains_name(&name) || !state.pending.insert(name.clone()) {
                debug!(target: "saved_set", name, "duplicate save rejected");
                return Err(AppError::DuplicateSave(name));
            }
        }

        let created = self
            .store
            .create(
                SAVED_COUNTRIES_COLLECTION,
                SavedCountryRecord::fields_for(country, &owner_id),
            )
            .await
            .and_then(|document| SavedCountryRecord::from_document(&document));

        let outcome = {
            let mut state = self.state.lock();
            state.pending.remove(&name);
            match created {
                Ok(record) => {
                    if state.owner_id.as_deref() == Some(owner_id.as_str())
                        && !state.saved.iter().any(|saved| saved.id == record.id)
                    {
                        state.saved.push(record.clone());
                    }
                    Ok(record)
                }
                Err(err) => Err(err),
            }
        };

        match outcome {
            Ok(record) => {
                info!(target: "saved_set", name, id = %record.id, "country saved");
                Ok(record)
            }
            Err(err) => Err(self.settle_remote_error(err).await),
        }
    }

    pub async fn remove(&self, saved_id: &str) -> AppResult<SavedCountryRecord> {
        let owner_id = self.gate.require_owner().await?;
        self.ensure_loaded(&owner_id).await?;
        {
            let mut state = self.state.lock();
            state.adopt_owner(&owner_id);
            if !state.saved.iter().any(|record| record.id == saved_id) {
                return Err(AppError::NotFound(saved_id.to_string()));
            }
        }

        match self.store.delete(SAVED_COUNTRIES_COLLECTION, saved_id).await {
            Ok(()) => {
                let removed = self.take_from_mirror(saved_id);
                info!(target: "saved_set", id = saved_id, "saved country removed");
                removed.ok_or_else(|| AppError::NotFound(saved_id.to_string()))
            }
            Err(AppError::NotFound(id)) => {
                // Already gone remotely; the mirror entry was stale.
                self.take_from_mirror(saved_id);
                Err(AppError::NotFound(id))
            }
            Err(err) => Err(self.settle_remote_error(err).await),
        }
    }

    pub fn mirror(&self) -> Vec<SavedCountryRecord> {
        self.state.lock().saved.clone()
    }

    pub fn is_saved(&self, common_name: &str) -> bool {
        self.state.lock().contains_name(common_name)
    }

    pub fn annotate(&self, countries: &[CountryRecord]) -> Vec<DirectoryEntry> {
        let state = self.state.lock();
        countries
            .iter()
            .map(|country| DirectoryEntry {
                saved: state.contains_name(&country.common_name),
                country: country.clone(),
            })
            .collect()
    }

    pub fn clear(&self) {
        *self.state.lock() = MirrorState::default();
    }

    async fn ensure_loaded(&self, owner_id: &str) -> AppResult<()> {
        if self.state.lock().is_loaded_for(owner_id) {
            return Ok(());
        }
        self.refresh().await.map(|_| ())
    }

    fn take_from_mirror(&self, saved_id: &str) -> Option<SavedCountryRecord> {
        let mut state = self.state.lock();
        let position = state.saved.iter().position(|record| record.id == saved_id)?;
        Some(state.saved.remove(position))
    }

    async fn settle_remote_error(&self, err: AppError) -> AppError {
        if matches!(err, AppError::Unauthenticated) {
            warn!(target: "saved_set", "remote store rejected the session");
            self.gate.expire().await;
        } else {
            warn!(target: "saved_set", error = %err, "remote store request failed");
        }
        err
    }
}

use std::sync::Arc;

use tracing::{info, warn};

use crate::auth::AuthGate;
use crate::errors::{AppError, AppResult};
use crate::models::{FromDocument, LocationRecord, NewLocation, LOCATIONS_COLLECTION};
use crate::store::DocumentStore;

/// Writes the signed-in user's locations. Reads arrive through live sync.
#[derive(Clone)]
pub struct LocationBook {
    gate: Arc<AuthGate>,
    store: Arc<dyn DocumentStore>,
}

impl LocationBook {
    pub fn new(gate: Arc<AuthGate>, store: Arc<dyn DocumentStore>) -> Self {
        Self { gate, store }
    }

    pub async fn add(&self, location: NewLocation) -> AppResult<LocationRecord> {
        let owner_id = self.gate.require_owner().await?;
        location.validate()?;

        let created = self
            .store
            .create(LOCATIONS_COLLECTION, location.to_fields(&owner_id))
            .await;
        match created.and_then(|document| LocationRecord::from_document(&document)) {
            Ok(record) => {
                info!(
                    target: "document_store",
                    id = %record.id,
                    rating = record.rating,
                    "location added"
                );
                Ok(record)
            }
            Err(AppError::Unauthenticated) => {
                warn!(target: "document_store", "location write rejected; session expired");
                self.gate.expire().await;
                Err(AppError::Unauthenticated)
            }
            Err(err) => Err(err),
        }
    }
}

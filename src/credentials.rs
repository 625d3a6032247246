use tracing::{debug, info, warn};

use crate::errors::AppResult;
use crate::local_store::LocalStore;
use crate::models::Session;

pub const SESSION_KEY: &str = "userSession";

/// Sole owner of the persisted session.
#[derive(Clone)]
pub struct CredentialStore {
    store: LocalStore,
}

impl CredentialStore {
    pub fn new(store: LocalStore) -> Self {
        Self { store }
    }

    pub async fn save(&self, session: &Session) -> AppResult<()> {
        let payload = serde_json::to_string(session)?;
        self.store.set(SESSION_KEY, &payload).await?;
        info!(
            target: "credential_store",
            user_id = %session.user_id,
            "session persisted"
        );
        Ok(())
    }

    pub async fn read(&self) -> AppResult<Option<Session>> {
        let Some(payload) = self.store.get(SESSION_KEY).await? else {
            debug!(target: "credential_store", "no stored session");
            return Ok(None);
        };
        match serde_json::from_str::<Session>(&payload) {
            Ok(session) => Ok(Some(session)),
            Err(err) => {
                warn!(
                    target: "credential_store",
                    error = %err,
                    "stored session is unreadable; treating as signed out"
                );
                Ok(None)
            }
        }
    }

    pub async fn clear(&self) -> AppResult<()> {
        self.store.remove(SESSION_KEY).await?;
        debug!(target: "credential_store", "session cleared");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fresh_install_reads_absent() {
        let credentials = CredentialStore::new(LocalStore::in_memory());
        assert!(credentials.read().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn saves_reads_and_clears_session() {
        let credentials = CredentialStore::new(LocalStore::in_memory());
        let session = Session::new("token-1", "u1");
        credentials.save(&session).await.unwrap();
        assert_eq!(credentials.read().await.unwrap(), Some(session));

        credentials.clear().await.unwrap();
        assert!(credentials.read().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn garbage_payload_reads_as_absent() {
        let store = LocalStore::in_memory();
        store.set(SESSION_KEY, "uid-from-older-build").await.unwrap();
        let credentials = CredentialStore::new(store);
        assert!(credentials.read().await.unwrap().is_none());
    }
}

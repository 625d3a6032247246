use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::{AppConfig, CredentialBackend};
use crate::errors::{AppError, AppResult};

/// String key-value storage that survives process restarts.
#[derive(Clone)]
pub struct LocalStore {
    service_name: String,
    backend: LocalBackend,
}

#[derive(Clone)]
enum LocalBackend {
    Keyring,
    File(Arc<Mutex<PathBuf>>),
    Memory(Arc<Mutex<HashMap<String, String>>>),
}

impl LocalStore {
    pub fn keyring(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            backend: LocalBackend::Keyring,
        }
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            service_name: path.display().to_string(),
            backend: LocalBackend::File(Arc::new(Mutex::new(path))),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            service_name: "in-memory".to_string(),
            backend: LocalBackend::Memory(Arc::new(Mutex::new(HashMap::new()))),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        match config.credential_backend {
            CredentialBackend::Keyring => Self::keyring(config.keyring_service.clone()),
            CredentialBackend::File => Self::file(config.credential_file.clone()),
            CredentialBackend::Memory => Self::in_memory(),
        }
    }

    pub async fn set(&self, key: &str, value: &str) -> AppResult<()> {
        let (store, key_owned, value) = (self.clone(), key.to_string(), value.to_string());
        run_blocking(move || store.set_blocking(&key_owned, &value)).await?;
        debug!(
            target: "credential_store",
            service = %self.service_name,
            key,
            "stored value in local backend"
        );
        Ok(())
    }

    pub async fn get(&self, key: &str) -> AppResult<Option<String>> {
        let (store, key) = (self.clone(), key.to_string());
        run_blocking(move || store.get_blocking(&key)).await
    }

    pub async fn remove(&self, key: &str) -> AppResult<()> {
        let (store, key) = (self.clone(), key.to_string());
        run_blocking(move || store.remove_blocking(&key)).await
    }

    fn set_blocking(&self, key: &str, value: &str) -> AppResult<()> {
        match &self.backend {
            LocalBackend::Keyring => {
                let entry = keyring::Entry::new(&self.service_name, key).map_err(storage_error)?;
                entry.set_password(value).map_err(storage_error)?;
            }
            LocalBackend::File(path) => {
                let path = path.lock();
                let mut values = read_file_map(&path)?;
                values.insert(key.to_string(), value.to_string());
                write_file_map(&path, &values)?;
            }
            LocalBackend::Memory(store) => {
                store.lock().insert(key.to_string(), value.to_string());
            }
        }
        Ok(())
    }

    fn get_blocking(&self, key: &str) -> AppResult<Option<String>> {
        match &self.backend {
            LocalBackend::Keyring => {
                let entry = keyring::Entry::new(&self.service_name, key).map_err(storage_error)?;
                match entry.get_password() {
                    Ok(value) => Ok(Some(value)),
                    Err(keyring::Error::NoEntry) => Ok(None),
                    Err(err) => Err(storage_error(err)),
                }
            }
            LocalBackend::File(path) => {
                let path = path.lock();
                Ok(read_file_map(&path)?.remove(key))
            }
            LocalBackend::Memory(store) => Ok(store.lock().get(key).cloned()),
        }
    }

    fn remove_blocking(&self, key: &str) -> AppResult<()> {
        match &self.backend {
            LocalBackend::Keyring => {
                let entry = keyring::Entry::new(&self.service_name, key).map_err(storage_error)?;
                match entry.delete_password() {
                    Ok(()) | Err(keyring::Error::NoEntry) => {}
                    Err(err) => return Err(storage_error(err)),
                }
            }
            LocalBackend::File(path) => {
                let path = path.lock();
                let mut values = read_file_map(&path)?;
                if values.remove(key).is_some() {
                    write_file_map(&path, &values)?;
                }
            }
            LocalBackend::Memory(store) => {
                store.lock().remove(key);
            }
        }
        Ok(())
    }
}

/// Keyring and file access block, so they run off the async workers.
async fn run_blocking<T, F>(work: F) -> AppResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> AppResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(storage_error)?
}

fn read_file_map(path: &Path) -> AppResult<HashMap<String, String>> {
    match fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<HashMap<String, String>>(&contents) {
            Ok(values) => Ok(values),
            Err(err) => {
                warn!(
                    target: "credential_store",
                    path = %path.display(),
                    error = ?err,
                    "local store file is unreadable; treating it as empty"
                );
                Ok(HashMap::new())
            }
        },
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(HashMap::new()),
        Err(err) => Err(storage_error(err)),
    }
}

fn write_file_map(path: &Path, values: &HashMap<String, String>) -> AppResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(storage_error)?;
        }
    }
    let serialized = serde_json::to_string_pretty(values)?;
    fs::write(path, serialized).map_err(storage_error)
}

fn storage_error(err: impl std::fmt::Display) -> AppError {
    AppError::StorageUnavailable(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn memory_backend_round_trips_values() {
        let store = LocalStore::in_memory();
        assert_eq!(store.get("userSession").await.unwrap(), None);
        store.set("userSession", "abc").await.unwrap();
        assert_eq!(store.get("userSession").await.unwrap().as_deref(), Some("abc"));
        store.remove("userSession").await.unwrap();
        store.remove("userSession").await.unwrap();
        assert_eq!(store.get("userSession").await.unwrap(), None);
    }

    #[tokio::test]
    async fn file_backend_survives_new_instances() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("session.json");
        {
            let store = LocalStore::file(&path);
            store.set("userSession", "persisted").await.unwrap();
        }
        let reopened = LocalStore::file(&path);
        assert_eq!(
            reopened.get("userSession").await.unwrap().as_deref(),
            Some("persisted")
        );
    }

    #[tokio::test]
    async fn file_backend_reports_unwritable_location() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, "not a directory").unwrap();
        let store = LocalStore::file(blocker.join("session.json"));

        let err = store.set("userSession", "x").await.unwrap_err();
        assert!(matches!(err, AppError::StorageUnavailable(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_file_writes_keep_every_key() {
        let dir = tempdir().unwrap();
        let store = LocalStore::file(dir.path().join("session.json"));
        let writes = (0..8).map(|n| {
            let store = store.clone();
            tokio::spawn(async move { store.set(&format!("key-{n}"), "v").await })
        });
        for write in writes.collect::<Vec<_>>() {
            write.await.unwrap().unwrap();
        }
        for n in 0..8 {
            assert_eq!(
                store.get(&format!("key-{n}")).await.unwrap().as_deref(),
                Some("v")
            );
        }
    }

    #[tokio::test]
    async fn file_backend_fresh_install_reads_absent() {
        let dir = tempdir().unwrap();
        let store = LocalStore::file(dir.path().join("missing.json"));
        assert_eq!(store.get("userSession").await.unwrap(), None);
    }
}

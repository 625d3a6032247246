use std::path::PathBuf;
use std::{env, io};

use secrecy::SecretString;
use serde::Serialize;
use tracing::debug;

use crate::models::Coordinates;

pub const DEFAULT_DIRECTORY_ENDPOINT: &str = "https://restcountries.com/v3.1/all";
pub const DEFAULT_GEOCODE_ENDPOINT: &str = "https://maps.googleapis.com/maps/api/geocode/json";
pub const DEFAULT_IDENTITY_ENDPOINT: &str =
    "https://identitytoolkit.googleapis.com/v1/accounts:signInWithPassword";
pub const DEFAULT_FIRESTORE_API_BASE: &str = "https://firestore.googleapis.com/v1";
pub const DEFAULT_KEYRING_SERVICE: &str = "MyLocationApp";

const DEFAULT_REGION_LAT: f64 = 37.78825;
const DEFAULT_REGION_LNG: f64 = -122.4324;
const DEFAULT_SYNC_POLL_INTERVAL_MS: u64 = 2_000;
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialBackend {
    Keyring,
    File,
    Memory,
}

impl CredentialBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialBackend::Keyring => "keyring",
            CredentialBackend::File => "file",
            CredentialBackend::Memory => "memory",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "keyring" => Some(CredentialBackend::Keyring),
            "file" => Some(CredentialBackend::File),
            "memory" => Some(CredentialBackend::Memory),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub firebase_api_key: Option<SecretString>,
    pub firebase_project_id: Option<String>,
    pub identity_endpoint: String,
    pub firestore_api_base: String,
    pub google_maps_api_key: Option<SecretString>,
    pub geocode_endpoint: String,
    pub directory_endpoint: String,
    pub default_region: Coordinates,
    pub sync_poll_interval_ms: u64,
    pub http_timeout_secs: u64,
    pub credential_backend: CredentialBackend,
    pub credential_file: PathBuf,
    pub keyring_service: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub firebase_project_id: Option<String>,
    pub identity_endpoint: String,
    pub firestore_api_base: String,
    pub geocode_endpoint: String,
    pub directory_endpoint: String,
    pub default_region: Coordinates,
    pub sync_poll_interval_ms: u64,
    pub http_timeout_secs: u64,
    pub credential_backend: CredentialBackend,
    pub has_firebase_api_key: bool,
    pub has_google_maps_api_key: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            firebase_api_key: None,
            firebase_project_id: None,
            identity_endpoint: DEFAULT_IDENTITY_ENDPOINT.to_string(),
            firestore_api_base: DEFAULT_FIRESTORE_API_BASE.to_string(),
            google_maps_api_key: None,
            geocode_endpoint: DEFAULT_GEOCODE_ENDPOINT.to_string(),
            directory_endpoint: DEFAULT_DIRECTORY_ENDPOINT.to_string(),
            default_region: Coordinates::new(DEFAULT_REGION_LAT, DEFAULT_REGION_LNG),
            sync_poll_interval_ms: DEFAULT_SYNC_POLL_INTERVAL_MS,
            http_timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
            credential_backend: CredentialBackend::Keyring,
            credential_file: PathBuf::from("mylocation-session.json"),
            keyring_service: DEFAULT_KEYRING_SERVICE.to_string(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        let defaults = Self::default();
        Self {
            firebase_api_key: parse_secret("FIREBASE_API_KEY"),
            firebase_project_id: env::var("FIREBASE_PROJECT_ID")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            identity_endpoint: env::var("IDENTITY_ENDPOINT").unwrap_or(defaults.identity_endpoint),
            firestore_api_base: env::var("FIRESTORE_API_BASE")
                .unwrap_or(defaults.firestore_api_base),
            google_maps_api_key: parse_secret("GOOGLE_MAPS_API_KEY"),
            geocode_endpoint: env::var("GEOCODE_ENDPOINT").unwrap_or(defaults.geocode_endpoint),
            directory_endpoint: env::var("DIRECTORY_ENDPOINT")
                .unwrap_or(defaults.directory_endpoint),
            default_region: Coordinates::new(
                parse_f64("DEFAULT_REGION_LAT", DEFAULT_REGION_LAT),
                parse_f64("DEFAULT_REGION_LNG", DEFAULT_REGION_LNG),
            ),
            sync_poll_interval_ms: parse_u64(
                "SYNC_POLL_INTERVAL_MS",
                DEFAULT_SYNC_POLL_INTERVAL_MS,
            )
            .max(100),
            http_timeout_secs: parse_u64("HTTP_TIMEOUT_SECS", DEFAULT_HTTP_TIMEOUT_SECS).max(1),
            credential_backend: env::var("CREDENTIAL_BACKEND")
                .ok()
                .and_then(|v| CredentialBackend::parse(&v))
                .unwrap_or(defaults.credential_backend),
            credential_file: env::var("CREDENTIAL_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.credential_file),
            keyring_service: env::var("KEYRING_SERVICE").unwrap_or(defaults.keyring_service),
        }
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            firebase_project_id: self.firebase_project_id.clone(),
            identity_endpoint: self.identity_endpoint.clone(),
            firestore_api_base: self.firestore_api_base.clone(),
            geocode_endpoint: self.geocode_endpoint.clone(),
            directory_endpoint: self.directory_endpoint.clone(),
            default_region: self.default_region,
            sync_poll_interval_ms: self.sync_poll_interval_ms,
            http_timeout_secs: self.http_timeout_secs,
            credential_backend: self.credential_backend,
            has_firebase_api_key: self.firebase_api_key.is_some(),
            has_google_maps_api_key: self.google_maps_api_key.is_some(),
        }
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn parse_secret(key: &str) -> Option<SecretString> {
    env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(SecretString::from)
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_f64(key: &str, default: f64) -> f64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .unwrap_or(default)
}

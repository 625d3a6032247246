use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::build_http_client;
use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::models::{Coordinates, MapRegion};

#[async_trait]
pub trait Geocoder: Send + Sync {
    /// All candidate coordinates for a place name, best match first.
    async fn lookup(&self, place_name: &str) -> AppResult<Vec<Coordinates>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GeocodeFailure {
    NotFound,
    LookupError,
}

impl GeocodeFailure {
    pub fn reason(&self) -> &'static str {
        match self {
            GeocodeFailure::NotFound => "not found",
            GeocodeFailure::LookupError => "lookup error",
        }
    }

    pub fn into_error(self) -> AppError {
        match self {
            GeocodeFailure::NotFound => AppError::GeocodeNotFound,
            GeocodeFailure::LookupError => AppError::GeocodeLookup(self.reason().to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum GeocodeOutcome {
    Resolved(Coordinates),
    Failed(GeocodeFailure),
    /// No place was given; the configured default applies.
    Fallback(Coordinates),
}

impl GeocodeOutcome {
    pub fn coordinates(&self) -> Option<Coordinates> {
        match self {
            GeocodeOutcome::Resolved(coords) | GeocodeOutcome::Fallback(coords) => Some(*coords),
            GeocodeOutcome::Failed(_) => None,
        }
    }
}

/// Single-attempt, uncached place name resolution.
pub struct GeocodeResolver {
    geocoder: Arc<dyn Geocoder>,
    default_point: Coordinates,
}

impl GeocodeResolver {
    pub fn new(geocoder: Arc<dyn Geocoder>, default_point: Coordinates) -> Self {
        Self {
            geocoder,
            default_point,
        }
    }

    pub fn default_point(&self) -> Coordinates {
        self.default_point
    }

    pub async fn resolve(&self, place_name: Option<&str>) -> GeocodeOutcome {
        let Some(place) = place_name.filter(|name| !name.is_empty()) else {
            debug!(target: "geocode", "no place given; using default point");
            return GeocodeOutcome::Fallback(self.default_point);
        };

        match self.geocoder.lookup(place).await {
            Ok(candidates) => match candidates.first() {
                Some(coords) => {
                    trace!(target: "geocode", place, ?coords, "place resolved");
                    GeocodeOutcome::Resolved(*coords)
                }
                None => {
                    debug!(target: "geocode", place, "geocoder returned no results");
                    GeocodeOutcome::Failed(GeocodeFailure::NotFound)
                }
            },
            Err(err) => {
                warn!(target: "geocode", place, error = %err, "geocoding lookup failed");
                GeocodeOutcome::Failed(GeocodeFailure::LookupError)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum ResolveState {
    Idle,
    Resolving,
    Resolved,
    Failed(GeocodeFailure),
    Fallback,
}

#[derive(Debug, Clone, Copy)]
struct FocusView {
    region: MapRegion,
    state: ResolveState,
}

/// Region shown by one map context; newer lookups win over older ones.
pub struct MapFocus {
    resolver: Arc<GeocodeResolver>,
    generation: AtomicU64,
    view: Mutex<FocusView>,
}

impl MapFocus {
    pub fn new(resolver: Arc<GeocodeResolver>) -> Self {
        let region = MapRegion::default_around(resolver.default_point());
        Self {
            resolver,
            generation: AtomicU64::new(0),
            view: Mutex::new(FocusView {
                region,
                state: ResolveState::Idle,
            }),
        }
    }

    pub fn region(&self) -> MapRegion {
        self.view.lock().region
    }

    pub fn state(&self) -> ResolveState {
        self.view.lock().state
    }

    /// The error behind a `Failed` state, for surfacing to the user.
    pub fn error(&self) -> Option<AppError> {
        match self.state() {
            ResolveState::Failed(failure) => Some(failure.into_error()),
            _ => None,
        }
    }

    /// Returns the applied region, or `None` when a newer focus superseded this one.
    pub async fn focus(&self, place_name: Option<&str>) -> Option<MapRegion> {
        let ticket = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.view.lock().state = ResolveState::Resolving;

        let outcome = self.resolver.resolve(place_name).await;

        let mut view = self.view.lock();
        if self.generation.load(Ordering::SeqCst) != ticket {
            trace!(target: "geocode", ticket, "discarding superseded lookup");
            return None;
        }
        match outcome {
            GeocodeOutcome::Resolved(coords) => {
                view.region = MapRegion::focused_on(coords);
                view.state = ResolveState::Resolved;
            }
            GeocodeOutcome::Fallback(coords) => {
                view.region = MapRegion::default_around(coords);
                view.state = ResolveState::Fallback;
            }
            GeocodeOutcome::Failed(failure) => {
                view.state = ResolveState::Failed(failure);
            }
        }
        Some(view.region)
    }
}

/// Google Geocoding API client.
pub struct GoogleGeocoder {
    http: reqwest::Client,
    endpoint: String,
    api_key: SecretString,
}

impl GoogleGeocoder {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        let api_key = config
            .google_maps_api_key
            .clone()
            .ok_or_else(|| AppError::Config("GOOGLE_MAPS_API_KEY is not set".into()))?;
        Ok(Self {
            http: build_http_client(config.http_timeout_secs)?,
            endpoint: config.geocode_endpoint.clone(),
            api_key,
        })
    }
}

#[async_trait]
impl Geocoder for GoogleGeocoder {
    async fn lookup(&self, place_name: &str) -> AppResult<Vec<Coordinates>> {
        #[derive(Deserialize)]
        struct Response {
            status: String,
            #[serde(default)]
            results: Vec<ResponseResult>,
            error_message: Option<String>,
        }

        #[derive(Deserialize)]
        struct ResponseResult {
            geometry: ResponseGeometry,
        }

        #[derive(Deserialize)]
        struct ResponseGeometry {
            location: ResponseLocation,
        }

        #[derive(Deserialize)]
        struct ResponseLocation {
            lat: f64,
            lng: f64,
        }

        let response = self
            .http
            .get(&self.endpoint)
            .query(&[("address", place_name), ("key", self.api_key.expose_secret())])
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|err| AppError::GeocodeLookup(err.to_string()))?;

        let parsed: Response = response
            .json()
            .await
            .map_err(|err| AppError::GeocodeLookup(err.to_string()))?;

        match parsed.status.as_str() {
            "OK" => Ok(parsed
                .results
                .into_iter()
                .map(|result| {
                    Coordinates::new(result.geometry.location.lat, result.geometry.location.lng)
                })
                .collect()),
            "ZERO_RESULTS" => Ok(Vec::new()),
            other => Err(AppError::GeocodeLookup(match parsed.error_message {
                Some(message) => format!("{other}: {message}"),
                None => other.to_string(),
            })),
        }
    }
}

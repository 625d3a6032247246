use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::errors::{AppError, AppResult};
use crate::store::StoredDocument;

pub const LOCATIONS_COLLECTION: &str = "locations";
pub const SAVED_COUNTRIES_COLLECTION: &str = "userCountries";
pub const OWNER_FIELD: &str = "userId";
pub const NO_CAPITAL: &str = "No capital";

pub const MIN_RATING: i64 = 1;
pub const MAX_RATING: i64 = 5;
pub const DEFAULT_RATING: i64 = 3;

/// Opaque proof of a successful sign-in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub token: String,
    pub user_id: String,
    pub established_at: DateTime<Utc>,
}

impl Session {
    pub fn new(token: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            user_id: user_id.into(),
            established_at: Utc::now(),
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.token.trim().is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    pub const fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }
}

/// Visible map window: a centre plus the span shown around it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MapRegion {
    pub center: Coordinates,
    pub latitude_delta: f64,
    pub longitude_delta: f64,
}

impl MapRegion {
    pub fn default_around(center: Coordinates) -> Self {
        Self {
            center,
            latitude_delta: 0.0922,
            longitude_delta: 0.0421,
        }
    }

    pub fn focused_on(center: Coordinates) -> Self {
        Self {
            center,
            latitude_delta: 0.05,
            longitude_delta: 0.05,
        }
    }
}

/// Decodes a typed record out of a remote document.
pub trait FromDocument: Sized {
    fn from_document(document: &StoredDocument) -> AppResult<Self>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocationRecord {
    pub id: String,
    pub name: String,
    pub description: String,
    pub rating: i64,
    pub owner_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewLocation {
    pub name: String,
    pub description: String,
    pub rating: i64,
}

impl NewLocation {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            rating: DEFAULT_RATING,
        }
    }

    pub fn with_rating(mut self, rating: i64) -> Self {
        self.rating = rating;
        self
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.name.trim().is_empty() || self.description.trim().is_empty() {
            return Err(AppError::InvalidInput("Please fill in all fields!".into()));
        }
        Ok(())
    }

    pub(crate) fn to_fields(&self, owner_id: &str) -> Map<String, Value> {
        let mut fields = Map::new();
        fields.insert("name".into(), json!(self.name.trim()));
        fields.insert("description".into(), json!(self.description.trim()));
        fields.insert("rating".into(), json!(clamp_rating(self.rating)));
        fields.insert(OWNER_FIELD.into(), json!(owner_id));
        fields
    }
}

impl FromDocument for LocationRecord {
    fn from_document(document: &StoredDocument) -> AppResult<Self> {
        Ok(Self {
            id: document.id.clone(),
            name: document.string_field("name")?,
            description: document.optional_string_field("description").unwrap_or_default(),
            rating: clamp_rating(document.integer_field("rating").unwrap_or(DEFAULT_RATING)),
            owner_id: document.string_field(OWNER_FIELD)?,
        })
    }
}

pub fn clamp_rating(rating: i64) -> i64 {
    rating.clamp(MIN_RATING, MAX_RATING)
}

/// Read-only entry of the country directory.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CountryRecord {
    pub code: String,
    pub common_name: String,
    pub capital: Option<String>,
    pub flag_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SavedCountryRecord {
    pub id: String,
    pub owner_id: String,
    pub common_name: String,
    pub capital: String,
    pub flag_url: String,
}

impl SavedCountryRecord {
    pub(crate) fn fields_for(country: &CountryRecord, owner_id: &str) -> Map<String, Value> {
        let mut fields = Map::new();
        fields.insert(OWNER_FIELD.into(), json!(owner_id));
        fields.insert("name".into(), json!(country.common_name));
        fields.insert(
            "capital".into(),
            json!(country.capital.as_deref().unwrap_or(NO_CAPITAL)),
        );
        fields.insert("flag".into(), json!(country.flag_url));
        fields
    }
}

impl FromDocument for SavedCountryRecord {
    fn from_document(document: &StoredDocument) -> AppResult<Self> {
        Ok(Self {
            id: document.id.clone(),
            owner_id: document.string_field(OWNER_FIELD)?,
            common_name: document.string_field("name")?,
            capital: document
                .optional_string_field("capital")
                .unwrap_or_else(|| NO_CAPITAL.to_string()),
            flag_url: document.optional_string_field("flag").unwrap_or_default(),
        })
    }
}

use std::io;

use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("local storage unavailable: {0}")]
    StorageUnavailable(String),
    /// Identity provider message, kept verbatim.
    #[error("{0}")]
    Auth(String),
    #[error("no authenticated session")]
    Unauthenticated,
    #[error("country directory unavailable: {0}")]
    DirectoryUnavailable(String),
    #[error("place not found")]
    GeocodeNotFound,
    #[error("geocoding lookup failed: {0}")]
    GeocodeLookup(String),
    #[error("{0} is already saved")]
    DuplicateSave(String),
    #[error("saved item {0} not found")]
    NotFound(String),
    #[error("{0}")]
    InvalidInput(String),
    #[error("remote store request failed: {0}")]
    Remote(String),
    #[error("{0}")]
    Config(String),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl AppError {
    /// The single message shown to the user for this failure kind.
    pub fn user_message(&self) -> String {
        match self {
            AppError::StorageUnavailable(_) => {
                "Your sign-in could not be read or saved on this device.".into()
            }
            AppError::Auth(message) => message.clone(),
            AppError::Unauthenticated => "Please sign in to continue.".into(),
            AppError::DirectoryUnavailable(_) => "Countries could not be loaded right now.".into(),
            AppError::GeocodeNotFound => "That place could not be found on the map.".into(),
            AppError::GeocodeLookup(_) => "The map lookup failed. Showing the default region.".into(),
            AppError::DuplicateSave(name) => format!("{name} has already been added."),
            AppError::NotFound(_) => "That entry no longer exists.".into(),
            AppError::InvalidInput(message) => message.clone(),
            AppError::Remote(_) | AppError::Http(_) | AppError::Json(_) | AppError::Io(_) => {
                "Something went wrong talking to the server.".into()
            }
            AppError::Config(_) => "The app is not configured correctly.".into(),
        }
    }

    /// Business-rule rejections are informational, not faults.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            AppError::DuplicateSave(_) | AppError::NotFound(_) | AppError::InvalidInput(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_messages_pass_through_verbatim() {
        let err = AppError::Auth("INVALID_LOGIN_CREDENTIALS".into());
        assert_eq!(err.user_message(), "INVALID_LOGIN_CREDENTIALS");
        assert_eq!(err.to_string(), "INVALID_LOGIN_CREDENTIALS");
    }

    #[test]
    fn rejections_are_not_faults() {
        assert!(AppError::DuplicateSave("Italy".into()).is_rejection());
        assert!(AppError::NotFound("abc".into()).is_rejection());
        assert!(!AppError::Unauthenticated.is_rejection());
        assert_eq!(
            AppError::DuplicateSave("Italy".into()).user_message(),
            "Italy has already been added."
        );
    }
}

use std::sync::Arc;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::build_http_client;
use crate::credentials::CredentialStore;
use crate::models::Session;

/// Result of a successful sign-in at the identity provider.
#[derive(Clone, Debug)]
pub struct Identity {
    pub user_id: String,
    pub token: SecretString,
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn sign_in(&self, email: &str, password: &str) -> AppResult<Identity>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum AuthState {
    Checking,
    Authenticated(Session),
    Unauthenticated,
}

impl AuthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthState::Checking => "checking",
            AuthState::Authenticated(_) => "authenticated",
            AuthState::Unauthenticated => "unauthenticated",
        }
    }

    pub fn session(&self) -> Option<&Session> {
        match self {
            AuthState::Authenticated(session) => Some(session),
            _ => None,
        }
    }

    pub fn initial_screen(&self) -> Screen {
        match self {
            AuthState::Checking => Screen::Splash,
            AuthState::Authenticated(_) => Screen::Locations,
            AuthState::Unauthenticated => Screen::Login,
        }
    }

    pub fn can_reach(&self, screen: Screen) -> bool {
        match self {
            AuthState::Checking => screen == Screen::Splash,
            AuthState::Unauthenticated => screen == Screen::Login,
            AuthState::Authenticated(_) => screen != Screen::Splash,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Screen {
    Splash,
    Login,
    Locations,
    AddLocation,
    Map,
    Countries,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthStatus {
    pub authenticated: bool,
    pub user_id: Option<String>,
}

impl AuthStatus {
    fn from_state(state: &AuthState) -> Self {
        Self {
            authenticated: state.session().is_some(),
            user_id: state.session().map(|session| session.user_id.clone()),
        }
    }
}

/// Decides which part of the app is reachable, from locally stored credentials.
pub struct AuthGate {
    credentials: CredentialStore,
    identity: Arc<dyn IdentityProvider>,
    state: watch::Sender<AuthState>,
    transitions: AsyncMutex<()>,
}

impl AuthGate {
    pub fn new(credentials: CredentialStore, identity: Arc<dyn IdentityProvider>) -> Self {
        let (state, _) = watch::channel(AuthState::Checking);
        Self {
            credentials,
            identity,
            state,
            transitions: AsyncMutex::new(()),
        }
    }

    pub fn state(&self) -> AuthState {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<AuthState> {
        self.state.subscribe()
    }

    pub fn current_session(&self) -> Option<Session> {
        self.state.borrow().session().cloned()
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    /// Local check only: a stored non-empty token means authenticated.
    pub async fn check_session(&self) -> AppResult<AuthStatus> {
        let _guard = self.transitions.lock().await;
        match self.credentials.read().await {
            Ok(Some(session)) if session.is_valid() => {
                self.transition(AuthState::Authenticated(session));
            }
            Ok(_) => self.transition(AuthState::Unauthenticated),
            Err(err) => {
                warn!(target: "auth_gate", error = %err, "session check failed");
                self.transition(AuthState::Unauthenticated);
                return Err(err);
            }
        }
        Ok(AuthStatus::from_state(&self.state.borrow()))
    }

    pub async fn login(&self, email: &str, password: &str) -> AppResult<Session> {
        let _guard = self.transitions.lock().await;
        let identity = match self.identity.sign_in(email, password).await {
            Ok(identity) => identity,
            Err(err) => {
                self.settle_failed_login();
                return Err(match err {
                    AppError::Auth(message) => AppError::Auth(message),
                    other => AppError::Auth(other.to_string()),
                });
            }
        };

        let session = Session::new(identity.token.expose_secret(), identity.user_id);
        if let Err(err) = self.credentials.save(&session).await {
            self.settle_failed_login();
            return Err(err);
        }
        self.transition(AuthState::Authenticated(session.clone()));
        Ok(session)
    }

    /// Idempotent: a no-op when already signed out.
    pub async fn logout(&self) -> AppResult<()> {
        let _guard = self.transitions.lock().await;
        if matches!(*self.state.borrow(), AuthState::Unauthenticated) {
            return Ok(());
        }
        self.credentials.clear().await?;
        self.transition(AuthState::Unauthenticated);
        Ok(())
    }

    /// Drops a session the remote side has rejected.
    pub async fn expire(&self) {
        let _guard = self.transitions.lock().await;
        if let Err(err) = self.credentials.clear().await {
            warn!(target: "auth_gate", error = %err, "failed to clear rejected session");
        }
        self.transition(AuthState::Unauthenticated);
    }

    /// Resolves the owner id, finishing the session check first if it is pending.
    pub async fn require_owner(&self) -> AppResult<String> {
        if matches!(*self.state.borrow(), AuthState::Checking) {
            self.check_session().await?;
        }
        self.current_session()
            .map(|session| session.user_id)
            .ok_or(AppError::Unauthenticated)
    }

    fn settle_failed_login(&self) {
        if matches!(*self.state.borrow(), AuthState::Checking) {
            self.transition(AuthState::Unauthenticated);
        }
    }

    fn transition(&self, next: AuthState) {
        let previous = self.state.send_replace(next);
        let current = self.state.borrow();
        if previous.as_str() != current.as_str() {
            info!(
                target: "auth_gate",
                from = previous.as_str(),
                to = current.as_str(),
                "auth state changed"
            );
        }
    }
}

/// Email/password sign-in against the Firebase Identity Toolkit REST API.
pub struct FirebaseIdentityClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: SecretString,
}

impl FirebaseIdentityClient {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        let api_key = config
            .firebase_api_key
            .clone()
            .ok_or_else(|| AppError::Config("FIREBASE_API_KEY is not set".into()))?;
        Ok(Self {
            http: build_http_client(config.http_timeout_secs)?,
            endpoint: config.identity_endpoint.clone(),
            api_key,
        })
    }
}

#[async_trait]
impl IdentityProvider for FirebaseIdentityClient {
    async fn sign_in(&self, email: &str, password: &str) -> AppResult<Identity> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct SignInRequest<'a> {
            email: &'a str,
            password: &'a str,
            return_secure_token: bool,
        }

        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct SignInResponse {
            local_id: String,
            id_token: String,
        }

        #[derive(Deserialize)]
        struct ErrorEnvelope {
            error: ErrorBody,
        }

        #[derive(Deserialize)]
        struct ErrorBody {
            message: String,
        }

        let response = self
            .http
            .post(&self.endpoint)
            .query(&[("key", self.api_key.expose_secret())])
            .json(&SignInRequest {
                email,
                password,
                return_secure_token: true,
            })
            .send()
            .await
            .map_err(|err| AppError::Auth(err.to_string()))?;

        let status = response.status();
        if status.is_success() {
            let body: SignInResponse = response
                .json()
                .await
                .map_err(|err| AppError::Auth(err.to_string()))?;
            return Ok(Identity {
                user_id: body.local_id,
                token: SecretString::from(body.id_token),
            });
        }

        let message = match response.json::<ErrorEnvelope>().await {
            Ok(envelope) => envelope.error.message,
            Err(_) => format!("sign-in failed ({status})"),
        };
        Err(AppError::Auth(message))
    }
}

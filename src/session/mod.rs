//! OAuth2 session for the data API.
//!
//! Owns the access/refresh tokens and performs the password-limited grant,
//! refresh grants, and optional encrypted token persistence.
//!
//! Token fields live behind a single `RwLock` so readers never see a new
//! access token paired with an old expiry. Grants and refreshes are serialized
//! by an async mutex; a task that reacts to a 401 after another task already
//! replaced the rejected token does not refresh a second time.

use crate::config::AuthConfig;
use crate::credentials::{encryption, Credentials, TOKEN_CONTEXT};
use crate::Error;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

pub(crate) mod grant;

#[cfg(test)]
mod tests;

use grant::TokenResponse;

/// Token endpoint failures.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("token request failed: {0}")]
    Request(#[source] reqwest::Error),

    #[error("unexpected auth failure [{status}]: {body}")]
    Rejected { status: StatusCode, body: String },

    #[error("failed to decode token response: {0}")]
    InvalidResponse(#[source] reqwest::Error),

    #[error("token response carried an unusable expires_in: {0}")]
    InvalidExpiry(i64),

    #[error("token response carried an empty access token")]
    EmptyAccessToken,

    #[error("no refresh token available")]
    NoRefreshToken,
}

/// Where the encrypted token is kept between runs.
#[derive(Debug, Clone)]
pub struct TokenPersistence {
    pub key_path: PathBuf,
    pub token_path: PathBuf,
}

/// Persisted token record.
#[derive(Serialize, Deserialize)]
pub(crate) struct AuthToken {
    pub access_token: String,
    pub refresh_token: String,
    pub token_expiry: DateTime<Utc>,
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Default)]
struct Session {
    access_token: String,
    refresh_token: String,
    token_expiry: Option<DateTime<Utc>>,
    client_id: String,
    client_secret: String,
    authenticated: bool,
    /// Kept for password re-grants when a refresh is refused
    credentials: Option<Credentials>,
}

impl Session {
    fn expires_within(&self, horizon: chrono::Duration, now: DateTime<Utc>) -> bool {
        self.authenticated && self.token_expiry.map_or(false, |expiry| expiry - now <= horizon)
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.token_expiry.map_or(true, |expiry| expiry <= now)
    }
}

enum GrantKind {
    Password,
    Refresh,
}

/// Token lifecycle manager shared by every request of a client.
pub struct SessionManager {
    http: reqwest::Client,
    token_url: String,
    scope: String,
    config: AuthConfig,
    session: RwLock<Session>,
    persistence: RwLock<Option<TokenPersistence>>,
    grant_lock: tokio::sync::Mutex<()>,
}

impl SessionManager {
    pub fn new(http: reqwest::Client, token_url: String, scope: String, config: AuthConfig) -> Self {
        Self {
            http,
            token_url,
            scope,
            config,
            session: RwLock::new(Session::default()),
            persistence: RwLock::new(None),
            grant_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Session> {
        self.session.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Session> {
        self.session.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Enables (or disables) encrypted token persistence.
    pub fn set_persistence(&self, persistence: Option<TokenPersistence>) {
        *self.persistence.write().unwrap_or_else(|e| e.into_inner()) = persistence;
    }

    fn persistence(&self) -> Option<TokenPersistence> {
        self.persistence
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.read().authenticated
    }

    /// Current access token, if authenticated.
    pub fn bearer_token(&self) -> Option<String> {
        let session = self.read();
        (session.authenticated && !session.access_token.is_empty())
            .then(|| session.access_token.clone())
    }

    pub fn token_expiry(&self) -> Option<DateTime<Utc>> {
        self.read().token_expiry
    }

    /// Authenticates with `credentials` unless already authenticated.
    ///
    /// A persisted, unexpired token is adopted without contacting the token
    /// endpoint. Otherwise the password-limited grant is performed.
    pub async fn authenticate(&self, credentials: Credentials) -> Result<(), Error> {
        let _guard = self.grant_lock.lock().await;

        if self.is_authenticated() {
            return Ok(());
        }

        if self.adopt_persisted_token(&credentials).await {
            return Ok(());
        }

        if let Some(field) = credentials.missing_field() {
            return Err(Error::MissingCredentials(field));
        }

        self.password_grant(credentials).await?;
        Ok(())
    }

    /// Returns true when the session is usable after loading the token file.
    async fn adopt_persisted_token(&self, credentials: &Credentials) -> bool {
        let Some(persistence) = self.persistence() else {
            return false;
        };

        let token: AuthToken = match encryption::decrypt_from_file(
            &persistence.key_path,
            &persistence.token_path,
            TOKEN_CONTEXT,
        ) {
            Ok(token) => token,
            Err(e) => {
                debug!(error = %e, "No usable auth token file, proceeding with password auth");
                return false;
            }
        };

        info!("Loaded auth token from file");

        let now = Utc::now();
        let expiry = token.token_expiry;
        {
            let mut session = self.write();
            session.access_token = token.access_token;
            session.refresh_token = token.refresh_token;
            session.token_expiry = Some(expiry);
            session.client_id = token.client_id;
            session.client_secret = token.client_secret;
            session.authenticated = expiry > now && !session.access_token.is_empty();
            session.credentials = Some(credentials.clone());
        }

        if expiry <= now {
            info!("Loaded token is expired, refreshing");
            return match self.refresh_grant().await {
                Ok(()) => {
                    self.persist();
                    true
                }
                Err(e) => {
                    warn!(error = %e, "Failed to refresh loaded token, falling back to password auth");
                    false
                }
            };
        }

        if expiry - now <= self.config.refresh_horizon() {
            match self.refresh_grant().await {
                Ok(()) => self.persist(),
                Err(e) => warn!(error = %e, "Early refresh failed, using the still-valid loaded token"),
            }
        }

        self.is_authenticated()
    }

    /// Refreshes proactively when the token expires within the refresh horizon.
    ///
    /// A failed refresh is tolerated while the current token is still valid.
    pub async fn refresh_if_stale(&self) -> Result<(), AuthError> {
        let horizon = self.config.refresh_horizon();
        if !self.read().expires_within(horizon, Utc::now()) {
            return Ok(());
        }

        let _guard = self.grant_lock.lock().await;

        // Another task may have refreshed while we waited for the lock
        if !self.read().expires_within(horizon, Utc::now()) {
            return Ok(());
        }

        let result = self.refresh_grant().await;
        match result {
            Ok(()) => {
                self.persist();
                Ok(())
            }
            Err(e) => {
                let still_valid = !self.read().is_expired(Utc::now());
                if still_valid {
                    warn!(error = %e, "Proactive token refresh failed, continuing with current token");
                    return Ok(());
                }
                self.regrant_after(e).await
            }
        }
    }

    /// Refreshes after the server rejected `rejected_token` with a 401.
    ///
    /// Falls back to the password grant when the refresh is refused and the
    /// credentials are still held.
    pub async fn refresh_after_rejection(&self, rejected_token: Option<&str>) -> Result<(), AuthError> {
        let _guard = self.grant_lock.lock().await;

        if let Some(rejected) = rejected_token {
            if self.bearer_token().as_deref() != Some(rejected) {
                debug!("Token already replaced by another request");
                return Ok(());
            }
        }

        let result = self.refresh_grant().await;
        match result {
            Ok(()) => {
                self.persist();
                Ok(())
            }
            Err(e) => self.regrant_after(e).await,
        }
    }

    async fn regrant_after(&self, refresh_error: AuthError) -> Result<(), AuthError> {
        let credentials = self.read().credentials.clone();
        match credentials {
            Some(credentials) if credentials.missing_field().is_none() => {
                warn!(error = %refresh_error, "Token refresh failed, falling back to password auth");
                self.password_grant(credentials).await
            }
            _ => {
                self.write().authenticated = false;
                Err(refresh_error)
            }
        }
    }

    /// Password-limited grant. Caller holds the grant lock.
    async fn password_grant(&self, credentials: Credentials) -> Result<(), AuthError> {
        info!("Authenticating via OAuth2 password limited flow");

        let form = grant::password_form(&credentials, &self.scope);
        let response = grant::request_token(
            &self.http,
            &self.token_url,
            &form,
            self.config.grant_attempts,
            self.config.grant_backoff(),
        )
        .await?;

        let expiry = response.expiry(Utc::now())?;
        info!(scope = ?response.scope, expires_at = %expiry, "Login succeeded");

        {
            let mut session = self.write();
            session.client_id = credentials.client_id.clone();
            session.client_secret = credentials.client_secret.clone();
            session.credentials = Some(credentials);
            apply_grant(&mut session, response, expiry, GrantKind::Password);
        }

        self.persist();
        Ok(())
    }

    /// Refresh grant with the stored refresh token. Caller holds the grant lock.
    async fn refresh_grant(&self) -> Result<(), AuthError> {
        let form = {
            let session = self.read();
            if session.refresh_token.is_empty() {
                return Err(AuthError::NoRefreshToken);
            }
            grant::refresh_form(
                &session.client_id,
                &session.client_secret,
                &session.refresh_token,
            )
        };

        info!("Refreshing access token");

        let response = grant::request_token(
            &self.http,
            &self.token_url,
            &form,
            1,
            self.config.grant_backoff(),
        )
        .await?;

        let expiry = response.expiry(Utc::now())?;
        apply_grant(&mut self.write(), response, expiry, GrantKind::Refresh);

        info!("Token refresh successful");
        Ok(())
    }

    /// Writes the current token when persistence is configured.
    ///
    /// Failures are logged only; the in-memory session stays valid.
    fn persist(&self) {
        let Some(persistence) = self.persistence() else {
            return;
        };

        let token = {
            let session = self.read();
            let Some(token_expiry) = session.token_expiry else {
                return;
            };
            AuthToken {
                access_token: session.access_token.clone(),
                refresh_token: session.refresh_token.clone(),
                token_expiry,
                client_id: session.client_id.clone(),
                client_secret: session.client_secret.clone(),
            }
        };

        match encryption::encrypt_to_file(
            &persistence.key_path,
            &persistence.token_path,
            TOKEN_CONTEXT,
            &token,
        ) {
            Ok(()) => debug!(path = %persistence.token_path.display(), "Auth token written"),
            Err(e) => warn!(error = %e, "Failed to write auth token file"),
        }
    }
}

fn apply_grant(
    session: &mut Session,
    response: TokenResponse,
    expiry: DateTime<Utc>,
    kind: GrantKind,
) {
    session.access_token = response.access_token;
    session.token_expiry = Some(expiry);

    let refresh_token = response.refresh_token.filter(|t| !t.is_empty());
    match (kind, refresh_token) {
        (_, Some(refresh_token)) => session.refresh_token = refresh_token,
        (GrantKind::Password, None) => session.refresh_token.clear(),
        // The server did not rotate it; keep the one we have
        (GrantKind::Refresh, None) => {}
    }

    session.authenticated = true;
}

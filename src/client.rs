//! Fetch engine façade.
//!
//! A [`Client`] composes the session, rate limiter, transport, resolver and
//! optional cache. Share it between tasks behind an `Arc`; everything except
//! enabling the cache and closing takes `&self`.
//!
//! ```no_run
//! use irdata::Client;
//! use std::path::Path;
//! use std::time::Duration;
//!
//! # async fn run() -> irdata::Result<()> {
//! let mut client = Client::with_defaults()?;
//! client.enable_cache("/tmp/irdata-cache")?;
//! client
//!     .authenticate_from_file(Path::new("irdata.key"), Path::new("irdata.creds"))
//!     .await?;
//!
//! let seasons = client
//!     .get_with_cache("/data/season/list?season_year=2026&season_quarter=4", Duration::from_secs(3600))
//!     .await?;
//! println!("{}", String::from_utf8_lossy(&seasons));
//!
//! client.close()?;
//! # Ok(())
//! # }
//! ```

use crate::cache::{CacheConfig, CacheStore};
use crate::config::ClientConfig;
use crate::credentials::{self, encryption, Credentials, CredentialsProvider};
use crate::rate_limit::{RateLimitPolicy, RateLimitSnapshot, RateLimiter};
use crate::resolve::Resolver;
use crate::session::{SessionManager, TokenPersistence};
use crate::transport::{Auth, Transport};
use crate::Error;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

pub struct Client {
    base_url: Url,
    session: Arc<SessionManager>,
    limiter: Arc<RateLimiter>,
    transport: Arc<Transport>,
    resolver: Resolver,
    cache: Option<CacheStore>,
    cache_config: CacheConfig,
    token_path: RwLock<Option<PathBuf>>,
}

impl Client {
    pub fn new(config: ClientConfig) -> Result<Self, Error> {
        let base_url = Url::parse(&config.api.base_url).map_err(|e| {
            Error::Config(format!("invalid base url '{}': {}", config.api.base_url, e))
        })?;

        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = config.api.request_timeout() {
            builder = builder.timeout(timeout);
        }
        let http = builder
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;

        let session = Arc::new(SessionManager::new(
            http.clone(),
            config.api.token_url.clone(),
            config.api.scope.clone(),
            config.auth.clone(),
        ));
        let limiter = Arc::new(RateLimiter::new(
            config.rate_limit.policy,
            Duration::from_secs(config.rate_limit.fallback_wait_secs),
        ));
        let transport = Arc::new(Transport::new(
            http,
            Arc::clone(&session),
            Arc::clone(&limiter),
            &base_url,
            &config.api.api_domain,
            &config.retry,
        ));

        info!(
            base_url = %base_url,
            retries = config.retry.retries,
            policy = ?config.rate_limit.policy,
            "Client created"
        );

        Ok(Self {
            base_url,
            session,
            limiter,
            resolver: Resolver::new(Arc::clone(&transport)),
            transport,
            cache: None,
            cache_config: config.cache,
            token_path: RwLock::new(None),
        })
    }

    pub fn with_defaults() -> Result<Self, Error> {
        Self::new(ClientConfig::default())
    }

    /// Opens the cache in `dir`, replacing any cache enabled before.
    pub fn enable_cache(&mut self, dir: impl AsRef<Path>) -> Result<(), Error> {
        let store = CacheStore::open(dir, &self.cache_config)?;
        if let Some(previous) = self.cache.replace(store) {
            previous.close_fast()?;
        }
        Ok(())
    }

    pub fn set_retries(&self, retries: u32) {
        self.transport.set_retries(retries);
    }

    pub fn set_rate_limit_policy(&self, policy: RateLimitPolicy) {
        self.limiter.set_policy(policy);
    }

    pub fn rate_limit(&self) -> RateLimitSnapshot {
        self.limiter.snapshot()
    }

    /// Keeps the token encrypted at `path` between runs.
    ///
    /// Takes effect for authentication methods that are given a key file.
    pub fn persist_token(&self, path: impl Into<PathBuf>) {
        *self.token_path.write().unwrap_or_else(|e| e.into_inner()) = Some(path.into());
    }

    pub fn is_authenticated(&self) -> bool {
        self.session.is_authenticated()
    }

    pub fn token_expiry(&self) -> Option<DateTime<Utc>> {
        self.session.token_expiry()
    }

    fn use_key(&self, key_path: Option<&Path>) {
        let token_path = self
            .token_path
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        let persistence = match (key_path, token_path) {
            (Some(key_path), Some(token_path)) => Some(TokenPersistence {
                key_path: key_path.to_path_buf(),
                token_path,
            }),
            _ => None,
        };
        self.session.set_persistence(persistence);
    }

    /// Authenticates with credentials stored encrypted in `creds_path`.
    pub async fn authenticate_from_file(&self, key_path: &Path, creds_path: &Path) -> Result<(), Error> {
        let credentials = credentials::read_credentials(key_path, creds_path)?;
        self.use_key(Some(key_path));
        self.session.authenticate(credentials).await
    }

    /// Authenticates with credentials from `provider`. No token is persisted.
    pub async fn authenticate_with_provider(&self, provider: &dyn CredentialsProvider) -> Result<(), Error> {
        let credentials = Credentials::from_provided(provider.provide()?);
        self.use_key(None);
        self.session.authenticate(credentials).await
    }

    /// Authenticates with credentials from `provider`, then saves them
    /// encrypted to `creds_path` once the grant succeeded.
    pub async fn authenticate_and_save(
        &self,
        key_path: &Path,
        creds_path: &Path,
        provider: &dyn CredentialsProvider,
    ) -> Result<(), Error> {
        encryption::read_key(key_path)?;

        let credentials = Credentials::from_provided(provider.provide()?);
        self.use_key(Some(key_path));
        self.session.authenticate(credentials.clone()).await?;

        credentials::write_credentials(key_path, creds_path, &credentials)?;
        info!(path = %creds_path.display(), "Credentials saved");
        Ok(())
    }

    /// Fetches `uri` (relative to the base url) and resolves the response.
    pub async fn get(&self, uri: &str) -> Result<Vec<u8>, Error> {
        if !self.session.is_authenticated() {
            return Err(Error::NotAuthenticated);
        }

        let url = self.base_url.join(uri).map_err(|source| Error::InvalidUri {
            uri: uri.to_string(),
            source,
        })?;

        debug!(url = %url, "Fetching");
        let response = self.transport.execute(&url, Auth::Bearer).await?;
        if !response.status.is_success() {
            return Err(Error::UnexpectedStatus {
                url: url.to_string(),
                status: response.status,
                body: response.body,
            });
        }

        self.resolver.resolve(response.body).await
    }

    /// Like [`Client::get`], serving from and filling the cache.
    ///
    /// When the fetch succeeds but the cache write fails, the fetched bytes
    /// come back inside [`Error::CacheWrite`].
    pub async fn get_with_cache(&self, uri: &str, ttl: Duration) -> Result<Vec<u8>, Error> {
        let cache = self.cache.as_ref().ok_or(Error::CacheDisabled)?;

        if let Some(data) = cache.get(uri)? {
            debug!(uri = %uri, "Cache hit");
            return Ok(data);
        }

        let data = self.get(uri).await?;
        if let Err(source) = cache.set(uri, &data, ttl) {
            return Err(Error::CacheWrite { data, source });
        }

        Ok(data)
    }

    pub fn delete_cached(&self, uri: &str) -> Result<(), Error> {
        let cache = self.cache.as_ref().ok_or(Error::CacheDisabled)?;
        cache.delete(uri)?;
        Ok(())
    }

    /// Shuts down, compacting the cache if one is enabled.
    pub fn close(self) -> Result<(), Error> {
        if let Some(cache) = self.cache {
            cache.close()?;
        }
        info!("Client closed");
        Ok(())
    }

    /// Shuts down without cache compaction.
    pub fn close_fast(self) -> Result<(), Error> {
        if let Some(cache) = self.cache {
            cache.close_fast()?;
        }
        Ok(())
    }
}

use crate::cache::CacheError;
use crate::credentials::CodecError;
use crate::rate_limit::RateLimitExceeded;
use crate::resolve::ResolveError;
use crate::session::AuthError;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use std::path::PathBuf;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the fetch engine.
///
/// Configuration, authentication and resolution failures are never retried;
/// server errors are retried inside the transport and only show up here as
/// [`Error::RetriesExhausted`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(
        "credentials file '{}' is in a legacy format (missing client id/secret); delete it and re-authenticate",
        path.display()
    )]
    LegacyCredentials { path: PathBuf },

    #[error("missing credentials ({0})")]
    MissingCredentials(&'static str),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("must authenticate before fetching")]
    NotAuthenticated,

    #[error(transparent)]
    RateLimited(#[from] RateLimitExceeded),

    #[error("request to {url} failed: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("request to {url} unauthorized after token refresh")]
    Unauthorized {
        url: String,
        #[source]
        refresh_error: Option<AuthError>,
    },

    #[error("request to {url} still failing with {status} after {attempts} attempts")]
    RetriesExhausted {
        url: String,
        status: StatusCode,
        attempts: u32,
    },

    #[error("request to {url} returned {status}")]
    UnexpectedStatus {
        url: String,
        status: StatusCode,
        body: Vec<u8>,
    },

    #[error("invalid uri '{uri}': {source}")]
    InvalidUri {
        uri: String,
        #[source]
        source: url::ParseError,
    },

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("cache must be enabled")]
    CacheDisabled,

    #[error(transparent)]
    Cache(#[from] CacheError),

    /// The fetch succeeded but storing the result failed; `data` holds the
    /// fetched bytes.
    #[error("fetched data could not be cached: {source}")]
    CacheWrite {
        data: Vec<u8>,
        #[source]
        source: CacheError,
    },
}

impl Error {
    /// True for the typed rate-limit condition (Reject policy only).
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Error::RateLimited(_))
    }

    /// When the exhausted rate-limit budget resets, if this is a rate-limit error.
    pub fn reset_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Error::RateLimited(exceeded) => Some(exceeded.reset_at),
            _ => None,
        }
    }

    /// Takes the fetched bytes out of a failed cache write.
    pub fn into_fetched_data(self) -> Option<Vec<u8>> {
        match self {
            Error::CacheWrite { data, .. } => Some(data),
            _ => None,
        }
    }
}

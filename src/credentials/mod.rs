//! Account credentials for the password-limited grant.
//!
//! Passwords never leave this module in cleartext: they are masked as
//! `base64(sha256(password || lowercase(username)))` as soon as they are
//! provided, and the client secret is masked the same way (bound to the
//! client id) right before it is sent.
//!
//! # Usage
//!
//! ```no_run
//! use irdata::credentials::{self, EnvCredentials};
//! use std::path::Path;
//!
//! # fn main() -> Result<(), irdata::Error> {
//! // Ask the provider once and keep an encrypted copy next to the key
//! credentials::save_provided_credentials(
//!     Path::new("irdata.key"),
//!     Path::new("irdata.creds"),
//!     &EnvCredentials,
//! )?;
//!
//! let creds = credentials::read_credentials(Path::new("irdata.key"), Path::new("irdata.creds"))?;
//! assert!(credentials::is_masked(&creds.masked_password));
//! # Ok(())
//! # }
//! ```

use crate::Error;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;

pub mod encryption;

pub use encryption::CodecError;

/// Associated-data tag for credentials files.
pub(crate) const CREDENTIALS_CONTEXT: &[u8] = b"irdata.auth";

/// Associated-data tag for persisted token files.
pub(crate) const TOKEN_CONTEXT: &[u8] = b"irdata.token";

/// Stored account credentials.
///
/// `masked_password` is the one-way digest, never the plaintext.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub masked_password: String,

    /// Missing in files written by older versions (see [`read_credentials`])
    #[serde(default)]
    pub client_id: String,

    #[serde(default)]
    pub client_secret: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

impl Credentials {
    /// Builds a record from provider output, masking the password unless it
    /// already is.
    pub fn from_provided(provided: ProvidedCredentials) -> Self {
        let masked_password = if is_masked(&provided.password) {
            provided.password
        } else {
            mask_secret(&provided.password, &provided.username)
        };

        Self {
            username: provided.username,
            masked_password,
            client_id: provided.client_id,
            client_secret: provided.client_secret,
        }
    }

    /// Returns the name of the first missing field required by the grant.
    pub(crate) fn missing_field(&self) -> Option<&'static str> {
        if self.masked_password.is_empty() {
            Some("password")
        } else if self.client_id.is_empty() {
            Some("client_id")
        } else if self.client_secret.is_empty() {
            Some("client_secret")
        } else {
            None
        }
    }
}

/// Raw values handed over by a [`CredentialsProvider`].
#[derive(Clone)]
pub struct ProvidedCredentials {
    pub username: String,
    /// Plaintext or already-masked password
    pub password: String,
    pub client_id: String,
    pub client_secret: String,
}

/// Source of credentials for interactive or programmatic authentication.
pub trait CredentialsProvider {
    fn provide(&self) -> Result<ProvidedCredentials, Error>;
}

/// Credentials known up front (tests, embedding applications).
#[derive(Clone)]
pub struct StaticCredentials(pub ProvidedCredentials);

impl StaticCredentials {
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self(ProvidedCredentials {
            username: username.into(),
            password: password.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        })
    }
}

impl CredentialsProvider for StaticCredentials {
    fn provide(&self) -> Result<ProvidedCredentials, Error> {
        Ok(self.0.clone())
    }
}

/// Reads `IRDATA_USERNAME`, `IRDATA_PASSWORD`, `IRDATA_CLIENT_ID` and
/// `IRDATA_CLIENT_SECRET` from the environment.
#[derive(Clone, Copy, Debug, Default)]
pub struct EnvCredentials;

impl CredentialsProvider for EnvCredentials {
    fn provide(&self) -> Result<ProvidedCredentials, Error> {
        let var = |name: &'static str| {
            std::env::var(name).map_err(|_| Error::MissingCredentials(name))
        };

        Ok(ProvidedCredentials {
            username: var("IRDATA_USERNAME")?,
            password: var("IRDATA_PASSWORD")?,
            client_id: var("IRDATA_CLIENT_ID")?,
            client_secret: var("IRDATA_CLIENT_SECRET")?,
        })
    }
}

/// Masks `secret` with the normalized `id` concatenated with no separator.
pub fn mask_secret(secret: &str, id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update(id.to_lowercase().as_bytes());
    BASE64.encode(hasher.finalize())
}

/// True when `secret` is strict base64 of a SHA-256 digest.
pub fn is_masked(secret: &str) -> bool {
    BASE64
        .decode(secret)
        .map(|decoded| decoded.len() == Sha256::output_size())
        .unwrap_or(false)
}

/// Encrypts `credentials` into `path` with the key from `key_path`.
pub fn write_credentials(
    key_path: &Path,
    path: &Path,
    credentials: &Credentials,
) -> Result<(), Error> {
    encryption::encrypt_to_file(key_path, path, CREDENTIALS_CONTEXT, credentials)?;
    Ok(())
}

/// Decrypts the credentials stored in `path`.
///
/// Files written before client credentials were required decode with empty
/// `client_id`/`client_secret` and are rejected as a legacy format.
pub fn read_credentials(key_path: &Path, path: &Path) -> Result<Credentials, Error> {
    let credentials: Credentials =
        encryption::decrypt_from_file(key_path, path, CREDENTIALS_CONTEXT)?;

    if credentials.client_id.is_empty() || credentials.client_secret.is_empty() {
        return Err(Error::LegacyCredentials {
            path: path.to_path_buf(),
        });
    }

    Ok(credentials)
}

/// Asks `provider` for credentials and writes them, masked and encrypted, to `path`.
///
/// The key file is checked first so a bad key does not waste a prompt.
pub fn save_provided_credentials(
    key_path: &Path,
    path: &Path,
    provider: &dyn CredentialsProvider,
) -> Result<(), Error> {
    encryption::read_key(key_path)?;

    let credentials = Credentials::from_provided(provider.provide()?);
    write_credentials(key_path, path, &credentials)
}

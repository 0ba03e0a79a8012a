// Credentials, masking and the encrypted file codec
pub mod credentials;

// OAuth2 session and token persistence
pub mod session;

// Rate limit tracking
pub mod rate_limit;

// Retrying transport
pub mod transport;

// Link / data_url indirection and chunk merging
pub mod resolve;

// Response cache
pub mod cache;

// Fetch engine façade
pub mod client;

// Client configuration
pub mod config;

pub mod error;

pub use client::Client;
pub use config::ClientConfig;
pub use error::{Error, Result};
pub use rate_limit::{RateLimitExceeded, RateLimitPolicy};

use serde::Deserialize;
use std::time::Duration;

// Re-export component config types
pub use crate::cache::CacheConfig;
pub use crate::rate_limit::RateLimitPolicy;

/// Complete client configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

/// Remote API endpoints
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// Base that relative resource uris are resolved against
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// OAuth2 token endpoint
    #[serde(default = "default_token_url")]
    pub token_url: String,
    #[serde(default = "default_scope")]
    pub scope: String,
    /// Hosts in this domain receive bearer credentials
    #[serde(default = "default_api_domain")]
    pub api_domain: String,
    /// Per-request timeout (seconds, 0 disables)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_base_url() -> String {
    "https://members-ng.iracing.com".to_string()
}

fn default_token_url() -> String {
    "https://oauth.iracing.com/oauth2/token".to_string()
}

fn default_scope() -> String {
    "iracing.auth".to_string()
}

fn default_api_domain() -> String {
    "iracing.com".to_string()
}

fn default_request_timeout() -> u64 {
    60
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            token_url: default_token_url(),
            scope: default_scope(),
            api_domain: default_api_domain(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl ApiConfig {
    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_secs > 0).then(|| Duration::from_secs(self.request_timeout_secs))
    }
}

/// Transport retry behavior for 5xx responses
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt (0 = try exactly once)
    #[serde(default = "default_retries")]
    pub retries: u32,
    /// Backoff grows as `retries_used * backoff_unit`
    #[serde(default = "default_backoff_unit_ms")]
    pub backoff_unit_ms: u64,
}

fn default_retries() -> u32 {
    5
}

fn default_backoff_unit_ms() -> u64 {
    5_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retries: default_retries(),
            backoff_unit_ms: default_backoff_unit_ms(),
        }
    }
}

impl RetryConfig {
    pub fn backoff_unit(&self) -> Duration {
        Duration::from_millis(self.backoff_unit_ms)
    }
}

/// Rate limit handling
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub policy: RateLimitPolicy,
    /// Wait used when a 429 carries no usable reset time (seconds)
    #[serde(default = "default_fallback_wait")]
    pub fallback_wait_secs: u64,
}

fn default_fallback_wait() -> u64 {
    5
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            policy: RateLimitPolicy::default(),
            fallback_wait_secs: default_fallback_wait(),
        }
    }
}

/// Token grant behavior
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Attempts for the password grant on 5xx/429/network errors
    #[serde(default = "default_grant_attempts")]
    pub grant_attempts: u32,
    #[serde(default = "default_grant_backoff_ms")]
    pub grant_backoff_ms: u64,
    /// Refresh proactively when the token expires within this many seconds
    #[serde(default = "default_refresh_horizon")]
    pub refresh_horizon_secs: i64,
}

fn default_grant_attempts() -> u32 {
    5
}

fn default_grant_backoff_ms() -> u64 {
    5_000
}

fn default_refresh_horizon() -> i64 {
    60
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            grant_attempts: default_grant_attempts(),
            grant_backoff_ms: default_grant_backoff_ms(),
            refresh_horizon_secs: default_refresh_horizon(),
        }
    }
}

impl AuthConfig {
    pub fn grant_backoff(&self) -> Duration {
        Duration::from_millis(self.grant_backoff_ms)
    }

    pub fn refresh_horizon(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.refresh_horizon_secs)
    }
}

impl ClientConfig {
    /// Defaults overridden by env vars where set.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.apply_env();
        cfg
    }

    /// Applies `IRDATA_*` overrides; unparsable values are ignored.
    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("IRDATA_BASE_URL") {
            self.api.base_url = v;
        }
        if let Ok(v) = std::env::var("IRDATA_TOKEN_URL") {
            self.api.token_url = v;
        }
        if let Ok(v) = std::env::var("IRDATA_REQUEST_TIMEOUT_SECS") {
            if let Ok(n) = v.parse::<u64>() {
                self.api.request_timeout_secs = n;
            }
        }
        if let Ok(v) = std::env::var("IRDATA_RETRIES") {
            if let Ok(n) = v.parse::<u32>() {
                self.retry.retries = n;
            }
        }
        if let Ok(v) = std::env::var("IRDATA_RATE_LIMIT_POLICY") {
            if let Ok(policy) = v.parse::<RateLimitPolicy>() {
                self.rate_limit.policy = policy;
            }
        }
    }
}

/// Load configuration from TOML file
pub fn load_config(path: &str) -> Result<ClientConfig, Box<dyn std::error::Error>> {
    let contents = std::fs::read_to_string(path)?;
    let config: ClientConfig = toml::from_str(&contents)?;
    Ok(config)
}

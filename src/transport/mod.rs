//! Retrying transport for data API and object-storage requests.
//!
//! Each call runs a small state machine:
//!
//! ```text
//! Attempting -> WaitingForReset -> Attempting   (rate limited, Wait policy)
//! Attempting -> BackingOff      -> Attempting   (5xx, budget left)
//! Attempting -> Attempting                      (401 refreshed)
//! Attempting -> Done
//! ```
//!
//! Only 5xx responses spend the retry budget. Only credentialed requests to
//! the API consult and update the rate limiter. Sleeps are plain
//! `tokio::time::sleep`, so dropping the future cancels a wait.

use crate::config::RetryConfig;
use crate::rate_limit::{Outcome, RateLimitExceeded, RateLimiter};
use crate::session::SessionManager;
use crate::Error;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;


/// Whether a request may carry the session's bearer token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Auth {
    /// Attach the token when the host is the API host or inside the API domain
    Bearer,
    /// Never attach credentials (object storage, redirects)
    Anonymous,
}

/// Final response of an executed request.
#[derive(Debug)]
pub struct RawResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

enum Step {
    Attempting,
    WaitingForReset(Duration),
    BackingOff(Duration),
    Done(RawResponse),
}

struct Progress {
    credentialed: bool,
    retries_used: u32,
    refreshed: bool,
}

pub struct Transport {
    http: reqwest::Client,
    session: Arc<SessionManager>,
    limiter: Arc<RateLimiter>,
    api_host: Option<(String, Option<u16>)>,
    api_domain: String,
    retries: AtomicU32,
    backoff_unit: Duration,
}

impl Transport {
    pub fn new(
        http: reqwest::Client,
        session: Arc<SessionManager>,
        limiter: Arc<RateLimiter>,
        base_url: &Url,
        api_domain: &str,
        retry: &RetryConfig,
    ) -> Self {
        Self {
            http,
            session,
            limiter,
            api_host: base_url
                .host_str()
                .map(|host| (host.to_ascii_lowercase(), base_url.port_or_known_default())),
            api_domain: api_domain.trim_start_matches('.').to_ascii_lowercase(),
            retries: AtomicU32::new(retry.retries),
            backoff_unit: retry.backoff_unit(),
        }
    }

    /// Retries allowed after the first attempt; 0 means exactly one attempt.
    pub fn set_retries(&self, retries: u32) {
        self.retries.store(retries, Ordering::Relaxed);
    }

    pub fn retries(&self) -> u32 {
        self.retries.load(Ordering::Relaxed)
    }

    /// True when bearer credentials may be sent to `url`.
    pub fn is_credentialed_host(&self, url: &Url) -> bool {
        let Some(host) = url.host_str() else {
            return false;
        };
        let host = host.to_ascii_lowercase();

        if let Some((api_host, api_port)) = &self.api_host {
            if *api_host == host && *api_port == url.port_or_known_default() {
                return true;
            }
        }

        !self.api_domain.is_empty()
            && (host == self.api_domain
                || host
                    .strip_suffix(self.api_domain.as_str())
                    .map_or(false, |rest| rest.ends_with('.')))
    }

    /// Sends a GET to `url` until it settles.
    ///
    /// Returns the response for any status other than 401/429/5xx, success and
    /// client errors alike.
    pub async fn execute(&self, url: &Url, auth: Auth) -> Result<RawResponse, Error> {
        let mut progress = Progress {
            credentialed: auth == Auth::Bearer && self.is_credentialed_host(url),
            retries_used: 0,
            refreshed: false,
        };
        let mut step = Step::Attempting;

        loop {
            step = match step {
                Step::Attempting => self.attempt(url, &mut progress).await?,
                Step::WaitingForReset(wait) => {
                    debug!(url = %url, wait_ms = wait.as_millis() as u64, "Waiting for rate limit reset");
                    tokio::time::sleep(wait).await;
                    Step::Attempting
                }
                Step::BackingOff(delay) => {
                    tokio::time::sleep(delay).await;
                    Step::Attempting
                }
                Step::Done(response) => return Ok(response),
            };
        }
    }

    async fn attempt(&self, url: &Url, progress: &mut Progress) -> Result<Step, Error> {
        // The tracked budget belongs to the API; object storage is not charged
        if progress.credentialed {
            match self.limiter.check_before_request() {
                Outcome::Proceed => {}
                Outcome::Wait(wait) => return Ok(Step::WaitingForReset(wait)),
                Outcome::Reject(reset_at) => return Err(RateLimitExceeded { reset_at }.into()),
            }
        }

        let mut request = self.http.get(url.clone());
        let mut bearer = None;
        if progress.credentialed {
            self.session.refresh_if_stale().await?;
            bearer = self.session.bearer_token();
            if let Some(token) = &bearer {
                request = request.bearer_auth(token);
            }
        }

        let response = request.send().await.map_err(|source| Error::Network {
            url: url.to_string(),
            source,
        })?;

        let status = response.status();
        let headers = response.headers().clone();
        if progress.credentialed {
            self.limiter.observe(&headers);
        }

        match status {
            StatusCode::UNAUTHORIZED if progress.credentialed => {
                if progress.refreshed {
                    return Err(Error::Unauthorized {
                        url: url.to_string(),
                        refresh_error: None,
                    });
                }
                progress.refreshed = true;

                warn!(url = %url, "Request unauthorized, refreshing token");
                self.session
                    .refresh_after_rejection(bearer.as_deref())
                    .await
                    .map_err(|e| Error::Unauthorized {
                        url: url.to_string(),
                        refresh_error: Some(e),
                    })?;
                Ok(Step::Attempting)
            }
            StatusCode::TOO_MANY_REQUESTS => {
                let outcome = if progress.credentialed {
                    self.limiter.on_too_many_requests(&headers)
                } else {
                    self.limiter.on_untracked_too_many_requests(&headers)
                };
                match outcome {
                    Outcome::Reject(reset_at) => Err(RateLimitExceeded { reset_at }.into()),
                    Outcome::Wait(wait) => Ok(Step::WaitingForReset(wait)),
                    Outcome::Proceed => Ok(Step::Attempting),
                }
            }
            status if status.is_server_error() => {
                if progress.retries_used >= self.retries() {
                    return Err(Error::RetriesExhausted {
                        url: url.to_string(),
                        status,
                        attempts: progress.retries_used + 1,
                    });
                }
                progress.retries_used += 1;

                let delay = self.backoff_unit * progress.retries_used;
                warn!(
                    url = %url,
                    status = %status,
                    retry = progress.retries_used,
                    backoff_ms = delay.as_millis() as u64,
                    "Server error, backing off"
                );
                Ok(Step::BackingOff(delay))
            }
            _ => {
                let body = response.bytes().await.map_err(|source| Error::Network {
                    url: url.to_string(),
                    source,
                })?;
                Ok(Step::Done(RawResponse {
                    status,
                    headers,
                    body: body.to_vec(),
                }))
            }
        }
    }
}

// Rate limit tracking for the data API
//
// State comes only from the x-ratelimit-* headers of observed responses; there
// is no local refill. Everything sits behind one mutex because many fetches
// share a client.

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::Deserialize;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

/// Requests left in the current window.
pub const REMAINING_HEADER: &str = "x-ratelimit-remaining";

/// Unix epoch seconds when the window resets.
pub const RESET_HEADER: &str = "x-ratelimit-reset";

/// What to do when the budget is exhausted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitPolicy {
    /// Fail with [`RateLimitExceeded`]
    #[default]
    Reject,
    /// Sleep until the reset time, then proceed
    Wait,
}

impl FromStr for RateLimitPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "reject" | "error" => Ok(Self::Reject),
            "wait" => Ok(Self::Wait),
            other => Err(format!("unknown rate limit policy '{other}'")),
        }
    }
}

/// The rate limit budget is exhausted until `reset_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("rate limit exceeded, resets at {reset_at}")]
pub struct RateLimitExceeded {
    pub reset_at: DateTime<Utc>,
}

/// Decision taken before (or after a 429 for) a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Proceed,
    Wait(Duration),
    Reject(DateTime<Utc>),
}

/// Copy of the tracked state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimitSnapshot {
    pub remaining: Option<i64>,
    pub reset_at: Option<DateTime<Utc>>,
}

struct Inner {
    state: RateLimitSnapshot,
    policy: RateLimitPolicy,
}

impl Inner {
    fn record(&mut self, remaining: Option<i64>, reset_at: Option<DateTime<Utc>>) {
        if let Some(remaining) = remaining {
            self.state.remaining = Some(remaining);
        }
        if let Some(reset_at) = reset_at {
            self.state.reset_at = Some(reset_at);
        }
    }

    fn decide(&self, reset_at: DateTime<Utc>, now: DateTime<Utc>) -> Outcome {
        match self.policy {
            RateLimitPolicy::Reject => Outcome::Reject(reset_at),
            // Negative waits clamp to zero
            RateLimitPolicy::Wait => {
                Outcome::Wait((reset_at - now).to_std().unwrap_or(Duration::ZERO))
            }
        }
    }
}

/// Shared remaining-budget tracker.
///
/// Starts with no knowledge (everything proceeds) and learns from responses.
pub struct RateLimiter {
    inner: Mutex<Inner>,
    fallback_wait: Duration,
}

impl RateLimiter {
    pub fn new(policy: RateLimitPolicy, fallback_wait: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: RateLimitSnapshot::default(),
                policy,
            }),
            fallback_wait,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // plain data, a panic elsewhere cannot leave it half-written
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn policy(&self) -> RateLimitPolicy {
        self.lock().policy
    }

    pub fn set_policy(&self, policy: RateLimitPolicy) {
        self.lock().policy = policy;
    }

    pub fn snapshot(&self) -> RateLimitSnapshot {
        self.lock().state
    }

    /// Decide whether a request may be sent now.
    ///
    /// A known positive budget is decremented on `Proceed` so that concurrent
    /// callers cannot both spend the last request.
    pub fn check_before_request(&self) -> Outcome {
        self.check_at(Utc::now())
    }

    fn check_at(&self, now: DateTime<Utc>) -> Outcome {
        let mut inner = self.lock();
        let RateLimitSnapshot {
            remaining,
            reset_at,
        } = inner.state;

        match (remaining, reset_at) {
            (Some(left), Some(reset_at)) if left <= 0 && reset_at > now => {
                inner.decide(reset_at, now)
            }
            (Some(left), Some(_)) if left <= 0 => {
                // Window has rolled over; budget unknown until the next response
                inner.state.remaining = None;
                Outcome::Proceed
            }
            (Some(left), _) if left > 0 => {
                inner.state.remaining = Some(left - 1);
                Outcome::Proceed
            }
            _ => Outcome::Proceed,
        }
    }

    /// Record the rate limit headers of a response. Last observer wins.
    pub fn observe(&self, headers: &HeaderMap) {
        let remaining = parse_remaining(headers);
        let reset_at = parse_reset(headers);
        if remaining.is_none() && reset_at.is_none() {
            return;
        }

        let mut inner = self.lock();
        inner.record(remaining, reset_at);

        debug!(
            remaining = ?inner.state.remaining,
            reset_at = ?inner.state.reset_at,
            "Rate limit observed"
        );
    }

    /// The server answered 429: its headers supersede local state.
    ///
    /// Without a usable reset time the `Retry-After` header, then the
    /// configured fallback, decides how long the window lasts.
    pub fn on_too_many_requests(&self, headers: &HeaderMap) -> Outcome {
        self.on_too_many_requests_at(headers, Utc::now())
    }

    fn on_too_many_requests_at(&self, headers: &HeaderMap, now: DateTime<Utc>) -> Outcome {
        let observed_reset = parse_reset(headers);
        let retry_after = parse_retry_after(headers).unwrap_or(self.fallback_wait);

        let mut inner = self.lock();
        inner.record(Some(0), observed_reset);

        let reset_at = match inner.state.reset_at {
            Some(reset_at) if reset_at > now => reset_at,
            _ => now + to_chrono(retry_after),
        };
        inner.state.reset_at = Some(reset_at);

        inner.decide(reset_at, now)
    }

    /// A 429 from a host whose budget is not tracked here.
    ///
    /// Applies the policy to the `Retry-After` (or fallback) wait and leaves
    /// the tracked state alone.
    pub fn on_untracked_too_many_requests(&self, headers: &HeaderMap) -> Outcome {
        let now = Utc::now();
        let wait = parse_retry_after(headers).unwrap_or(self.fallback_wait);
        self.lock().decide(now + to_chrono(wait), now)
    }
}

fn to_chrono(wait: Duration) -> chrono::Duration {
    chrono::Duration::from_std(wait).unwrap_or_else(|_| chrono::Duration::zero())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim)
}

fn parse_remaining(headers: &HeaderMap) -> Option<i64> {
    header_str(headers, REMAINING_HEADER)?.parse().ok()
}

fn parse_reset(headers: &HeaderMap) -> Option<DateTime<Utc>> {
    let secs: f64 = header_str(headers, RESET_HEADER)?.parse().ok()?;
    DateTime::from_timestamp_millis((secs * 1000.0) as i64)
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    header_str(headers, RETRY_AFTER.as_str())?
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

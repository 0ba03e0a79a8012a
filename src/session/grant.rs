//! Token endpoint requests.
//!
//! Builds the form bodies for the password-limited and refresh grants and
//! posts them, retrying the password grant on 5xx/429.

use super::AuthError;
use crate::credentials::{mask_secret, Credentials};
use chrono::{DateTime, Utc};
use reqwest::{header::ACCEPT, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::warn;

pub(crate) type Form = Vec<(&'static str, String)>;

/// OAuth token response
#[derive(Deserialize, Debug)]
pub(crate) struct TokenResponse {
    pub access_token: String,
    pub expires_in: i64,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl TokenResponse {
    /// Absolute expiry of the granted token, counted from `now`.
    pub fn expiry(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, AuthError> {
        if self.expires_in < 0 {
            return Err(AuthError::InvalidExpiry(self.expires_in));
        }
        chrono::Duration::try_seconds(self.expires_in)
            .and_then(|lifetime| now.checked_add_signed(lifetime))
            .ok_or(AuthError::InvalidExpiry(self.expires_in))
    }
}

/// Form for `grant_type=password_limited`.
///
/// The client secret is masked with the client id; the password is already
/// masked in the credentials record.
pub(crate) fn password_form(credentials: &Credentials, scope: &str) -> Form {
    vec![
        ("grant_type", "password_limited".to_string()),
        ("client_id", credentials.client_id.clone()),
        (
            "client_secret",
            mask_secret(&credentials.client_secret, &credentials.client_id),
        ),
        ("username", credentials.username.clone()),
        ("password", credentials.masked_password.clone()),
        ("scope", scope.to_string()),
    ]
}

/// Form for `grant_type=refresh_token`.
pub(crate) fn refresh_form(client_id: &str, client_secret: &str, refresh_token: &str) -> Form {
    vec![
        ("grant_type", "refresh_token".to_string()),
        ("client_id", client_id.to_string()),
        ("client_secret", mask_secret(client_secret, client_id)),
        ("refresh_token", refresh_token.to_string()),
    ]
}

/// Posts `form` to the token endpoint.
///
/// Network errors, 5xx and 429 are retried up to `attempts` total with a
/// backoff of `attempt * backoff`. Other non-200 statuses fail at once.
pub(crate) async fn request_token(
    http: &reqwest::Client,
    token_url: &str,
    form: &Form,
    attempts: u32,
    backoff: Duration,
) -> Result<TokenResponse, AuthError> {
    let attempts = attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;

        let result = http
            .post(token_url)
            .header(ACCEPT, "application/json")
            .form(form)
            .send()
            .await;

        let retryable = match &result {
            Err(_) => true,
            Ok(response) => {
                response.status().is_server_error()
                    || response.status() == StatusCode::TOO_MANY_REQUESTS
            }
        };

        if !retryable || attempt >= attempts {
            let response = result.map_err(AuthError::Request)?;
            return parse_token_response(response).await;
        }

        let delay = backoff * attempt;
        let status = match &result {
            Ok(response) => response.status().to_string(),
            Err(_) => "error".to_string(),
        };
        warn!(
            status = %status,
            attempt = attempt,
            backoff_ms = delay.as_millis() as u64,
            "Retrying authentication"
        );

        tokio::time::sleep(delay).await;
    }
}

async fn parse_token_response(response: reqwest::Response) -> Result<TokenResponse, AuthError> {
    let status = response.status();
    if status != StatusCode::OK {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<failed to read body>".to_string());
        warn!(status = %status, "Token endpoint rejected the grant");
        return Err(AuthError::Rejected { status, body });
    }

    let token: TokenResponse = response.json().await.map_err(AuthError::InvalidResponse)?;
    if token.access_token.is_empty() {
        return Err(AuthError::EmptyAccessToken);
    }

    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::is_masked;

    fn credentials() -> Credentials {
        Credentials {
            username: "louis@ferrari.com".to_string(),
            masked_password: mask_secret("red4life", "louis@ferrari.com"),
            client_id: "ferrari".to_string(),
            client_secret: "we-are-faster".to_string(),
        }
    }

    fn field<'a>(form: &'a Form, name: &str) -> &'a str {
        form.iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.as_str())
            .unwrap()
    }

    #[test]
    fn test_password_form_masks_client_secret() {
        let form = password_form(&credentials(), "iracing.auth");

        assert_eq!(field(&form, "grant_type"), "password_limited");
        assert_eq!(field(&form, "client_id"), "ferrari");
        assert_eq!(field(&form, "username"), "louis@ferrari.com");
        assert_eq!(field(&form, "scope"), "iracing.auth");
        assert!(is_masked(field(&form, "client_secret")));
        assert_eq!(
            field(&form, "client_secret"),
            mask_secret("we-are-faster", "ferrari")
        );
        assert_eq!(field(&form, "password"), credentials().masked_password);
    }

    #[test]
    fn test_refresh_form() {
        let form = refresh_form("ferrari", "we-are-faster", "refresh-1");

        assert_eq!(field(&form, "grant_type"), "refresh_token");
        assert_eq!(field(&form, "refresh_token"), "refresh-1");
        assert!(is_masked(field(&form, "client_secret")));
    }

    #[test]
    fn test_token_response_deserialization() {
        let json = r#"{
            "access_token": "access-1",
            "token_type": "Bearer",
            "expires_in": 600,
            "refresh_token": "refresh-1",
            "scope": "iracing.auth"
        }"#;

        let response: TokenResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.access_token, "access-1");
        assert_eq!(response.expires_in, 600);
        assert_eq!(response.refresh_token.as_deref(), Some("refresh-1"));
        assert_eq!(response.scope.as_deref(), Some("iracing.auth"));
    }

    #[test]
    fn test_token_response_without_refresh_token() {
        let json = r#"{"access_token": "access-2", "expires_in": 600}"#;

        let response: TokenResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.refresh_token, None);
    }

    #[test]
    fn test_token_expiry_bounds() {
        let now = Utc::now();
        let response = |expires_in| TokenResponse {
            access_token: "access-1".to_string(),
            expires_in,
            refresh_token: None,
            scope: None,
        };

        assert_eq!(
            response(600).expiry(now).unwrap(),
            now + chrono::Duration::seconds(600)
        );
        assert_eq!(response(0).expiry(now).unwrap(), now);
        assert!(matches!(
            response(-1).expiry(now),
            Err(AuthError::InvalidExpiry(-1))
        ));
        assert!(matches!(
            response(i64::MAX).expiry(now),
            Err(AuthError::InvalidExpiry(i64::MAX))
        ));
        // In range for a Duration but past the last representable date
        assert!(matches!(
            response(i64::MAX / 1000).expiry(now),
            Err(AuthError::InvalidExpiry(_))
        ));
    }
}

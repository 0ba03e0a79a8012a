use super::*;
use crate::credentials::encryption::test_support::write_key;
use crate::credentials::{mask_secret, StaticCredentials};
use mockito::{Matcher, Server};
use serde_json::json;

fn auth_config() -> AuthConfig {
    AuthConfig {
        grant_attempts: 3,
        grant_backoff_ms: 1,
        refresh_horizon_secs: 60,
    }
}

fn manager(server: &Server) -> SessionManager {
    SessionManager::new(
        reqwest::Client::new(),
        format!("{}/oauth2/token", server.url()),
        "iracing.auth".to_string(),
        auth_config(),
    )
}

fn credentials() -> Credentials {
    Credentials::from_provided(
        StaticCredentials::new("louis@ferrari.com", "red4life", "ferrari", "we-are-faster").0,
    )
}

fn token_body(access: &str, refresh: Option<&str>, expires_in: i64) -> String {
    let mut body = json!({
        "access_token": access,
        "token_type": "Bearer",
        "expires_in": expires_in,
        "scope": "iracing.auth",
    });
    if let Some(refresh) = refresh {
        body["refresh_token"] = json!(refresh);
    }
    body.to_string()
}

fn grant(kind: &str) -> Matcher {
    Matcher::UrlEncoded("grant_type".into(), kind.into())
}

fn write_token(persistence: &TokenPersistence, access: &str, refresh: &str, expires_in: i64) {
    let token = AuthToken {
        access_token: access.to_string(),
        refresh_token: refresh.to_string(),
        token_expiry: Utc::now() + chrono::Duration::seconds(expires_in),
        client_id: "ferrari".to_string(),
        client_secret: "we-are-faster".to_string(),
    };
    encryption::encrypt_to_file(
        &persistence.key_path,
        &persistence.token_path,
        TOKEN_CONTEXT,
        &token,
    )
    .unwrap();
}

fn persistence(dir: &tempfile::TempDir) -> TokenPersistence {
    TokenPersistence {
        key_path: write_key(dir.path(), 32),
        token_path: dir.path().join("test.token"),
    }
}

#[tokio::test]
async fn test_password_grant_success() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/oauth2/token")
        .match_header("content-type", "application/x-www-form-urlencoded")
        .match_body(Matcher::AllOf(vec![
            grant("password_limited"),
            Matcher::UrlEncoded("client_id".into(), "ferrari".into()),
            Matcher::UrlEncoded(
                "client_secret".into(),
                mask_secret("we-are-faster", "ferrari"),
            ),
            Matcher::UrlEncoded("username".into(), "louis@ferrari.com".into()),
            Matcher::UrlEncoded(
                "password".into(),
                mask_secret("red4life", "louis@ferrari.com"),
            ),
            Matcher::UrlEncoded("scope".into(), "iracing.auth".into()),
        ]))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(token_body("access-1", Some("refresh-1"), 600))
        .expect(1)
        .create_async()
        .await;

    let session = manager(&server);
    assert!(!session.is_authenticated());
    assert_eq!(session.bearer_token(), None);

    session.authenticate(credentials()).await.unwrap();

    assert!(session.is_authenticated());
    assert_eq!(session.bearer_token().as_deref(), Some("access-1"));
    let remaining = session.token_expiry().unwrap() - Utc::now();
    assert!(remaining > chrono::Duration::seconds(590));
    assert!(remaining <= chrono::Duration::seconds(600));

    // Already authenticated: no second grant
    session.authenticate(credentials()).await.unwrap();
    mock.assert_async().await;
}

#[tokio::test]
async fn test_password_grant_rejected_is_not_retried() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/oauth2/token")
        .with_status(401)
        .with_body(r#"{"error":"unauthorized_client"}"#)
        .expect(1)
        .create_async()
        .await;

    let session = manager(&server);
    let err = session.authenticate(credentials()).await.unwrap_err();

    match err {
        Error::Auth(AuthError::Rejected { status, body }) => {
            assert_eq!(status, StatusCode::UNAUTHORIZED);
            assert!(body.contains("unauthorized_client"));
        }
        other => panic!("expected rejected grant, got {:?}", other),
    }
    assert!(!session.is_authenticated());
    mock.assert_async().await;
}

#[tokio::test]
async fn test_out_of_range_expiry_is_rejected() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/oauth2/token")
        .with_status(200)
        .with_body(token_body("access-1", Some("refresh-1"), i64::MAX))
        .expect(1)
        .create_async()
        .await;

    let session = manager(&server);
    let err = session.authenticate(credentials()).await.unwrap_err();

    assert!(
        matches!(err, Error::Auth(AuthError::InvalidExpiry(i64::MAX))),
        "got {:?}",
        err
    );
    assert!(!session.is_authenticated());
    assert_eq!(session.bearer_token(), None);
    mock.assert_async().await;
}

#[tokio::test]
async fn test_negative_expiry_is_rejected() {
    let mut server = Server::new_async().await;
    server
        .mock("POST", "/oauth2/token")
        .with_status(200)
        .with_body(token_body("access-1", None, -30))
        .create_async()
        .await;

    let session = manager(&server);
    let err = session.authenticate(credentials()).await.unwrap_err();

    assert!(matches!(err, Error::Auth(AuthError::InvalidExpiry(-30))));
    assert!(!session.is_authenticated());
}

#[tokio::test]
async fn test_password_grant_retries_server_errors() {
    let mut server = Server::new_async().await;
    let failing = server
        .mock("POST", "/oauth2/token")
        .with_status(503)
        .expect(2)
        .create_async()
        .await;
    let ok = server
        .mock("POST", "/oauth2/token")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(token_body("access-1", Some("refresh-1"), 600))
        .expect(1)
        .create_async()
        .await;

    let session = manager(&server);
    session.authenticate(credentials()).await.unwrap();

    assert_eq!(session.bearer_token().as_deref(), Some("access-1"));
    failing.assert_async().await;
    ok.assert_async().await;
}

#[tokio::test]
async fn test_missing_client_credentials_is_fatal() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/oauth2/token")
        .expect(0)
        .create_async()
        .await;

    let mut creds = credentials();
    creds.client_secret.clear();

    let session = manager(&server);
    let err = session.authenticate(creds).await.unwrap_err();
    assert!(matches!(err, Error::MissingCredentials("client_secret")));
    mock.assert_async().await;
}

#[tokio::test]
async fn test_refresh_rotates_or_keeps_refresh_token() {
    let mut server = Server::new_async().await;
    let _password = server
        .mock("POST", "/oauth2/token")
        .match_body(grant("password_limited"))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(token_body("access-1", Some("refresh-1"), 600))
        .create_async()
        .await;
    let rotating = server
        .mock("POST", "/oauth2/token")
        .match_body(Matcher::AllOf(vec![
            grant("refresh_token"),
            Matcher::UrlEncoded("refresh_token".into(), "refresh-1".into()),
        ]))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(token_body("access-2", Some("refresh-2"), 600))
        .expect(1)
        .create_async()
        .await;
    let keeping = server
        .mock("POST", "/oauth2/token")
        .match_body(Matcher::AllOf(vec![
            grant("refresh_token"),
            Matcher::UrlEncoded("refresh_token".into(), "refresh-2".into()),
        ]))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(token_body("access-3", None, 600))
        .expect(1)
        .create_async()
        .await;

    let session = manager(&server);
    session.authenticate(credentials()).await.unwrap();

    session.refresh_after_rejection(Some("access-1")).await.unwrap();
    assert_eq!(session.bearer_token().as_deref(), Some("access-2"));
    assert_eq!(session.read().refresh_token, "refresh-2");

    session.refresh_after_rejection(Some("access-2")).await.unwrap();
    assert_eq!(session.bearer_token().as_deref(), Some("access-3"));
    assert_eq!(session.read().refresh_token, "refresh-2");

    rotating.assert_async().await;
    keeping.assert_async().await;
}

#[tokio::test]
async fn test_rejection_of_replaced_token_skips_refresh() {
    let mut server = Server::new_async().await;
    let _password = server
        .mock("POST", "/oauth2/token")
        .match_body(grant("password_limited"))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(token_body("access-2", Some("refresh-1"), 600))
        .create_async()
        .await;
    let refresh = server
        .mock("POST", "/oauth2/token")
        .match_body(grant("refresh_token"))
        .expect(0)
        .create_async()
        .await;

    let session = manager(&server);
    session.authenticate(credentials()).await.unwrap();

    // A 401 for an older token arrives after the token was already replaced
    session.refresh_after_rejection(Some("access-1")).await.unwrap();
    assert_eq!(session.bearer_token().as_deref(), Some("access-2"));
    refresh.assert_async().await;
}

#[tokio::test]
async fn test_refused_refresh_falls_back_to_password_grant() {
    let mut server = Server::new_async().await;
    let refresh = server
        .mock("POST", "/oauth2/token")
        .match_body(grant("refresh_token"))
        .with_status(400)
        .with_body(r#"{"error":"invalid_grant"}"#)
        .expect(1)
        .create_async()
        .await;
    let password = server
        .mock("POST", "/oauth2/token")
        .match_body(grant("password_limited"))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(token_body("access-2", Some("refresh-2"), 600))
        .expect(1)
        .create_async()
        .await;

    let session = manager(&server);
    {
        let mut s = session.write();
        s.access_token = "access-1".to_string();
        s.refresh_token = "refresh-1".to_string();
        s.token_expiry = Some(Utc::now() + chrono::Duration::seconds(600));
        s.client_id = "ferrari".to_string();
        s.client_secret = "we-are-faster".to_string();
        s.authenticated = true;
        s.credentials = Some(credentials());
    }

    session.refresh_after_rejection(Some("access-1")).await.unwrap();
    assert_eq!(session.bearer_token().as_deref(), Some("access-2"));

    refresh.assert_async().await;
    password.assert_async().await;
}

#[tokio::test]
async fn test_refused_refresh_without_credentials_fails() {
    let mut server = Server::new_async().await;
    let _refresh = server
        .mock("POST", "/oauth2/token")
        .with_status(400)
        .create_async()
        .await;

    let session = manager(&server);
    {
        let mut s = session.write();
        s.access_token = "access-1".to_string();
        s.refresh_token = "refresh-1".to_string();
        s.token_expiry = Some(Utc::now() + chrono::Duration::seconds(600));
        s.authenticated = true;
    }

    let err = session.refresh_after_rejection(None).await.unwrap_err();
    assert!(matches!(err, AuthError::Rejected { .. }));
    assert!(!session.is_authenticated());
}

#[tokio::test]
async fn test_refresh_if_stale_is_noop_for_fresh_token() {
    let mut server = Server::new_async().await;
    let _password = server
        .mock("POST", "/oauth2/token")
        .match_body(grant("password_limited"))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(token_body("access-1", Some("refresh-1"), 3600))
        .create_async()
        .await;
    let refresh = server
        .mock("POST", "/oauth2/token")
        .match_body(grant("refresh_token"))
        .expect(0)
        .create_async()
        .await;

    let session = manager(&server);
    session.authenticate(credentials()).await.unwrap();
    session.refresh_if_stale().await.unwrap();

    refresh.assert_async().await;
}

#[tokio::test]
async fn test_refresh_if_stale_refreshes_near_expiry() {
    let mut server = Server::new_async().await;
    let _password = server
        .mock("POST", "/oauth2/token")
        .match_body(grant("password_limited"))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(token_body("access-1", Some("refresh-1"), 30))
        .create_async()
        .await;
    let refresh = server
        .mock("POST", "/oauth2/token")
        .match_body(grant("refresh_token"))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(token_body("access-2", None, 3600))
        .expect(1)
        .create_async()
        .await;

    let session = manager(&server);
    session.authenticate(credentials()).await.unwrap();
    session.refresh_if_stale().await.unwrap();

    assert_eq!(session.bearer_token().as_deref(), Some("access-2"));
    refresh.assert_async().await;
}

#[tokio::test]
async fn test_persisted_token_adopted_without_grant() {
    let dir = tempfile::tempdir().unwrap();
    let persistence = persistence(&dir);
    write_token(&persistence, "persisted-access", "persisted-refresh", 3600);

    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/oauth2/token")
        .expect(0)
        .create_async()
        .await;

    let session = manager(&server);
    session.set_persistence(Some(persistence));
    session.authenticate(credentials()).await.unwrap();

    assert_eq!(session.bearer_token().as_deref(), Some("persisted-access"));
    mock.assert_async().await;
}

#[tokio::test]
async fn test_persisted_token_near_expiry_survives_failed_refresh() {
    let dir = tempfile::tempdir().unwrap();
    let persistence = persistence(&dir);
    write_token(&persistence, "persisted-access", "persisted-refresh", 30);

    let mut server = Server::new_async().await;
    let refresh = server
        .mock("POST", "/oauth2/token")
        .match_body(grant("refresh_token"))
        .with_status(500)
        .expect(1)
        .create_async()
        .await;
    let password = server
        .mock("POST", "/oauth2/token")
        .match_body(grant("password_limited"))
        .expect(0)
        .create_async()
        .await;

    let session = manager(&server);
    session.set_persistence(Some(persistence));
    session.authenticate(credentials()).await.unwrap();

    assert_eq!(session.bearer_token().as_deref(), Some("persisted-access"));
    refresh.assert_async().await;
    password.assert_async().await;
}

#[tokio::test]
async fn test_expired_persisted_token_falls_back_to_password_grant() {
    let dir = tempfile::tempdir().unwrap();
    let persistence = persistence(&dir);
    write_token(&persistence, "persisted-access", "persisted-refresh", -60);

    let mut server = Server::new_async().await;
    let refresh = server
        .mock("POST", "/oauth2/token")
        .match_body(grant("refresh_token"))
        .with_status(400)
        .expect(1)
        .create_async()
        .await;
    let password = server
        .mock("POST", "/oauth2/token")
        .match_body(grant("password_limited"))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(token_body("fresh-access", Some("fresh-refresh"), 600))
        .expect(1)
        .create_async()
        .await;

    let session = manager(&server);
    session.set_persistence(Some(persistence.clone()));
    session.authenticate(credentials()).await.unwrap();

    assert_eq!(session.bearer_token().as_deref(), Some("fresh-access"));
    refresh.assert_async().await;
    password.assert_async().await;

    // The new token replaced the expired one on disk
    let stored: AuthToken = encryption::decrypt_from_file(
        &persistence.key_path,
        &persistence.token_path,
        TOKEN_CONTEXT,
    )
    .unwrap();
    assert_eq!(stored.access_token, "fresh-access");
    assert_eq!(stored.refresh_token, "fresh-refresh");
}

#[tokio::test]
async fn test_token_write_failure_is_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let persistence = TokenPersistence {
        key_path: write_key(dir.path(), 32),
        token_path: dir.path().join("missing-dir").join("test.token"),
    };

    let mut server = Server::new_async().await;
    let _password = server
        .mock("POST", "/oauth2/token")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(token_body("access-1", Some("refresh-1"), 600))
        .create_async()
        .await;

    let session = manager(&server);
    session.set_persistence(Some(persistence));
    session.authenticate(credentials()).await.unwrap();

    assert_eq!(session.bearer_token().as_deref(), Some("access-1"));
}

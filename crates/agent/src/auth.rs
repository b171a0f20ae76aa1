//! Credential storage and re-authentication against the device-data backend.
//!
//! Tokens live in memory behind [`TokenStore`] and are mirrored to a small
//! JSON cache file so a restart does not force a fresh login. The store is
//! the only owner of credential state: login and refresh write through it,
//! logout destroys it.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Token store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

/// Access/refresh tokens, optionally cached on disk between runs.
pub struct TokenStore {
    inner: RwLock<Option<Credentials>>,
    cache_path: Option<PathBuf>,
}

impl TokenStore {
    /// Store without persistence (tests, one-shot runs).
    pub fn in_memory() -> Self {
        Self {
            inner: RwLock::new(None),
            cache_path: None,
        }
    }

    /// Store backed by a JSON cache file. An existing cache is loaded
    /// eagerly; a corrupt one is discarded with a warning.
    pub fn with_cache(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let existing = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<Credentials>(&bytes) {
                Ok(creds) => Some(creds),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "ignoring corrupt token cache");
                    None
                }
            },
            Err(_) => None,
        };
        Self {
            inner: RwLock::new(existing),
            cache_path: Some(path),
        }
    }

    pub fn access_token(&self) -> Option<String> {
        self.read().as_ref().map(|c| c.access_token.clone())
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.read().as_ref().and_then(|c| c.refresh_token.clone())
    }

    pub fn is_authenticated(&self) -> bool {
        self.read().is_some()
    }

    /// Replace the credentials and write through to the cache file.
    pub fn set(&self, creds: Credentials) {
        if let Some(path) = &self.cache_path {
            match serde_json::to_vec_pretty(&creds) {
                Ok(bytes) => {
                    if let Err(e) = std::fs::write(path, bytes) {
                        tracing::warn!(path = %path.display(), error = %e, "failed to write token cache");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "failed to encode token cache"),
            }
        }
        *self.write() = Some(creds);
    }

    /// Destroy all credential state (logout). Removes the cache file.
    pub fn clear(&self) {
        if let Some(path) = &self.cache_path {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), error = %e, "failed to remove token cache");
                }
            }
        }
        *self.write() = None;
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Option<Credentials>> {
        self.inner.read().expect("token store poisoned")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Option<Credentials>> {
        self.inner.write().expect("token store poisoned")
    }
}

// ---------------------------------------------------------------------------
// Authentication client
// ---------------------------------------------------------------------------

/// Env vars holding the backend credentials for unattended login.
pub const EMAIL_ENV: &str = "GREENHOUSE_EMAIL";
pub const SECRET_ENV: &str = "GREENHOUSE_SECRET";

/// Logs in and refreshes sessions against the backend's token endpoints.
#[derive(Clone)]
pub struct AuthClient {
    http: reqwest::Client,
    base_url: String,
    store: Arc<TokenStore>,
}

impl AuthClient {
    pub fn new(base_url: &str, store: Arc<TokenStore>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build auth http client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            store,
        })
    }

    /// Authenticate via `POST /get-token` and store the resulting tokens.
    pub async fn login(&self, email: &str, secret: &str) -> Result<()> {
        let email = email.trim();
        let secret = secret.trim();
        if email.is_empty() || secret.is_empty() {
            bail!("email and secret are required");
        }
        if !email.contains('@') {
            bail!("invalid email format");
        }

        let response = self
            .http
            .post(format!("{}/get-token", self.base_url))
            .json(&serde_json::json!({ "email": email, "password": secret }))
            .send()
            .await
            .context("login request failed")?;

        let status = response.status();
        let body = response.json::<Value>().await.unwrap_or(Value::Null);

        if status.as_u16() == 400 {
            bail!("{}", login_error_message(&body));
        }
        if status.is_server_error() {
            bail!("internal server error during login, try again later");
        }
        if !status.is_success() {
            bail!("login failed with status {status}");
        }

        let creds = extract_credentials(&body, None)
            .context("login response carried no access token")?;
        self.store.set(creds);
        tracing::info!("authenticated with backend");
        Ok(())
    }

    /// Exchange the stored refresh token for a fresh access token via
    /// `GET /get-new-token`.
    ///
    /// The store is updated on success and left untouched on failure —
    /// the caller decides whether a failed refresh means logout (HTTP
    /// interceptor) or just another retry cycle (stream reconnect).
    pub async fn refresh(&self) -> Result<()> {
        let Some(refresh_token) = self.store.refresh_token() else {
            bail!("no refresh token available, log in again");
        };

        let response = self
            .http
            .get(format!("{}/get-new-token", self.base_url))
            .bearer_auth(&refresh_token)
            .send()
            .await
            .context("token refresh request failed")?;

        let status = response.status();
        let body = response.json::<Value>().await.unwrap_or(Value::Null);

        if !status.is_success() {
            match data_message(&body) {
                Some("Invalid refresh token") => bail!("session expired, log in again"),
                Some("Refresh token is required") => bail!("no refresh token available, log in again"),
                Some(other) => bail!("token refresh rejected: {other}"),
                None => bail!("token refresh failed with status {status}"),
            }
        }

        let creds = extract_credentials(&body, Some(refresh_token))
            .context("refresh response carried no access token")?;
        self.store.set(creds);
        tracing::debug!("access token refreshed");
        Ok(())
    }

    /// Unattended login from env credentials, mirroring the dashboard's
    /// auto-login. Returns `false` (without error) when no credentials are
    /// configured; an already-authenticated store short-circuits to `true`.
    pub async fn login_from_env(&self) -> Result<bool> {
        if self.store.is_authenticated() {
            return Ok(true);
        }
        let (Ok(email), Ok(secret)) = (std::env::var(EMAIL_ENV), std::env::var(SECRET_ENV)) else {
            return Ok(false);
        };
        self.login(&email, &secret).await?;
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Response envelope helpers
// ---------------------------------------------------------------------------

/// Token endpoints answer `{ status, data: { jwtToken | token | accessToken,
/// refreshToken } }`, with `data` sometimes flattened away entirely.
fn extract_credentials(body: &Value, fallback_refresh: Option<String>) -> Option<Credentials> {
    let data = match body.get("data") {
        Some(d) if !d.is_null() => d,
        _ => body,
    };
    let access = ["jwtToken", "token", "accessToken"]
        .iter()
        .find_map(|k| data.get(*k))
        .and_then(Value::as_str)?
        .to_string();
    let refresh = data
        .get("refreshToken")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or(fallback_refresh);
    Some(Credentials {
        access_token: access,
        refresh_token: refresh,
    })
}

fn data_message(body: &Value) -> Option<&str> {
    body.get("data").and_then(Value::as_str)
}

fn login_error_message(body: &Value) -> String {
    match data_message(body) {
        Some("Invalid email format") => "invalid email format, check the address".to_string(),
        Some("Invalid credentials") => {
            "invalid credentials, verify the email and secret key".to_string()
        }
        Some("User not found") => "user not found, check the registered email".to_string(),
        Some("Email not verified") => "email not verified, verify it first".to_string(),
        Some(other) => format!("authentication failed: {other}"),
        None => "authentication failed, verify email and secret key".to_string(),
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn creds(access: &str, refresh: Option<&str>) -> Credentials {
        Credentials {
            access_token: access.into(),
            refresh_token: refresh.map(Into::into),
        }
    }

    async fn client_with(server: &MockServer, store: Arc<TokenStore>) -> AuthClient {
        AuthClient::new(&server.uri(), store, Duration::from_secs(5)).unwrap()
    }

    // -- TokenStore ---------------------------------------------------------

    #[test]
    fn in_memory_store_starts_empty() {
        let store = TokenStore::in_memory();
        assert!(!store.is_authenticated());
        assert_eq!(store.access_token(), None);
    }

    #[test]
    fn set_and_clear_round_trip() {
        let store = TokenStore::in_memory();
        store.set(creds("jwt-1", Some("ref-1")));
        assert!(store.is_authenticated());
        assert_eq!(store.access_token().as_deref(), Some("jwt-1"));
        assert_eq!(store.refresh_token().as_deref(), Some("ref-1"));

        store.clear();
        assert!(!store.is_authenticated());
        assert_eq!(store.access_token(), None);
    }

    #[test]
    fn cache_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");

        let store = TokenStore::with_cache(&path);
        store.set(creds("jwt-1", Some("ref-1")));
        assert!(path.exists());

        // A fresh store picks the cached credentials back up.
        let reloaded = TokenStore::with_cache(&path);
        assert_eq!(reloaded.access_token().as_deref(), Some("jwt-1"));
        assert_eq!(reloaded.refresh_token().as_deref(), Some("ref-1"));
    }

    #[test]
    fn clear_removes_cache_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");

        let store = TokenStore::with_cache(&path);
        store.set(creds("jwt-1", None));
        store.clear();
        assert!(!path.exists());
        assert!(!TokenStore::with_cache(&path).is_authenticated());
    }

    #[test]
    fn corrupt_cache_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        std::fs::write(&path, b"{not json").unwrap();
        assert!(!TokenStore::with_cache(&path).is_authenticated());
    }

    // -- login --------------------------------------------------------------

    #[tokio::test]
    async fn login_stores_tokens() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/get-token"))
            .and(body_json(json!({"email": "op@example.test", "password": "s3cret"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "Success",
                "data": { "jwtToken": "jwt-1", "refreshToken": "ref-1" }
            })))
            .mount(&server)
            .await;

        let store = Arc::new(TokenStore::in_memory());
        let auth = client_with(&server, Arc::clone(&store)).await;
        auth.login("op@example.test", "s3cret").await.unwrap();

        assert_eq!(store.access_token().as_deref(), Some("jwt-1"));
        assert_eq!(store.refresh_token().as_deref(), Some("ref-1"));
    }

    #[tokio::test]
    async fn login_accepts_alternate_token_keys() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/get-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": { "accessToken": "jwt-alt" }
            })))
            .mount(&server)
            .await;

        let store = Arc::new(TokenStore::in_memory());
        let auth = client_with(&server, Arc::clone(&store)).await;
        auth.login("op@example.test", "s3cret").await.unwrap();
        assert_eq!(store.access_token().as_deref(), Some("jwt-alt"));
        assert_eq!(store.refresh_token(), None);
    }

    #[tokio::test]
    async fn login_maps_invalid_credentials_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/get-token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "status": "Fail",
                "data": "Invalid credentials"
            })))
            .mount(&server)
            .await;

        let store = Arc::new(TokenStore::in_memory());
        let auth = client_with(&server, Arc::clone(&store)).await;
        let err = auth.login("op@example.test", "bad").await.unwrap_err();
        assert!(err.to_string().contains("invalid credentials"));
        assert!(!store.is_authenticated());
    }

    #[tokio::test]
    async fn login_rejects_malformed_email_client_side() {
        let server = MockServer::start().await;
        let auth = client_with(&server, Arc::new(TokenStore::in_memory())).await;
        let err = auth.login("not-an-email", "secret").await.unwrap_err();
        assert!(err.to_string().contains("invalid email format"));
        // No request should ever have been made.
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    // -- refresh ------------------------------------------------------------

    #[tokio::test]
    async fn refresh_updates_access_and_keeps_old_refresh_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/get-new-token"))
            .and(header("authorization", "Bearer ref-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "Success",
                "data": { "jwtToken": "jwt-2" }
            })))
            .mount(&server)
            .await;

        let store = Arc::new(TokenStore::in_memory());
        store.set(creds("jwt-1", Some("ref-1")));
        let auth = client_with(&server, Arc::clone(&store)).await;
        auth.refresh().await.unwrap();

        assert_eq!(store.access_token().as_deref(), Some("jwt-2"));
        // Response had no refreshToken, so the old one survives.
        assert_eq!(store.refresh_token().as_deref(), Some("ref-1"));
    }

    #[tokio::test]
    async fn refresh_without_refresh_token_fails_fast() {
        let server = MockServer::start().await;
        let auth = client_with(&server, Arc::new(TokenStore::in_memory())).await;
        let err = auth.refresh().await.unwrap_err();
        assert!(err.to_string().contains("no refresh token"));
    }

    #[tokio::test]
    async fn refresh_with_invalid_token_reports_expired_session() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/get-new-token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "status": "Fail",
                "data": "Invalid refresh token"
            })))
            .mount(&server)
            .await;

        let store = Arc::new(TokenStore::in_memory());
        store.set(creds("jwt-1", Some("ref-stale")));
        let auth = client_with(&server, Arc::clone(&store)).await;
        let err = auth.refresh().await.unwrap_err();
        assert!(err.to_string().contains("session expired"));
        // refresh() itself never clears the store; that policy lives with
        // the caller.
        assert!(store.is_authenticated());
    }

    // -- envelope parsing ----------------------------------------------------

    #[test]
    fn extract_credentials_handles_flat_body() {
        let body = json!({"token": "jwt-flat", "refreshToken": "ref-flat"});
        let c = extract_credentials(&body, None).unwrap();
        assert_eq!(c.access_token, "jwt-flat");
        assert_eq!(c.refresh_token.as_deref(), Some("ref-flat"));
    }

    #[test]
    fn extract_credentials_requires_access_token() {
        let body = json!({"data": {"refreshToken": "ref-only"}});
        assert!(extract_credentials(&body, None).is_none());
    }
}

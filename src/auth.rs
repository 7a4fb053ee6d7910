//! Identity toolkit REST client.
//!
//! Email/password accounts, sign-in with a Google or Apple ID token, token
//! refresh and password reset emails. Browser OAuth flows are out of scope;
//! callers obtain the provider ID token themselves.

use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::AuthError;

const IDENTITY_URL: &str = "https://identitytoolkit.googleapis.com/v1";
const TOKEN_URL: &str = "https://securetoken.googleapis.com/v1";
const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(20);

/// A signed-in user's tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthSession {
    pub user_id: String,
    pub email: Option<String>,
    pub id_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

impl AuthSession {
    /// Treat tokens within a minute of expiry as expired.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now + Duration::seconds(60) >= self.expires_at
    }

    /// `<data dir>/sitekeeper/session.json`
    pub fn default_path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("sitekeeper")
            .join("session.json")
    }

    /// Saved session, if one exists and parses.
    pub fn load(path: &Path) -> Option<Self> {
        let content = fs::read_to_string(path).ok()?;
        serde_json::from_str(&content).ok()
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        let content = serde_json::to_string_pretty(self).map_err(io::Error::other)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityProvider {
    Google,
    Apple,
}

impl IdentityProvider {
    pub fn provider_id(&self) -> &'static str {
        match self {
            IdentityProvider::Google => "google.com",
            IdentityProvider::Apple => "apple.com",
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignInResponse {
    local_id: String,
    #[serde(default)]
    email: Option<String>,
    id_token: String,
    refresh_token: String,
    expires_in: String,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    user_id: String,
    id_token: String,
    refresh_token: String,
    expires_in: String,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
}

pub struct AuthClient {
    client: Client,
    api_key: String,
    identity_url: String,
    token_url: String,
}

impl AuthClient {
    pub fn new(api_key: Option<&str>) -> Result<Self, AuthError> {
        Self::with_urls(api_key, IDENTITY_URL, TOKEN_URL)
    }

    /// Point at other endpoints, e.g. the auth emulator.
    pub fn with_urls(api_key: Option<&str>, identity_url: &str, token_url: &str) -> Result<Self, AuthError> {
        let api_key = api_key
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .ok_or(AuthError::MissingApiKey)?;
        Ok(AuthClient {
            client: Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
            api_key: api_key.to_string(),
            identity_url: identity_url.trim_end_matches('/').to_string(),
            token_url: token_url.trim_end_matches('/').to_string(),
        })
    }

    pub async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<AuthSession, AuthError> {
        let body = json!({ "email": email.trim(), "password": password, "returnSecureToken": true });
        let resp: SignInResponse = self.post_identity("accounts:signInWithPassword", &body).await?;
        tracing::info!(user = %resp.local_id, "signed in with password");
        session_from_sign_in(resp, Utc::now())
    }

    pub async fn sign_up(&self, email: &str, password: &str) -> Result<AuthSession, AuthError> {
        let body = json!({ "email": email.trim(), "password": password, "returnSecureToken": true });
        let resp: SignInResponse = self.post_identity("accounts:signUp", &body).await?;
        tracing::info!(user = %resp.local_id, "created account");
        session_from_sign_in(resp, Utc::now())
    }

    /// Exchange a provider-issued ID token for a session.
    pub async fn sign_in_with_id_token(&self, provider: IdentityProvider, id_token: &str) -> Result<AuthSession, AuthError> {
        let body = json!({
            "postBody": idp_post_body(provider, id_token),
            "requestUri": "http://localhost",
            "returnSecureToken": true,
            "returnIdpCredential": true,
        });
        let resp: SignInResponse = self.post_identity("accounts:signInWithIdp", &body).await?;
        tracing::info!(user = %resp.local_id, provider = provider.provider_id(), "signed in with identity provider");
        session_from_sign_in(resp, Utc::now())
    }

    pub async fn refresh(&self, refresh_token: &str) -> Result<AuthSession, AuthError> {
        let url = format!("{}/token?key={}", self.token_url, urlencoding::encode(&self.api_key));
        let resp = self
            .client
            .post(&url)
            .form(&[("grant_type", "refresh_token"), ("refresh_token", refresh_token)])
            .send()
            .await
            .map_err(|e| AuthError::Unavailable(e.to_string()))?;
        let refreshed: RefreshResponse = read_response(resp).await?;
        Ok(AuthSession {
            user_id: refreshed.user_id,
            email: None,
            id_token: refreshed.id_token,
            refresh_token: refreshed.refresh_token,
            expires_at: expiry(&refreshed.expires_in, Utc::now())?,
        })
    }

    pub async fn send_password_reset(&self, email: &str) -> Result<(), AuthError> {
        let body = json!({ "requestType": "PASSWORD_RESET", "email": email.trim() });
        let _: Value = self.post_identity("accounts:sendOobCode", &body).await?;
        Ok(())
    }

    async fn post_identity<T: DeserializeOwned>(&self, method: &str, body: &Value) -> Result<T, AuthError> {
        let url = format!("{}/{}?key={}", self.identity_url, method, urlencoding::encode(&self.api_key));
        let resp = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| AuthError::Unavailable(e.to_string()))?;
        read_response(resp).await
    }
}

async fn read_response<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, AuthError> {
    let status = resp.status();
    let text = resp
        .text()
        .await
        .map_err(|e| AuthError::Unavailable(e.to_string()))?;
    if !status.is_success() {
        return Err(error_from_body(status.as_u16(), &text));
    }
    serde_json::from_str(&text).map_err(|e| AuthError::Provider(format!("unexpected response: {}", e)))
}

fn error_from_body(status: u16, body: &str) -> AuthError {
    match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(envelope) if !envelope.error.message.is_empty() => AuthError::from_code(&envelope.error.message),
        _ => AuthError::Provider(format!("HTTP {}", status)),
    }
}

fn idp_post_body(provider: IdentityProvider, id_token: &str) -> String {
    format!(
        "id_token={}&providerId={}",
        urlencoding::encode(id_token),
        provider.provider_id()
    )
}

fn expiry(expires_in: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>, AuthError> {
    let secs: i64 = expires_in
        .trim()
        .parse()
        .map_err(|_| AuthError::Provider(format!("bad expiresIn '{}'", expires_in)))?;
    Ok(now + Duration::seconds(secs))
}

fn session_from_sign_in(resp: SignInResponse, now: DateTime<Utc>) -> Result<AuthSession, AuthError> {
    Ok(AuthSession {
        expires_at: expiry(&resp.expires_in, now)?,
        user_id: resp.local_id,
        email: resp.email,
        id_token: resp.id_token,
        refresh_token: resp.refresh_token,
    })
}

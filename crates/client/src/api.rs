// REST collaborators: token refresh and the presence endpoints.
//
// `HttpApi` is the production implementation of `RefreshClient` and
// `PresenceClient`. The refresh endpoint authenticates with the expiring
// bearer token plus the `refresh_token` cookie when one is known; a rotated
// cookie in the response replaces it, in memory and in the session store.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use reqwest::header::{COOKIE, SET_COOKIE};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use workshop_sync_common::types::PresenceUser;

use crate::auth::{Credential, CredentialError, RefreshClient, RefreshError};
use crate::config::{ConfigError, SyncConfig};
use crate::presence::{PingAck, PresenceClient};
use crate::store::SessionStore;

const REFRESH_COOKIE: &str = "refresh_token";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("http request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("server rejected the credential")]
    Unauthorized,

    #[error("unexpected status: {status} body={body}")]
    Status { status: StatusCode, body: String },

    #[error("invalid endpoint `{0}`")]
    Endpoint(String),

    #[error(transparent)]
    Token(#[from] CredentialError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Serialize)]
struct PingRequest<'a> {
    session_id: &'a str,
    client_type: &'a str,
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct LeaveRequest<'a> {
    session_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct LeaveResponse {
    #[allow(dead_code)]
    #[serde(default)]
    status: Option<String>,
}

// ── Client ──────────────────────────────────────────────────────────

pub struct HttpApi {
    http: Client,
    base: Url,
    refresh_cookie: Mutex<Option<String>>,
    session: Option<Arc<dyn SessionStore>>,
}

impl HttpApi {
    /// `timeout` bounds each request end to end, so a stalled server surfaces
    /// as an error instead of a hung task.
    pub fn new(base: Url, timeout: Duration) -> Result<Self, ApiError> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self { http, base, refresh_cookie: Mutex::new(None), session: None })
    }

    pub fn from_config(config: &SyncConfig) -> Result<Self, ApiError> {
        Self::new(config.api_base()?, config.http.request_timeout())
    }

    /// Read the refresh cookie from `store` before each refresh and write
    /// rotations back to it.
    pub fn with_session_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.session = Some(store);
        self
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    fn lock_cookie(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        self.refresh_cookie.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // With a store attached it is authoritative: another process may have
    // replaced the cookie, and logout clears it there. Memory only covers an
    // unreadable store.
    fn current_refresh_cookie(&self) -> Option<String> {
        if let Some(store) = &self.session {
            match store.load_refresh_cookie() {
                Ok(cookie) => return cookie,
                Err(error) => warn!(error = %error, "failed to load refresh cookie"),
            }
        }
        self.lock_cookie().clone()
    }

    fn remember_refresh_cookie(&self, cookie: String) {
        if let Some(store) = &self.session {
            if let Err(error) = store.save_refresh_cookie(Some(&cookie)) {
                warn!(error = %error, "failed to persist rotated refresh cookie");
            }
        }
        *self.lock_cookie() = Some(cookie);
    }

    fn endpoint(&self, path: &str) -> Result<Url, ApiError> {
        self.base.join(path).map_err(|_| ApiError::Endpoint(path.to_string()))
    }

    /// Exchange `token` for a fresh access token.
    pub async fn refresh_token(&self, token: &str) -> Result<Credential, ApiError> {
        let mut request = self.http.post(self.endpoint("/api/auth/refresh")?).bearer_auth(token);
        if let Some(cookie) = self.current_refresh_cookie() {
            request = request.header(COOKIE, format!("{REFRESH_COOKIE}={cookie}"));
        }
        let response = request.send().await?;
        if let Some(rotated) = rotated_refresh_cookie(&response) {
            debug!("refresh cookie rotated");
            self.remember_refresh_cookie(rotated);
        }
        let body: TokenResponse = decode(response).await?;
        Ok(Credential::from_token(body.access_token)?)
    }

    pub async fn ping_presence(
        &self,
        token: &str,
        session_id: &str,
        client_type: &str,
    ) -> Result<PingAck, ApiError> {
        let body = PingRequest { session_id, client_type, status: "online" };
        let response = self
            .http
            .post(self.endpoint("/api/online/ping")?)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?;
        decode(response).await
    }

    pub async fn leave_presence(&self, token: &str, session_id: &str) -> Result<(), ApiError> {
        let response = self
            .http
            .post(self.endpoint("/api/online/leave")?)
            .bearer_auth(token)
            .json(&LeaveRequest { session_id })
            .send()
            .await?;
        decode::<LeaveResponse>(response).await.map(|_| ())
    }

    pub async fn fetch_online_users(&self, token: &str) -> Result<Vec<PresenceUser>, ApiError> {
        let response =
            self.http.get(self.endpoint("/api/online/users")?).bearer_auth(token).send().await?;
        decode(response).await
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ApiError> {
    let status = response.status();
    if status == StatusCode::UNAUTHORIZED {
        return Err(ApiError::Unauthorized);
    }
    if status.is_success() {
        Ok(response.json::<T>().await?)
    } else {
        let body = response.text().await.unwrap_or_default();
        Err(ApiError::Status { status, body })
    }
}

fn rotated_refresh_cookie(response: &Response) -> Option<String> {
    response
        .headers()
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .find_map(|value| cookie_value(value, REFRESH_COOKIE))
}

/// Value of `name` in a `Set-Cookie` header, ignoring attributes. An empty
/// value (the server clearing the cookie) yields `None`.
fn cookie_value(header: &str, name: &str) -> Option<String> {
    let pair = header.split(';').next()?.trim();
    let (key, value) = pair.split_once('=')?;
    let value = value.trim().trim_matches('"');
    (key.trim() == name && !value.is_empty()).then(|| value.to_string())
}

// ── Trait impls ─────────────────────────────────────────────────────

impl RefreshClient for HttpApi {
    async fn refresh(&self, token: String) -> Result<Credential, RefreshError> {
        self.refresh_token(&token).await.map_err(|error| match error {
            ApiError::Unauthorized => RefreshError::Invalid,
            other => RefreshError::Transient(other.to_string()),
        })
    }
}

impl PresenceClient for HttpApi {
    async fn ping(
        &self,
        token: &str,
        session_id: &str,
        client_type: &str,
    ) -> Result<PingAck, ApiError> {
        self.ping_presence(token, session_id, client_type).await
    }

    async fn leave(&self, token: &str, session_id: &str) -> Result<(), ApiError> {
        self.leave_presence(token, session_id).await
    }

    async fn online_users(&self, token: &str) -> Result<Vec<PresenceUser>, ApiError> {
        self.fetch_online_users(token).await
    }
}

//! Remote Backend Client - table-oriented REST access
//!
//! The queue only needs a generic "write this row to that table" capability
//! plus auth/connectivity signals, expressed by the `RemoteBackend` trait.
//! `RestBackendClient` implements it against a PostgREST-style server:
//! - Row insert/update/delete by table name
//! - Session validation and token refresh
//! - Connectivity state published over a watch channel

use super::models::{payload_to_json, ConnectionState, Payload};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, RwLock};
use url::Url;

/// Refresh the access token when it expires within this window
const REFRESH_MARGIN_SECS: i64 = 60;
const REQUEST_TIMEOUT_SECS: u64 = 30;

// ============================================================================
// Backend Abstraction
// ============================================================================

/// Capabilities the sync queue consumes from the remote backend
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Subscribe to authentication/connectivity changes
    fn connection_state(&self) -> watch::Receiver<ConnectionState>;

    fn is_authenticated(&self) -> bool {
        self.connection_state().borrow().authenticated
    }

    fn is_connected(&self) -> bool {
        self.connection_state().borrow().connected
    }

    fn is_online(&self) -> bool {
        self.connection_state().borrow().is_online()
    }

    /// Validate the session, refreshing it if needed
    async fn ensure_valid_token(&self) -> Result<(), RemoteError>;

    async fn insert(&self, table: &str, row: &Payload) -> Result<(), RemoteError>;

    async fn update(&self, table: &str, row: &Payload, matching_id: &str) -> Result<(), RemoteError>;

    async fn delete(&self, table: &str, matching_id: &str) -> Result<(), RemoteError>;
}

// ============================================================================
// REST Client
// ============================================================================

/// Authenticated session tokens
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn new(access_token: String, refresh_token: String, expires_in_secs: i64) -> Self {
        Self {
            access_token,
            refresh_token,
            expires_at: Utc::now() + Duration::seconds(expires_in_secs),
        }
    }

    fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_at - now <= Duration::seconds(REFRESH_MARGIN_SECS)
    }
}

/// REST client for the planner backend
pub struct RestBackendClient {
    client: Client,
    base_url: Url,
    api_key: String,
    session: RwLock<Option<Session>>,
    state: watch::Sender<ConnectionState>,
}

impl RestBackendClient {
    /// Create new client; no session yet, network assumed reachable
    pub fn new(base_url: &str, api_key: impl Into<String>) -> Result<Self, RemoteError> {
        let mut base_url = Url::parse(base_url)?;
        // `Url::join` replaces the last segment unless the path ends in '/'
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        let (state, _) = watch::channel(ConnectionState {
            authenticated: false,
            connected: true,
        });

        Ok(Self {
            client,
            base_url,
            api_key: api_key.into(),
            session: RwLock::new(None),
            state,
        })
    }

    /// Install session tokens (after sign-in)
    pub async fn set_session(&self, session: Session) {
        *self.session.write().await = Some(session);
        self.state.send_modify(|state| state.authenticated = true);
    }

    /// Current session, if any
    pub async fn session(&self) -> Option<Session> {
        self.session.read().await.clone()
    }

    /// Drop session tokens (sign-out or rejected refresh)
    pub async fn clear_session(&self) {
        *self.session.write().await = None;
        self.state.send_modify(|state| state.authenticated = false);
    }

    /// Report network reachability (from an OS/network monitor)
    pub fn set_connected(&self, connected: bool) {
        self.state.send_if_modified(|state| {
            let changed = state.connected != connected;
            state.connected = connected;
            changed
        });
    }

    /// Check whether the server answers at all and update connectivity
    pub async fn probe_connectivity(&self) -> bool {
        let reachable = match self.endpoint("auth/v1/health") {
            Ok(url) => self
                .client
                .get(url)
                .header("apikey", &self.api_key)
                .send()
                .await
                .is_ok(),
            Err(_) => false,
        };

        if reachable != self.is_connected() {
            log::info!("Backend connectivity changed: reachable={}", reachable);
        }
        self.set_connected(reachable);
        reachable
    }

    fn endpoint(&self, path: &str) -> Result<Url, RemoteError> {
        Ok(self.base_url.join(path)?)
    }

    fn table_url(&self, table: &str, matching_id: Option<&str>) -> Result<Url, RemoteError> {
        let mut url = self.endpoint(&format!("rest/v1/{}", table))?;
        if let Some(id) = matching_id {
            url.query_pairs_mut().append_pair("id", &format!("eq.{}", id));
        }
        Ok(url)
    }

    async fn authorized(&self, method: Method, url: Url) -> Result<RequestBuilder, RemoteError> {
        let token = self
            .session
            .read()
            .await
            .as_ref()
            .map(|s| s.access_token.clone())
            .ok_or(RemoteError::Unauthorized)?;

        Ok(self
            .client
            .request(method, url)
            .header("apikey", &self.api_key)
            .header("Prefer", "return=minimal")
            .bearer_auth(token))
    }

    async fn send(&self, request: RequestBuilder) -> Result<(), RemoteError> {
        match request.send().await {
            Ok(response) => {
                self.set_connected(true);
                check_status(response).await
            }
            Err(e) => {
                if e.is_connect() {
                    log::warn!("Backend unreachable: {}", e);
                    self.set_connected(false);
                }
                Err(e.into())
            }
        }
    }

    async fn refresh(&self, refresh_token: &str) -> Result<Session, RemoteError> {
        let mut url = self.endpoint("auth/v1/token")?;
        url.query_pairs_mut().append_pair("grant_type", "refresh_token");

        let response = self
            .client
            .post(url)
            .header("apikey", &self.api_key)
            .json(&RefreshRequest {
                refresh_token: refresh_token.to_string(),
            })
            .send()
            .await?;

        let auth: AuthResponse = handle_response(response).await?;
        Ok(Session::new(auth.access_token, auth.refresh_token, auth.expires_in))
    }
}

#[async_trait]
impl RemoteBackend for RestBackendClient {
    fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    fn is_authenticated(&self) -> bool {
        self.state.borrow().authenticated
    }

    fn is_connected(&self) -> bool {
        self.state.borrow().connected
    }

    fn is_online(&self) -> bool {
        self.state.borrow().is_online()
    }

    async fn ensure_valid_token(&self) -> Result<(), RemoteError> {
        let session = self.session().await.ok_or(RemoteError::Unauthorized)?;

        if !session.needs_refresh(Utc::now()) {
            return Ok(());
        }

        log::info!("Access token expires at {}, refreshing", session.expires_at);

        match self.refresh(&session.refresh_token).await {
            Ok(refreshed) => {
                *self.session.write().await = Some(refreshed);
                Ok(())
            }
            Err(e @ (RemoteError::Unauthorized | RemoteError::Forbidden)) => {
                log::warn!("Session refresh rejected, signing out: {}", e);
                self.clear_session().await;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    async fn insert(&self, table: &str, row: &Payload) -> Result<(), RemoteError> {
        let url = self.table_url(table, None)?;
        let request = self.authorized(Method::POST, url).await?.json(&payload_to_json(row));
        self.send(request).await
    }

    async fn update(&self, table: &str, row: &Payload, matching_id: &str) -> Result<(), RemoteError> {
        let url = self.table_url(table, Some(matching_id))?;
        let request = self.authorized(Method::PATCH, url).await?.json(&payload_to_json(row));
        self.send(request).await
    }

    async fn delete(&self, table: &str, matching_id: &str) -> Result<(), RemoteError> {
        let url = self.table_url(table, Some(matching_id))?;
        let request = self.authorized(Method::DELETE, url).await?;
        self.send(request).await
    }
}

// ============================================================================
// API Request/Response Types
// ============================================================================

#[derive(Debug, Clone, Serialize)]
struct RefreshRequest {
    refresh_token: String,
}

#[derive(Debug, Clone, Deserialize)]
struct AuthResponse {
    access_token: String,
    refresh_token: String,
    expires_in: i64,
}

// ============================================================================
// Error Handling
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Invalid backend URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Unauthorized - sign-in required")]
    Unauthorized,

    #[error("Forbidden")]
    Forbidden,

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Invalid response from server")]
    InvalidResponse,

    #[error("Payload has no record id")]
    MissingRecordId,

    #[error("Attempt aborted: {0}")]
    AttemptAborted(String),
}

/// Accept any 2xx, map the rest
async fn check_status(response: reqwest::Response) -> Result<(), RemoteError> {
    if response.status().is_success() {
        Ok(())
    } else {
        Err(handle_error(response).await)
    }
}

/// Handle successful JSON response
async fn handle_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, RemoteError> {
    if response.status().is_success() {
        response.json::<T>().await
            .map_err(|_| RemoteError::InvalidResponse)
    } else {
        Err(handle_error(response).await)
    }
}

/// Convert error response to RemoteError
async fn handle_error(response: reqwest::Response) -> RemoteError {
    let status = response.status();

    match status {
        StatusCode::UNAUTHORIZED => RemoteError::Unauthorized,
        StatusCode::FORBIDDEN => RemoteError::Forbidden,
        StatusCode::TOO_MANY_REQUESTS => RemoteError::RateLimitExceeded,
        StatusCode::CONFLICT => {
            let msg = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            RemoteError::Conflict(msg)
        }
        _ if status.is_server_error() => {
            let msg = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            RemoteError::ServerError(format!("{}: {}", status, msg))
        }
        _ => {
            let msg = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            RemoteError::Http(format!("{}: {}", status, msg))
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::models::PayloadValue;
    use mockito::{Matcher, Server};

    fn row() -> Payload {
        let mut row = Payload::new();
        row.insert("id".into(), "evt-1".into());
        row.insert("title".into(), "Exam".into());
        row.insert("all_day".into(), PayloadValue::Bool(false));
        row
    }

    async fn signed_in_client(server: &Server) -> RestBackendClient {
        let client = RestBackendClient::new(&server.url(), "anon-key").unwrap();
        client
            .set_session(Session::new("access-1".into(), "refresh-1".into(), 3600))
            .await;
        client
    }

    #[tokio::test]
    async fn test_client_state_tracks_session() {
        let client = RestBackendClient::new("http://localhost:54321", "key").unwrap();
        assert!(!client.is_authenticated());
        assert!(client.is_connected());

        client
            .set_session(Session::new("a".into(), "r".into(), 3600))
            .await;
        assert!(client.is_online());

        client.set_connected(false);
        assert!(!client.is_online());

        client.clear_session().await;
        assert!(!client.is_authenticated());
        assert!(client.session().await.is_none());
    }

    #[tokio::test]
    async fn test_insert_posts_row() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/rest/v1/events")
            .match_header("apikey", "anon-key")
            .match_header("authorization", "Bearer access-1")
            .match_header("prefer", "return=minimal")
            .match_body(Matcher::Json(serde_json::json!({
                "id": "evt-1",
                "title": "Exam",
                "all_day": false
            })))
            .with_status(201)
            .create_async()
            .await;

        let client = signed_in_client(&server).await;
        client.insert("events", &row()).await.unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_update_and_delete_match_id() {
        let mut server = Server::new_async().await;
        let update = server
            .mock("PATCH", Matcher::Regex(r"^/rest/v1/events".to_string()))
            .match_query(Matcher::UrlEncoded("id".into(), "eq.evt-1".into()))
            .with_status(204)
            .create_async()
            .await;
        let delete = server
            .mock("DELETE", Matcher::Regex(r"^/rest/v1/events".to_string()))
            .match_query(Matcher::UrlEncoded("id".into(), "eq.evt-1".into()))
            .with_status(204)
            .create_async()
            .await;

        let client = signed_in_client(&server).await;
        client.update("events", &row(), "evt-1").await.unwrap();
        client.delete("events", "evt-1").await.unwrap();

        update.assert_async().await;
        delete.assert_async().await;
    }

    #[tokio::test]
    async fn test_base_url_with_path_prefix() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/planner/rest/v1/courses")
            .with_status(201)
            .create_async()
            .await;

        let client = RestBackendClient::new(&format!("{}/planner", server.url()), "anon-key").unwrap();
        client
            .set_session(Session::new("access-1".into(), "refresh-1".into(), 3600))
            .await;
        client.insert("courses", &row()).await.unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_error_status_mapping() {
        let mut server = Server::new_async().await;
        let _server_error = server
            .mock("POST", "/rest/v1/events")
            .with_status(503)
            .with_body("maintenance")
            .create_async()
            .await;
        let _unauthorized = server
            .mock("POST", "/rest/v1/courses")
            .with_status(401)
            .create_async()
            .await;
        let _bad_request = server
            .mock("POST", "/rest/v1/schedules")
            .with_status(400)
            .with_body("bad column")
            .create_async()
            .await;

        let client = signed_in_client(&server).await;

        let err = client.insert("events", &row()).await.unwrap_err();
        assert!(matches!(err, RemoteError::ServerError(ref msg) if msg.contains("maintenance")));

        let err = client.insert("courses", &row()).await.unwrap_err();
        assert!(matches!(err, RemoteError::Unauthorized));

        let err = client.insert("schedules", &row()).await.unwrap_err();
        assert!(matches!(err, RemoteError::Http(ref msg) if msg.contains("bad column")));
    }

    #[tokio::test]
    async fn test_requests_require_session() {
        let client = RestBackendClient::new("http://localhost:54321", "key").unwrap();

        let err = client.insert("events", &row()).await.unwrap_err();
        assert!(matches!(err, RemoteError::Unauthorized));

        let err = client.ensure_valid_token().await.unwrap_err();
        assert!(matches!(err, RemoteError::Unauthorized));
    }

    #[tokio::test]
    async fn test_valid_token_skips_refresh() {
        let mut server = Server::new_async().await;
        let refresh = server
            .mock("POST", Matcher::Regex(r"^/auth/v1/token".to_string()))
            .expect(0)
            .create_async()
            .await;

        let client = signed_in_client(&server).await;
        client.ensure_valid_token().await.unwrap();

        refresh.assert_async().await;
    }

    #[tokio::test]
    async fn test_expiring_token_is_refreshed() {
        let mut server = Server::new_async().await;
        let refresh = server
            .mock("POST", Matcher::Regex(r"^/auth/v1/token".to_string()))
            .match_query(Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()))
            .match_body(Matcher::Json(serde_json::json!({ "refresh_token": "refresh-1" })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{
                "access_token": "access-2",
                "refresh_token": "refresh-2",
                "expires_in": 3600,
                "token_type": "bearer"
            }"#)
            .create_async()
            .await;

        let client = RestBackendClient::new(&server.url(), "anon-key").unwrap();
        client
            .set_session(Session::new("access-1".into(), "refresh-1".into(), 10))
            .await;

        client.ensure_valid_token().await.unwrap();

        refresh.assert_async().await;
        let session = client.session().await.unwrap();
        assert_eq!(session.access_token, "access-2");
        assert_eq!(session.refresh_token, "refresh-2");
    }

    #[tokio::test]
    async fn test_rejected_refresh_signs_out() {
        let mut server = Server::new_async().await;
        let _refresh = server
            .mock("POST", Matcher::Regex(r"^/auth/v1/token".to_string()))
            .with_status(401)
            .create_async()
            .await;

        let client = RestBackendClient::new(&server.url(), "anon-key").unwrap();
        client
            .set_session(Session::new("access-1".into(), "refresh-1".into(), 0))
            .await;

        let err = client.ensure_valid_token().await.unwrap_err();
        assert!(matches!(err, RemoteError::Unauthorized));
        assert!(!client.is_authenticated());
    }

    #[tokio::test]
    async fn test_probe_connectivity() {
        let mut server = Server::new_async().await;
        let _health = server
            .mock("GET", "/auth/v1/health")
            .with_status(200)
            .create_async()
            .await;

        let client = RestBackendClient::new(&server.url(), "anon-key").unwrap();
        client.set_connected(false);

        assert!(client.probe_connectivity().await);
        assert!(client.is_connected());
    }
}

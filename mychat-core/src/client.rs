//! Authenticated REST API client
//!
//! Every request carries `Authorization: Bearer <access>` when an access
//! token is stored. Responses are classified by their envelope:
//! - code 200: the `data` payload is decoded and returned
//! - HTTP 401, code 401, code 40001: the access token has expired; the
//!   client refreshes it (once, shared across concurrent callers) and replays
//!   the request a single time
//! - anything else: [`ClientError::Business`] carrying code and message

use std::sync::Arc;

use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::ClientConfig;
use crate::credentials::{CredentialStore, TokenPair};
use crate::envelope::{ApiResponse, Verdict, classify};
use crate::error::{ClientError, RefreshError};
use crate::refresh::{RefreshCoordinator, RefreshOutcome};

/// Login response data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResponse {
    pub token: String,
    pub refresh_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RefreshData {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
}

/// Authenticated API client.
///
/// Cheap to clone; clones share the HTTP connection pool, the credential
/// store and the refresh coordinator.
#[derive(Clone)]
pub struct ApiClient {
    inner: Arc<Inner>,
}

struct Inner {
    http: Client,
    base_url: String,
    refresh_path: String,
    store: Arc<dyn CredentialStore>,
    refresh: RefreshCoordinator,
}

/// First attempt and the single replay after a refresh
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    Initial,
    Replay,
}

impl ApiClient {
    /// Create a client from configuration
    pub fn new(config: &ClientConfig, store: Arc<dyn CredentialStore>) -> Result<Self, ClientError> {
        let http = Client::builder().timeout(config.request_timeout()).build()?;

        Ok(Self {
            inner: Arc::new(Inner {
                http,
                base_url: config.api_base_url.trim_end_matches('/').to_string(),
                refresh_path: config.refresh_path.clone(),
                store,
                refresh: RefreshCoordinator::new(),
            }),
        })
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.store.access_token().is_some()
    }

    /// Send a request and return the decoded `data` of a successful envelope
    pub async fn send<B, T>(&self, method: Method, path: &str, body: Option<&B>) -> Result<T, ClientError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let data = self.send_value(method, path, body).await?;
        serde_json::from_value(data).map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        self.send::<(), T>(Method::GET, path, None).await
    }

    pub async fn post<B, T>(&self, path: &str, body: &B) -> Result<T, ClientError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.send(Method::POST, path, Some(body)).await
    }

    /// Log in and store the returned token pair
    pub async fn login(&self, telephone: &str, password: &str) -> Result<LoginResponse, ClientError> {
        #[derive(Serialize)]
        struct LoginRequest<'a> {
            telephone: &'a str,
            password: &'a str,
        }

        let resp: LoginResponse = self
            .post("/login", &LoginRequest { telephone, password })
            .await?;

        self.inner
            .store
            .set_tokens(TokenPair::new(resp.token.clone(), resp.refresh_token.clone()));
        tracing::info!("Logged in as {}", telephone);
        Ok(resp)
    }

    /// Create a new account
    pub async fn register(&self, telephone: &str, password: &str, nickname: &str) -> Result<(), ClientError> {
        #[derive(Serialize)]
        struct RegisterRequest<'a> {
            telephone: &'a str,
            password: &'a str,
            nickname: &'a str,
        }

        let _: Value = self
            .post(
                "/register",
                &RegisterRequest {
                    telephone,
                    password,
                    nickname,
                },
            )
            .await?;
        Ok(())
    }

    /// Forget all stored credentials
    pub fn logout(&self) {
        self.inner.store.clear();
        tracing::info!("Logged out, credentials cleared");
    }

    // Private helpers

    async fn send_value<B>(&self, method: Method, path: &str, body: Option<&B>) -> Result<Value, ClientError>
    where
        B: Serialize + ?Sized,
    {
        let (code, message) = match self.execute(&method, path, body, Attempt::Initial).await? {
            Verdict::Success(data) => return Ok(data),
            Verdict::Failed(err) => return Err(err),
            Verdict::AuthExpired { code, message } => (code, message),
        };

        tracing::debug!("{} {} needs token refresh (code {}: {})", method, path, code, message);
        self.refresh_tokens().await?;

        match self.execute(&method, path, body, Attempt::Replay).await? {
            Verdict::Success(data) => Ok(data),
            Verdict::Failed(err) => Err(err),
            Verdict::AuthExpired { code, message } => Err(ClientError::Unauthorized { code, message }),
        }
    }

    async fn execute<B>(
        &self,
        method: &Method,
        path: &str,
        body: Option<&B>,
        attempt: Attempt,
    ) -> Result<Verdict, ClientError>
    where
        B: Serialize + ?Sized,
    {
        let url = format!("{}{}", self.inner.base_url, path);
        let mut req = self.authed_request(method.clone(), &url);
        if let Some(body) = body {
            req = req.json(body);
        }

        tracing::debug!("{} {} ({:?})", method, url, attempt);
        let resp = req.send().await.map_err(transport_error)?;
        let status = resp.status();
        let bytes = resp.bytes().await.map_err(transport_error)?;

        Ok(classify(status, &bytes))
    }

    async fn refresh_tokens(&self) -> Result<(), ClientError> {
        let inner = Arc::clone(&self.inner);
        self.inner
            .refresh
            .refresh(move || async move { inner.exchange_refresh_token().await })
            .await
            .map_err(ClientError::from)
    }

    fn authed_request(&self, method: Method, url: &str) -> reqwest::RequestBuilder {
        let mut req = self.inner.http.request(method, url);

        if let Some(token) = self.inner.store.access_token() {
            req = req.bearer_auth(token);
        }

        req
    }
}

impl Inner {
    /// The refresh exchange itself: unauthenticated POST of the refresh token.
    /// Writes the new pair to the store on success.
    async fn exchange_refresh_token(&self) -> RefreshOutcome {
        let Some(refresh_token) = self.store.refresh_token() else {
            tracing::warn!("Access token expired but no refresh token is stored");
            return Err(RefreshError::MissingRefreshToken);
        };

        #[derive(Serialize)]
        struct RefreshRequest<'a> {
            refresh_token: &'a str,
        }

        let url = format!("{}{}", self.base_url, self.refresh_path);
        tracing::debug!("POST {} (token refresh)", url);

        let result = self
            .http
            .post(&url)
            .json(&RefreshRequest {
                refresh_token: &refresh_token,
            })
            .send()
            .await;
        let resp = match result {
            Ok(resp) => resp,
            Err(e) => return Err(refresh_transport_error(e)),
        };
        let bytes = match resp.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => return Err(refresh_transport_error(e)),
        };
        // Rejections carry `"data": null`, so the code is checked before the payload
        let envelope: ApiResponse<Option<RefreshData>> = match serde_json::from_slice(&bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!("Token refresh response is not an envelope: {}", e);
                return Err(RefreshError::InvalidResponse(e.to_string()));
            }
        };

        if !envelope.is_ok() {
            tracing::warn!("Token refresh rejected: {} {}", envelope.code, envelope.message);
            let message = if envelope.message.is_empty() {
                "refresh failed".to_string()
            } else {
                envelope.message
            };
            return Err(RefreshError::Rejected {
                code: envelope.code,
                message,
            });
        }

        let data = envelope.data.unwrap_or_default();
        let access = data.access_token.unwrap_or_default();
        let refresh = data.refresh_token.unwrap_or_default();
        if access.is_empty() || refresh.is_empty() {
            tracing::warn!("Token refresh response missing tokens");
            return Err(RefreshError::IncompleteTokens);
        }

        self.store.set_tokens(TokenPair::new(access, refresh));
        tracing::info!("Access token refreshed");
        Ok(())
    }
}

fn transport_error(err: reqwest::Error) -> ClientError {
    if err.is_timeout() {
        ClientError::Timeout
    } else {
        ClientError::Transport(err)
    }
}

fn refresh_transport_error(err: reqwest::Error) -> RefreshError {
    tracing::warn!("Token refresh request failed: {}", err);
    if err.is_timeout() {
        RefreshError::Timeout
    } else {
        RefreshError::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::json;

    use crate::credentials::MemoryCredentialStore;

    /// Scripted stand-in for the chat API
    #[derive(Default)]
    struct MockApi {
        /// Access token the protected routes accept
        valid_access: Mutex<String>,
        /// Refresh envelope to return; `None` issues a new pair
        refresh_reply: Mutex<Option<Value>>,
        refresh_calls: AtomicUsize,
        profile_calls: AtomicUsize,
        seen_auth: Mutex<Vec<Option<String>>>,
        refresh_delay_ms: u64,
    }

    type Shared = Arc<MockApi>;

    fn bearer(headers: &HeaderMap) -> Option<String> {
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::to_string)
    }

    async fn profile(State(api): State<Shared>, headers: HeaderMap) -> Json<Value> {
        api.profile_calls.fetch_add(1, Ordering::SeqCst);
        let token = bearer(&headers);
        api.seen_auth.lock().unwrap().push(token.clone());

        if token.as_deref() == Some(api.valid_access.lock().unwrap().as_str()) {
            Json(json!({"code": 200, "message": "ok", "data": {"nickname": "alice"}}))
        } else {
            Json(json!({"code": 401, "message": "token expired", "data": null}))
        }
    }

    async fn expired_status(State(api): State<Shared>, headers: HeaderMap) -> impl IntoResponse {
        if bearer(&headers).as_deref() == Some(api.valid_access.lock().unwrap().as_str()) {
            (StatusCode::OK, Json(json!({"code": 200, "message": "ok", "data": 7})))
        } else {
            (StatusCode::UNAUTHORIZED, Json(json!({"code": 40001, "message": "refresh"})))
        }
    }

    async fn always_expired() -> Json<Value> {
        Json(json!({"code": 40001, "message": "token needs refresh"}))
    }

    async fn business_error() -> Json<Value> {
        Json(json!({"code": 30401, "message": "Group not found", "data": null}))
    }

    async fn slow() -> Json<Value> {
        tokio::time::sleep(Duration::from_millis(500)).await;
        Json(json!({"code": 200, "message": "ok", "data": null}))
    }

    async fn login(Json(body): Json<Value>) -> Json<Value> {
        if body["password"] == "secret" {
            Json(json!({"code": 200, "message": "ok", "data": {"token": "a1", "refresh_token": "r1"}}))
        } else {
            Json(json!({"code": 20102, "message": "Incorrect password", "data": null}))
        }
    }

    async fn refresh(State(api): State<Shared>, Json(body): Json<Value>) -> Json<Value> {
        let n = api.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(Duration::from_millis(api.refresh_delay_ms)).await;

        if let Some(reply) = api.refresh_reply.lock().unwrap().clone() {
            return Json(reply);
        }
        assert!(body["refresh_token"].as_str().is_some_and(|t| t.starts_with('r')));

        let access = format!("a{}", n + 1);
        *api.valid_access.lock().unwrap() = access.clone();
        Json(json!({
            "code": 200,
            "message": "ok",
            "data": {"access_token": access, "refresh_token": format!("r{}", n + 1)}
        }))
    }

    async fn spawn_api(api: Shared) -> String {
        let app = Router::new()
            .route("/api/v1/profile", get(profile))
            .route("/api/v1/status-expired", get(expired_status))
            .route("/api/v1/always-expired", get(always_expired))
            .route("/api/v1/group/getGroupInfo", post(business_error))
            .route("/api/v1/slow", get(slow))
            .route("/api/v1/login", post(login))
            .route("/api/v1/refresh-token", post(refresh))
            .with_state(api);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/api/v1")
    }

    fn client_for(base_url: String, store: Arc<MemoryCredentialStore>) -> ApiClient {
        let config = ClientConfig {
            api_base_url: base_url,
            request_timeout_ms: 200,
            ..ClientConfig::default()
        };
        ApiClient::new(&config, store).unwrap()
    }

    fn mock(valid_access: &str, refresh_delay_ms: u64) -> Shared {
        let api = MockApi {
            refresh_delay_ms,
            ..MockApi::default()
        };
        *api.valid_access.lock().unwrap() = valid_access.to_string();
        Arc::new(api)
    }

    #[tokio::test]
    async fn test_success_performs_no_refresh() {
        let api = mock("a1", 0);
        let store = Arc::new(MemoryCredentialStore::with_tokens(TokenPair::new("a1", "r1")));
        let client = client_for(spawn_api(Arc::clone(&api)).await, Arc::clone(&store));

        let data: Value = client.get("/profile").await.unwrap();

        assert_eq!(data, json!({"nickname": "alice"}));
        assert_eq!(api.refresh_calls.load(Ordering::SeqCst), 0);
        assert_eq!(api.seen_auth.lock().unwrap().as_slice(), &[Some("a1".to_string())]);
    }

    #[tokio::test]
    async fn test_parallel_expiry_triggers_single_refresh() {
        let api = mock("a2", 100);
        let store = Arc::new(MemoryCredentialStore::with_tokens(TokenPair::new("a1", "r1")));
        let client = client_for(spawn_api(Arc::clone(&api)).await, Arc::clone(&store));

        let (x, y, z) = tokio::join!(
            client.get::<Value>("/profile"),
            client.get::<Value>("/profile"),
            client.get::<Value>("/profile"),
        );

        for result in [x, y, z] {
            assert_eq!(result.unwrap(), json!({"nickname": "alice"}));
        }
        assert_eq!(api.refresh_calls.load(Ordering::SeqCst), 1);
        assert_eq!(api.profile_calls.load(Ordering::SeqCst), 6);
        assert_eq!(store.access_token().as_deref(), Some("a2"));
        assert_eq!(store.refresh_token().as_deref(), Some("r2"));

        // Three stale attempts followed by three replays with the new token.
        let seen = api.seen_auth.lock().unwrap().clone();
        assert_eq!(seen.iter().filter(|t| t.as_deref() == Some("a1")).count(), 3);
        assert_eq!(seen.iter().filter(|t| t.as_deref() == Some("a2")).count(), 3);
    }

    #[tokio::test]
    async fn test_http_401_status_triggers_refresh() {
        let api = mock("a2", 0);
        let store = Arc::new(MemoryCredentialStore::with_tokens(TokenPair::new("a1", "r1")));
        let client = client_for(spawn_api(Arc::clone(&api)).await, store);

        let data: i64 = client.get("/status-expired").await.unwrap();

        assert_eq!(data, 7);
        assert_eq!(api.refresh_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refresh_failure_reaches_every_waiter() {
        let api = mock("never", 100);
        *api.refresh_reply.lock().unwrap() =
            Some(json!({"code": 20101, "message": "Token invalid", "data": null}));
        let store = Arc::new(MemoryCredentialStore::with_tokens(TokenPair::new("a1", "r1")));
        let client = client_for(spawn_api(Arc::clone(&api)).await, Arc::clone(&store));

        let (x, y, z) = tokio::join!(
            client.get::<Value>("/profile"),
            client.get::<Value>("/profile"),
            client.get::<Value>("/profile"),
        );

        for result in [x, y, z] {
            match result {
                Err(ClientError::RefreshFailed(RefreshError::Rejected { code, message })) => {
                    assert_eq!(code, 20101);
                    assert_eq!(message, "Token invalid");
                }
                other => panic!("unexpected result: {other:?}"),
            }
        }
        assert_eq!(api.refresh_calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.access_token().as_deref(), Some("a1"));
    }

    #[tokio::test]
    async fn test_incomplete_refresh_pair_fails() {
        let api = mock("never", 0);
        *api.refresh_reply.lock().unwrap() =
            Some(json!({"code": 200, "message": "ok", "data": {"access_token": "a2"}}));
        let store = Arc::new(MemoryCredentialStore::with_tokens(TokenPair::new("a1", "r1")));
        let client = client_for(spawn_api(Arc::clone(&api)).await, Arc::clone(&store));

        let result = client.get::<Value>("/profile").await;

        assert!(matches!(
            result,
            Err(ClientError::RefreshFailed(RefreshError::IncompleteTokens))
        ));
        assert_eq!(store.access_token().as_deref(), Some("a1"));
        assert_eq!(store.refresh_token().as_deref(), Some("r1"));
    }

    #[tokio::test]
    async fn test_refresh_success_without_data_is_incomplete() {
        let api = mock("never", 0);
        *api.refresh_reply.lock().unwrap() = Some(json!({"code": 200, "message": "ok", "data": null}));
        let store = Arc::new(MemoryCredentialStore::with_tokens(TokenPair::new("a1", "r1")));
        let client = client_for(spawn_api(Arc::clone(&api)).await, Arc::clone(&store));

        let result = client.get::<Value>("/profile").await;

        assert!(matches!(
            result,
            Err(ClientError::RefreshFailed(RefreshError::IncompleteTokens))
        ));
        assert_eq!(api.refresh_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refresh_reply_without_envelope_is_invalid() {
        let api = mock("never", 0);
        *api.refresh_reply.lock().unwrap() = Some(json!("maintenance"));
        let store = Arc::new(MemoryCredentialStore::with_tokens(TokenPair::new("a1", "r1")));
        let client = client_for(spawn_api(Arc::clone(&api)).await, Arc::clone(&store));

        let result = client.get::<Value>("/profile").await;

        assert!(matches!(
            result,
            Err(ClientError::RefreshFailed(RefreshError::InvalidResponse(_)))
        ));
        assert_eq!(store.access_token().as_deref(), Some("a1"));
    }

    #[tokio::test]
    async fn test_slow_refresh_times_out_every_waiter() {
        // Refresh takes longer than the 200ms request bound
        let api = mock("never", 500);
        let store = Arc::new(MemoryCredentialStore::with_tokens(TokenPair::new("a1", "r1")));
        let client = client_for(spawn_api(Arc::clone(&api)).await, Arc::clone(&store));

        let (x, y, z) = tokio::join!(
            client.get::<Value>("/profile"),
            client.get::<Value>("/profile"),
            client.get::<Value>("/profile"),
        );

        for result in [x, y, z] {
            assert!(matches!(result, Err(ClientError::Timeout)), "unexpected result: {result:?}");
        }
        assert_eq!(api.refresh_calls.load(Ordering::SeqCst), 1);
        assert_eq!(api.profile_calls.load(Ordering::SeqCst), 3);
        assert_eq!(store.access_token().as_deref(), Some("a1"));
    }

    #[tokio::test]
    async fn test_missing_refresh_token_skips_exchange() {
        let api = mock("a2", 0);
        let store = Arc::new(MemoryCredentialStore::with_tokens(TokenPair::new("a1", "")));
        let client = client_for(spawn_api(Arc::clone(&api)).await, store);

        let result = client.get::<Value>("/profile").await;

        assert!(matches!(result, Err(ClientError::RefreshImpossible)));
        assert_eq!(api.refresh_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_replay_is_not_retried_again() {
        let api = mock("a2", 0);
        let store = Arc::new(MemoryCredentialStore::with_tokens(TokenPair::new("a1", "r1")));
        let client = client_for(spawn_api(Arc::clone(&api)).await, store);

        let result = client.get::<Value>("/always-expired").await;

        assert!(matches!(result, Err(ClientError::Unauthorized { code: 40001, .. })));
        assert_eq!(api.refresh_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_business_error_is_not_retried() {
        let api = mock("a1", 0);
        let store = Arc::new(MemoryCredentialStore::with_tokens(TokenPair::new("a1", "r1")));
        let client = client_for(spawn_api(Arc::clone(&api)).await, store);

        let result = client
            .post::<_, Value>("/group/getGroupInfo", &json!({"uuid": "g1"}))
            .await;

        match result {
            Err(ClientError::Business { code, message }) => {
                assert_eq!(code, 30401);
                assert_eq!(message, "Group not found");
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(api.refresh_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_request_timeout() {
        let api = mock("a1", 0);
        let store = Arc::new(MemoryCredentialStore::with_tokens(TokenPair::new("a1", "r1")));
        let client = client_for(spawn_api(api).await, store);

        let result = client.get::<Value>("/slow").await;

        assert!(matches!(result, Err(ClientError::Timeout)));
    }

    #[tokio::test]
    async fn test_login_stores_tokens_and_logout_clears() {
        let api = mock("a1", 0);
        let store = Arc::new(MemoryCredentialStore::new());
        let client = client_for(spawn_api(api).await, Arc::clone(&store));
        assert!(!client.is_authenticated());

        let bad = client.login("13800000000", "wrong").await;
        assert!(matches!(bad, Err(ClientError::Business { code: 20102, .. })));
        assert!(!client.is_authenticated());

        let resp = tokio_test::assert_ok!(client.login("13800000000", "secret").await);
        assert_eq!(resp.token, "a1");
        assert_eq!(store.refresh_token().as_deref(), Some("r1"));
        assert!(client.is_authenticated());

        client.logout();
        assert!(!client.is_authenticated());
        assert_eq!(store.refresh_token(), None);
    }

    #[tokio::test]
    async fn test_connection_refused_is_transport_error() {
        let store = Arc::new(MemoryCredentialStore::new());
        let client = client_for("http://127.0.0.1:1/api/v1".to_string(), store);

        let result = client.get::<Value>("/profile").await;

        assert!(matches!(result, Err(ClientError::Transport(_))));
    }
}

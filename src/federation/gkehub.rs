//! GKE Hub REST client
//!
//! Implements [`FederationClient`] against the `v1beta1` memberships API.
//! Membership creation returns a long-running operation which is polled until
//! it reports `done`. Dropping the returned future stops polling.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Response;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use super::{ClusterIdentity, FederationClient, Membership};
use crate::Error;

/// Default GKE Hub endpoint
pub const DEFAULT_ENDPOINT: &str = "https://gkehub.googleapis.com";

/// GCE metadata server token endpoint for the default service account
pub const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

const API_VERSION: &str = "v1beta1";
const OPERATION_POLL_INTERVAL: Duration = Duration::from_secs(2);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Tokens are refreshed this long before the metadata server says they expire
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Source of OAuth2 access tokens for GKE Hub
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Return a currently valid bearer token
    async fn token(&self) -> Result<String, Error>;
}

/// Fixed token, for local runs and tests
pub struct StaticTokenSource {
    token: String,
}

impl StaticTokenSource {
    /// Wrap a pre-issued access token
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenSource for StaticTokenSource {
    async fn token(&self) -> Result<String, Error> {
        Ok(self.token.clone())
    }
}

#[derive(Debug, Deserialize)]
struct MetadataToken {
    access_token: String,
    #[serde(default)]
    expires_in: u64,
}

/// Tokens of the node or workload identity service account, via the metadata server
pub struct MetadataTokenSource {
    http: reqwest::Client,
    url: String,
    cached: Mutex<Option<(String, Instant)>>,
}

impl MetadataTokenSource {
    /// Token source using the standard metadata server address
    pub fn new() -> Result<Self, Error> {
        Self::with_url(METADATA_TOKEN_URL)
    }

    /// Token source using a custom metadata endpoint
    pub fn with_url(url: impl Into<String>) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            url: url.into(),
            cached: Mutex::new(None),
        })
    }
}

#[async_trait]
impl TokenSource for MetadataTokenSource {
    async fn token(&self) -> Result<String, Error> {
        let mut cached = self.cached.lock().await;
        if let Some((token, expires_at)) = cached.as_ref() {
            if Instant::now() < *expires_at {
                return Ok(token.clone());
            }
        }

        let response = self
            .http
            .get(&self.url)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(|e| Error::transport(format!("metadata server request failed: {e}")))?;
        let token: MetadataToken = check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| Error::serialization(format!("invalid metadata token response: {e}")))?;

        let lifetime = Duration::from_secs(token.expires_in).saturating_sub(TOKEN_EXPIRY_MARGIN);
        debug!(expires_in = token.expires_in, "refreshed GKE Hub access token");
        *cached = Some((token.access_token.clone(), Instant::now() + lifetime));
        Ok(token.access_token)
    }
}

/// Long-running operation as returned by GKE Hub
#[derive(Debug, Deserialize)]
struct Operation {
    name: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<RpcStatus>,
}

#[derive(Debug, Default, Deserialize)]
struct RpcStatus {
    #[serde(default)]
    code: i32,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: RpcStatus,
}

/// HTTP status equivalent of a google.rpc.Code
fn rpc_code_to_http(code: i32) -> u16 {
    match code {
        0 => 200,
        1 => 499,
        3 | 9 | 11 => 400,
        4 => 504,
        5 => 404,
        6 | 10 => 409,
        7 => 403,
        8 => 429,
        12 => 501,
        14 => 503,
        16 => 401,
        _ => 500,
    }
}

/// Turn a non-success response into [`Error::Federation`]
async fn check_status(response: Response) -> Result<Response, Error> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&body)
        .map(|b| b.error.message)
        .ok()
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("unknown error")
                .to_string()
        });
    Err(Error::federation(status.as_u16(), message))
}

/// [`FederationClient`] backed by the GKE Hub REST API
pub struct GkeHubClient {
    http: reqwest::Client,
    endpoint: String,
    tokens: Arc<dyn TokenSource>,
    poll_interval: Duration,
}

impl GkeHubClient {
    /// Create a client against `endpoint` authenticated by `tokens`
    pub fn new(endpoint: impl Into<String>, tokens: Arc<dyn TokenSource>) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            tokens,
            poll_interval: OPERATION_POLL_INTERVAL,
        })
    }

    /// Override how often long-running operations are polled
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn url(&self, resource: &str) -> String {
        format!("{}/{}/{}", self.endpoint, API_VERSION, resource)
    }

    async fn get_json(&self, resource: &str) -> Result<Response, Error> {
        let token = self.tokens.token().await?;
        let response = self
            .http
            .get(self.url(resource))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| Error::transport(e.to_string()))?;
        check_status(response).await
    }

    async fn wait(&self, mut operation: Operation) -> Result<(), Error> {
        loop {
            if operation.done {
                return match operation.error {
                    Some(status) if status.code != 0 => {
                        Err(Error::federation(rpc_code_to_http(status.code), status.message))
                    }
                    _ => Ok(()),
                };
            }

            debug!(operation = %operation.name, "waiting for operation");
            tokio::time::sleep(self.poll_interval).await;

            operation = self
                .get_json(&operation.name)
                .await?
                .json()
                .await
                .map_err(|e| Error::serialization(format!("invalid operation response: {e}")))?;
        }
    }
}

#[async_trait]
impl FederationClient for GkeHubClient {
    async fn register(
        &self,
        cluster: &ClusterIdentity,
        membership: &Membership,
    ) -> Result<(), Error> {
        let token = self.tokens.token().await?;
        let url = self.url(&format!("{}/memberships", cluster.parent()));

        info!(
            membership = %membership.name,
            parent = %cluster.parent(),
            "creating GKE Hub membership"
        );

        let response = self
            .http
            .post(url)
            .query(&[("membershipId", cluster.membership_id())])
            .bearer_auth(token)
            .json(membership)
            .send()
            .await
            .map_err(|e| Error::transport(e.to_string()))?;

        let operation: Operation = check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| Error::serialization(format!("invalid operation response: {e}")))?;

        self.wait(operation).await
    }

    async fn get(&self, name: &str) -> Result<Option<Membership>, Error> {
        match self.get_json(name).await {
            Ok(response) => response
                .json()
                .await
                .map(Some)
                .map_err(|e| Error::serialization(format!("invalid membership response: {e}"))),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl std::fmt::Debug for GkeHubClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GkeHubClient")
            .field("endpoint", &self.endpoint)
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::extract::{Path, Query, State};
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::{json, Value};

    /// In-process stand-in for GKE Hub
    #[derive(Clone, Default)]
    struct FakeHub {
        polls: Arc<AtomicUsize>,
        created: Arc<std::sync::Mutex<Vec<(String, Value)>>>,
    }

    async fn create_membership(
        State(hub): State<FakeHub>,
        Path((project, _location)): Path<(String, String)>,
        Query(query): Query<std::collections::HashMap<String, String>>,
        Json(body): Json<Value>,
    ) -> (StatusCode, Json<Value>) {
        let id = query.get("membershipId").cloned().unwrap_or_default();
        if project == "taken" {
            return (
                StatusCode::CONFLICT,
                Json(json!({"error": {"code": 409, "message": "Resource already exists", "status": "ALREADY_EXISTS"}})),
            );
        }
        hub.created.lock().unwrap().push((id, body));
        (
            StatusCode::OK,
            Json(json!({"name": format!("projects/{project}/locations/global/operations/op-1"), "done": false})),
        )
    }

    async fn get_operation(
        State(hub): State<FakeHub>,
        Path((project, _location, op)): Path<(String, String, String)>,
    ) -> Json<Value> {
        let polls = hub.polls.fetch_add(1, Ordering::SeqCst);
        let name = format!("projects/{project}/locations/global/operations/{op}");
        if project == "failing" {
            return Json(json!({"name": name, "done": true, "error": {"code": 7, "message": "caller lacks gkehub.memberships.create"}}));
        }
        Json(json!({"name": name, "done": polls >= 1}))
    }

    async fn get_membership(
        Path((project, _location, id)): Path<(String, String, String)>,
    ) -> (StatusCode, Json<Value>) {
        if id == "missing" {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({"error": {"code": 404, "message": "not found"}})),
            );
        }
        (
            StatusCode::OK,
            Json(json!({
                "name": format!("projects/{project}/locations/global/memberships/{id}"),
                "authority": {"issuer": "https://kubernetes.default.svc.cluster.local"},
                "externalId": "ext"
            })),
        )
    }

    async fn start_fake_hub(hub: FakeHub) -> String {
        let app = Router::new()
            .route(
                "/v1beta1/projects/{project}/locations/{location}/memberships",
                post(create_membership),
            )
            .route(
                "/v1beta1/projects/{project}/locations/{location}/operations/{op}",
                get(get_operation),
            )
            .route(
                "/v1beta1/projects/{project}/locations/{location}/memberships/{id}",
                get(get_membership),
            )
            .with_state(hub);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn client(endpoint: String) -> GkeHubClient {
        GkeHubClient::new(endpoint, Arc::new(StaticTokenSource::new("token")))
            .unwrap()
            .with_poll_interval(Duration::from_millis(10))
    }

    // =========================================================================
    // Unit Tests
    // =========================================================================

    #[test]
    fn rpc_codes_map_to_http_statuses() {
        assert_eq!(rpc_code_to_http(6), 409);
        assert_eq!(rpc_code_to_http(5), 404);
        assert_eq!(rpc_code_to_http(7), 403);
        assert_eq!(rpc_code_to_http(14), 503);
        assert_eq!(rpc_code_to_http(42), 500);
    }

    #[test]
    fn endpoint_trailing_slash_is_ignored() {
        let c = client("https://gkehub.example.com/".to_string());
        assert_eq!(
            c.url("projects/p/locations/global/memberships"),
            "https://gkehub.example.com/v1beta1/projects/p/locations/global/memberships"
        );
    }

    #[tokio::test]
    async fn static_token_source_returns_token() {
        let source = StaticTokenSource::new("abc");
        assert_eq!(source.token().await.unwrap(), "abc");
    }

    // =========================================================================
    // Integration Tests against an in-process GKE Hub
    // =========================================================================

    /// Story: registration posts the membership under the project's global
    /// location and blocks until the operation completes.
    #[tokio::test]
    async fn story_register_waits_for_operation() {
        let hub = FakeHub::default();
        let endpoint = start_fake_hub(hub.clone()).await;
        let cluster = ClusterIdentity::new("krillin", "testing-1234");
        let membership = cluster.membership(b"{}".to_vec());

        client(endpoint)
            .register(&cluster, &membership)
            .await
            .expect("registration should succeed");

        let created = hub.created.lock().unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].0, "krillin-workload-identity-test");
        assert_eq!(created[0].1["name"], membership.name.as_str());
        assert!(hub.polls.load(Ordering::SeqCst) >= 2);
    }

    /// Story: an existing membership comes back as 409 and is returned as-is.
    #[tokio::test]
    async fn story_existing_membership_returns_conflict() {
        let endpoint = start_fake_hub(FakeHub::default()).await;
        let cluster = ClusterIdentity::new("krillin", "taken");

        let err = client(endpoint)
            .register(&cluster, &cluster.membership(Vec::new()))
            .await
            .unwrap_err();

        assert!(err.is_conflict());
        assert!(err.to_string().contains("Resource already exists"));
    }

    /// Story: an operation that finishes with an RPC error surfaces that error.
    #[tokio::test]
    async fn story_failed_operation_surfaces_rpc_error() {
        let endpoint = start_fake_hub(FakeHub::default()).await;
        let cluster = ClusterIdentity::new("krillin", "failing");

        let err = client(endpoint)
            .register(&cluster, &cluster.membership(Vec::new()))
            .await
            .unwrap_err();

        assert_eq!(err.status_code(), Some(403));
        assert!(err.to_string().contains("gkehub.memberships.create"));
    }

    #[tokio::test]
    async fn get_returns_none_for_missing_membership() {
        let endpoint = start_fake_hub(FakeHub::default()).await;
        let c = client(endpoint);

        let missing = c
            .get("projects/p/locations/global/memberships/missing")
            .await
            .unwrap();
        assert!(missing.is_none());

        let found = c
            .get("projects/p/locations/global/memberships/krillin")
            .await
            .unwrap()
            .expect("membership should exist");
        assert_eq!(found.external_id, "ext");
    }

    #[tokio::test]
    async fn token_failures_abort_registration() {
        let mut tokens = MockTokenSource::new();
        tokens
            .expect_token()
            .returning(|| Err(Error::transport("metadata server unreachable")));

        let c = GkeHubClient::new("http://127.0.0.1:9", Arc::new(tokens)).unwrap();
        let cluster = ClusterIdentity::new("krillin", "testing-1234");
        let err = c
            .register(&cluster, &cluster.membership(Vec::new()))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Transport(_)));
    }

    #[tokio::test]
    async fn metadata_tokens_are_cached() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let app = Router::new().route(
            "/token",
            get(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Json(json!({"access_token": "ya29.test", "expires_in": 3599, "token_type": "Bearer"}))
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let source = MetadataTokenSource::with_url(format!("http://{addr}/token")).unwrap();
        assert_eq!(source.token().await.unwrap(), "ya29.test");
        assert_eq!(source.token().await.unwrap(), "ya29.test");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

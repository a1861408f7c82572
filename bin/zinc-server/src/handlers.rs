//! HTTP request handlers
//!
//! `/datastore/{name}` supports GET (read or WebSocket stream), POST
//! (append), PUT (rewrite), DELETE (destroy) and OPTIONS (CORS preflight).
//! Storage calls block, so they run on the blocking thread pool.

use crate::access::{self, ACCESS_KEY_PARAM, AccessMethod};
use crate::error::ApiError;
use crate::rate_limiter::RateLimiter;
use crate::registry::{GLOBAL_CONFIG_DATASTORE, ServerRegistry, is_valid_datastore_name};
use crate::websocket;
use axum::body::Bytes;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::{
    ConnectInfo, DefaultBodyLimit, FromRequestParts, Path, Query, Request, State, WebSocketUpgrade,
};
use axum::http::request::Parts;
use axum::http::{HeaderValue, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use zinc_common::config::keys;
use zinc_common::{DatastoreConfigSnapshot, VarMap};
use zinc_storage::{CompactionOutcome, CompactionPolicy, DatastoreOperations, Updates, WriteOptions};

/// How long a `waitUntilNonempty` read waits for new entries
pub const LONG_POLL_TIMEOUT: Duration = Duration::from_secs(60);

/// Upper bound on request bodies; per-datastore limits are enforced by storage
const MAX_BODY_SIZE: usize = 1024 * 1024 * 1024;

const ALLOWED_METHODS: &str = "GET, POST, PUT, DELETE, OPTIONS";

/// Shared handler state
#[derive(Debug)]
pub struct AppState {
    pub registry: Arc<ServerRegistry>,
    pub rate_limiter: RateLimiter,
    pub long_poll_timeout: Duration,
}

impl AppState {
    #[must_use]
    pub fn new(registry: Arc<ServerRegistry>) -> Self {
        Self {
            registry,
            rate_limiter: RateLimiter::new(),
            long_poll_timeout: LONG_POLL_TIMEOUT,
        }
    }
}

/// Build the API router
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(
            "/datastore/{name}",
            get(get_datastore)
                .post(post_datastore)
                .put(put_datastore)
                .delete(delete_datastore)
                .options(preflight),
        )
        .layer(middleware::from_fn_with_state(Arc::clone(&state), cors))
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Peer address, when the server was started with connect info
#[derive(Debug, Clone, Copy)]
pub struct ClientAddr(pub Option<SocketAddr>);

impl<S: Send + Sync> FromRequestParts<S> for ClientAddr {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(
            parts
                .extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|info| info.0),
        ))
    }
}

impl ClientAddr {
    fn id(self) -> String {
        self.0
            .map_or_else(|| "local".to_string(), |addr| addr.ip().to_string())
    }

    fn is_loopback(self) -> bool {
        self.0.is_none_or(|addr| addr.ip().is_loopback())
    }
}

/// Typed view of the query string
#[derive(Debug, Default, PartialEq, Eq)]
struct ReadParams {
    updated_after: i64,
    wait_until_nonempty: bool,
}

fn parse_read_params(params: &HashMap<String, String>) -> Result<ReadParams, ApiError> {
    let updated_after = match params.get("updatedAfter") {
        Some(v) => v
            .parse()
            .map_err(|_| ApiError::bad_request(format!("invalid updatedAfter {v:?}")))?,
        None => -1,
    };
    let wait_until_nonempty = match params.get("waitUntilNonempty").map(String::as_str) {
        None | Some("false" | "0") => false,
        Some("" | "true" | "1") => true,
        Some(v) => {
            return Err(ApiError::bad_request(format!(
                "invalid waitUntilNonempty {v:?}"
            )));
        }
    };
    Ok(ReadParams {
        updated_after,
        wait_until_nonempty,
    })
}

async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce() -> zinc_common::Result<T> + Send + 'static,
{
    Ok(tokio::task::spawn_blocking(f).await??)
}

/// Check the name, the caller's access and rate limit; returns the
/// datastore and its configuration
async fn authorize_request(
    state: &AppState,
    name: &str,
    method: AccessMethod,
    params: &HashMap<String, String>,
    client: ClientAddr,
) -> Result<(Arc<DatastoreOperations>, DatastoreConfigSnapshot), ApiError> {
    if !is_valid_datastore_name(name) {
        return Err(ApiError::bad_request(format!("invalid datastore name {name:?}")));
    }

    let registry = Arc::clone(&state.registry);
    let config_name = name.to_string();
    let config = blocking(move || registry.datastore_config(&config_name)).await?;

    if !client.is_loopback() && config.global().get_bool(keys::HTTP_LOOPBACK_ONLY).unwrap_or(false)
    {
        return Err(ApiError::forbidden("server only accepts loopback connections"));
    }

    let names: Vec<&str> = params.keys().map(String::as_str).collect();
    let grant = access::authorize(
        &config,
        name,
        method,
        params.get(ACCESS_KEY_PARAM).map(String::as_str),
        &names,
        &client.id(),
    )?;
    if let Some(limit) = grant.limit
        && !state
            .rate_limiter
            .allow(&grant.client_id, method.as_str(), limit)
    {
        debug!("Rate limit hit by {} on {}", grant.client_id, method.as_str());
        return Err(ApiError::too_many_requests());
    }

    let ops = state.registry.get_or_create(name)?;
    Ok((ops, config))
}

async fn read_updates(ops: &Arc<DatastoreOperations>, after: i64) -> Result<Updates, ApiError> {
    let reader = Arc::clone(ops);
    blocking(move || reader.read_updates(after)).await
}

async fn get_datastore(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    client: ClientAddr,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response, ApiError> {
    if let Ok(upgrade) = upgrade {
        let (ops, _) =
            authorize_request(&state, &name, AccessMethod::WebSocket, &params, client).await?;
        let read = parse_read_params(&params)?;
        let loader = Arc::clone(&ops);
        blocking(move || loader.load_if_needed().map(|_| ())).await?;
        debug!("Streaming {} to {}", name, client.id());
        return Ok(upgrade
            .on_upgrade(move |socket| websocket::stream_updates(socket, ops, read.updated_after)));
    }

    let (ops, _) = authorize_request(&state, &name, AccessMethod::Get, &params, client).await?;
    let read = parse_read_params(&params)?;

    let mut updates = read_updates(&ops, read.updated_after).await?;
    if updates.data.is_empty() && read.wait_until_nonempty {
        let notified = ops.subscribe(read.updated_after);
        updates = read_updates(&ops, read.updated_after).await?;
        if updates.data.is_empty() {
            // Timing out is not an error; the client gets an empty body
            let _ = tokio::time::timeout(state.long_poll_timeout, notified).await;
            updates = read_updates(&ops, read.updated_after).await?;
        }
    }

    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        updates.data,
    )
        .into_response())
}

fn compact_after_write(ops: &DatastoreOperations, policy: Option<CompactionPolicy>) {
    let Some(policy) = policy else {
        return;
    };
    match ops.compact_if_needed(&policy) {
        Ok(CompactionOutcome::Compacted { old_size, new_size }) => {
            info!("Compacted {} from {} to {} bytes", ops.name(), old_size, new_size);
        }
        Ok(_) => {}
        Err(e) => warn!("Compaction of {} failed: {e}", ops.name()),
    }
}

fn commit_response(commit_time: i64) -> Response {
    Json(json!({ "commitTimestamp": commit_time })).into_response()
}

async fn post_datastore(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    client: ClientAddr,
    body: Bytes,
) -> Result<Response, ApiError> {
    let (ops, config) =
        authorize_request(&state, &name, AccessMethod::Post, &params, client).await?;
    let options = WriteOptions::from_config(&config);
    let policy = CompactionPolicy::from_config(&config);

    let commit_time = blocking(move || {
        ops.create_if_missing()?;
        let commit_time = ops.append_transaction(body.to_vec(), &options)?;
        compact_after_write(&ops, policy);
        Ok(commit_time)
    })
    .await?;
    Ok(commit_response(commit_time))
}

async fn put_datastore(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    client: ClientAddr,
    body: Bytes,
) -> Result<Response, ApiError> {
    let (ops, config) =
        authorize_request(&state, &name, AccessMethod::Put, &params, client).await?;
    let options = WriteOptions::from_config(&config);

    let commit_time = blocking(move || {
        ops.create_if_missing()?;
        ops.rewrite_transaction(body.to_vec(), &options)
    })
    .await?;
    Ok(commit_response(commit_time))
}

async fn delete_datastore(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    client: ClientAddr,
) -> Result<Response, ApiError> {
    let (ops, _) = authorize_request(&state, &name, AccessMethod::Delete, &params, client).await?;
    if name == GLOBAL_CONFIG_DATASTORE {
        return Err(ApiError::forbidden("the global configuration cannot be deleted"));
    }
    blocking(move || ops.destroy()).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn preflight() -> StatusCode {
    StatusCode::NO_CONTENT
}

fn origin_allowed(config: &VarMap, origin: &str) -> bool {
    config
        .get_bool(&keys::cors_origin_allowed(origin))
        .or_else(|_| config.get_bool(&keys::cors_origin_allowed("*")))
        .unwrap_or(false)
}

/// Add CORS headers for origins allowed by the global configuration
async fn cors(State(state): State<Arc<AppState>>, request: Request, next: Next) -> Response {
    let origin = request.headers().get(header::ORIGIN).cloned();
    let mut response = next.run(request).await;

    let Some(origin) = origin else {
        return response;
    };
    let allowed = match (origin.to_str(), state.registry.global_config()) {
        (Ok(o), Ok(config)) => origin_allowed(&config, o),
        _ => false,
    };
    if allowed {
        let headers = response.headers_mut();
        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static(ALLOWED_METHODS),
        );
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static("Content-Type"),
        );
        headers.insert(header::ACCESS_CONTROL_MAX_AGE, HeaderValue::from_static("86400"));
        headers.append(header::VARY, HeaderValue::from_static("Origin"));
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::config_entries;
    use axum::body::{Body, to_bytes};
    use axum::http::Request as HttpRequest;
    use tempfile::{TempDir, tempdir};
    use tower::ServiceExt;
    use zinc_common::checksum::hash_secret;
    use zinc_storage::{Entry, HEAD_ENTRY_SIZE, deserialize_entries, serialize_entries};

    const MASTER_KEY: &str = "00112233445566778899aabbccddeeff";

    fn setup() -> (TempDir, Arc<AppState>) {
        let dir = tempdir().unwrap();
        let registry = Arc::new(ServerRegistry::open(dir.path()).unwrap());
        let mut state = AppState::new(registry);
        state.long_poll_timeout = Duration::from_millis(200);
        (dir, Arc::new(state))
    }

    fn transaction(pairs: &[(&str, &str)]) -> Vec<u8> {
        let entries: Vec<Entry> = pairs.iter().map(|(k, v)| Entry::json(*k, *v)).collect();
        serialize_entries(&entries)
    }

    async fn send(
        state: &Arc<AppState>,
        method: &str,
        uri: &str,
        body: Vec<u8>,
    ) -> (StatusCode, Vec<u8>) {
        let request = HttpRequest::builder()
            .method(method)
            .uri(uri)
            .body(Body::from(body))
            .unwrap();
        let response = router(Arc::clone(state)).oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    fn commit_timestamp(body: &[u8]) -> i64 {
        let value: serde_json::Value = serde_json::from_slice(body).unwrap();
        value["commitTimestamp"].as_i64().unwrap()
    }

    fn set_global(state: &AppState, update: &VarMap) {
        state
            .registry
            .get_or_create(GLOBAL_CONFIG_DATASTORE)
            .unwrap()
            .append_transaction(
                config_entries(&update.to_json_entries()),
                &WriteOptions::default(),
            )
            .unwrap();
    }

    #[tokio::test]
    async fn test_post_then_get() {
        let (_dir, state) = setup();

        let (status, body) = send(
            &state,
            "POST",
            "/datastore/d1",
            transaction(&[(r#""a""#, "1"), (r#""b""#, "2")]),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let commit = commit_timestamp(&body);
        assert!(commit > 0);

        let (status, body) = send(&state, "GET", "/datastore/d1?updatedAfter=0", vec![]).await;
        assert_eq!(status, StatusCode::OK);
        let posted = transaction(&[(r#""a""#, "1"), (r#""b""#, "2")]);
        assert_eq!(body.len() as u64, HEAD_ENTRY_SIZE + posted.len() as u64);

        let url = format!("/datastore/d1?updatedAfter={commit}");
        let (status, body) = send(&state, "GET", &url, vec![]).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.is_empty());

        let url = format!("/datastore/d1?updatedAfter={}", commit - 1);
        let (_, body) = send(&state, "GET", &url, vec![]).await;
        let entries = deserialize_entries(&body).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].key, br#""a""#);
        assert!(entries[1].is_transaction_end());
    }

    #[tokio::test]
    async fn test_missing_datastore_and_bad_requests() {
        let (_dir, state) = setup();

        let (status, _) = send(&state, "GET", "/datastore/nope", vec![]).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(&state, "GET", "/datastore/d1.corrupted-1", vec![]).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&state, "GET", "/datastore/d1?updatedAfter=x", vec![]).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&state, "POST", "/datastore/d1", vec![]).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&state, "POST", "/datastore/d1", vec![1, 2, 3]).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_put_replaces_content_and_delete_removes_it() {
        let (dir, state) = setup();

        send(&state, "POST", "/datastore/d1", transaction(&[(r#""a""#, "1")])).await;
        let replacement = transaction(&[(r#""b""#, "2")]);
        let (status, _) = send(&state, "PUT", "/datastore/d1", replacement).await;
        assert_eq!(status, StatusCode::OK);

        let (_, body) = send(&state, "GET", "/datastore/d1?updatedAfter=0", vec![]).await;
        let entries = deserialize_entries(&body[HEAD_ENTRY_SIZE as usize..]).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key, br#""b""#);

        let (status, _) = send(&state, "DELETE", "/datastore/d1", vec![]).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(!dir.path().join("d1").exists());

        let (status, _) = send(&state, "GET", "/datastore/d1", vec![]).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&state, "DELETE", "/datastore/d1", vec![]).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_long_poll_wakes_on_append() {
        let (_dir, state) = setup();
        let (_, body) = send(&state, "POST", "/datastore/d1", transaction(&[(r#""a""#, "1")]))
            .await;
        let commit = commit_timestamp(&body);

        let poller = {
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                let url = format!("/datastore/d1?updatedAfter={commit}&waitUntilNonempty=true");
                send(&state, "GET", &url, vec![]).await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        send(&state, "POST", "/datastore/d1", transaction(&[(r#""b""#, "2")])).await;

        let (status, body) = poller.await.unwrap();
        assert_eq!(status, StatusCode::OK);
        let entries = deserialize_entries(&body).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key, br#""b""#);
    }

    #[tokio::test]
    async fn test_long_poll_times_out_empty() {
        let (_dir, state) = setup();
        let (_, body) = send(&state, "POST", "/datastore/d1", transaction(&[(r#""a""#, "1")]))
            .await;
        let commit = commit_timestamp(&body);

        let url = format!("/datastore/d1?updatedAfter={commit}&waitUntilNonempty=true");
        let (status, body) = send(&state, "GET", &url, vec![]).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn test_config_datastore_requires_master_key() {
        let (_dir, state) = setup();
        let mut update = VarMap::new();
        update.set(keys::MASTER_KEY_HASH, hash_secret(MASTER_KEY));
        set_global(&state, &update);

        let (status, _) = send(&state, "GET", "/datastore/.config", vec![]).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let url = format!("/datastore/.config?accessKey={MASTER_KEY}");
        let (status, body) = send(&state, "GET", &url, vec![]).await;
        assert_eq!(status, StatusCode::OK);
        assert!(!body.is_empty());

        let (status, _) = send(&state, "DELETE", &url, vec![]).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_datastore_config_limits_apply() {
        let (_dir, state) = setup();
        let mut update = VarMap::new();
        update.set(keys::MASTER_KEY_HASH, hash_secret(MASTER_KEY));
        set_global(&state, &update);

        let mut limits = VarMap::new();
        limits.set(keys::LIMIT_MAX_SIZE, 600_i64);
        let url = format!("/datastore/d1.config?accessKey={MASTER_KEY}");
        let body = config_entries(&limits.to_json_entries());
        let (status, _) = send(&state, "POST", &url, body).await;
        assert_eq!(status, StatusCode::OK);

        let big = format!("\"{}\"", "x".repeat(200));
        let (status, _) = send(
            &state,
            "POST",
            "/datastore/d1",
            transaction(&[(r#""a""#, big.as_str())]),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_disallowed_method_and_rate_limit() {
        let (_dir, state) = setup();
        let mut update = VarMap::new();
        update.set(keys::method_allowed("Anonymous", "DELETE"), false);
        update.set(keys::method_limit_requests("Anonymous", "POST"), 2_i64);
        update.set(keys::method_limit_interval("Anonymous", "POST"), 60_000_i64);
        set_global(&state, &update);

        let (status, _) = send(&state, "DELETE", "/datastore/d1", vec![]).await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);

        for _ in 0..2 {
            let (status, _) =
                send(&state, "POST", "/datastore/d1", transaction(&[(r#""a""#, "1")])).await;
            assert_eq!(status, StatusCode::OK);
        }
        let (status, _) = send(&state, "POST", "/datastore/d1", transaction(&[(r#""a""#, "1")]))
            .await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_cors_headers() {
        let (_dir, state) = setup();
        let request = HttpRequest::builder()
            .method("OPTIONS")
            .uri("/datastore/d1")
            .header(header::ORIGIN, "https://example.com")
            .body(Body::empty())
            .unwrap();
        let response = router(Arc::clone(&state)).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "https://example.com"
        );

        let mut update = VarMap::new();
        update.set(keys::cors_origin_allowed("https://evil.example"), false);
        set_global(&state, &update);
        let request = HttpRequest::builder()
            .method("OPTIONS")
            .uri("/datastore/d1")
            .header(header::ORIGIN, "https://evil.example")
            .body(Body::empty())
            .unwrap();
        let response = router(Arc::clone(&state)).oneshot(request).await.unwrap();
        assert!(
            response
                .headers()
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .is_none()
        );
    }

    #[test]
    fn test_parse_read_params() {
        let params = |pairs: &[(&str, &str)]| -> HashMap<String, String> {
            pairs
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect()
        };
        assert_eq!(
            parse_read_params(&params(&[])).unwrap(),
            ReadParams {
                updated_after: -1,
                wait_until_nonempty: false,
            }
        );
        assert_eq!(
            parse_read_params(&params(&[("updatedAfter", "42"), ("waitUntilNonempty", "true")]))
                .unwrap(),
            ReadParams {
                updated_after: 42,
                wait_until_nonempty: true,
            }
        );
        assert!(parse_read_params(&params(&[("waitUntilNonempty", "maybe")])).is_err());
    }
}

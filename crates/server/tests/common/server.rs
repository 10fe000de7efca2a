//! Server test utilities.

use super::fixtures::{asset_json, sha256_hex, split_into_chunks};
use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode};
use bytes::Bytes;
use keepsake_core::config::{AppConfig, MetadataConfig, StorageConfig, TokenConfig};
use keepsake_core::{ContentHash, ManualClock};
use keepsake_server::bootstrap::open_state;
use keepsake_server::{AppState, create_router};
use serde_json::{Value, json};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use time::OffsetDateTime;
use tower::ServiceExt;

/// Bearer token of principal `alice`.
#[allow(dead_code)]
pub const ALICE: &str = "alice-test-token";
/// Bearer token of principal `bob`.
#[allow(dead_code)]
pub const BOB: &str = "bob-test-token";

/// Where the test clock starts: 2026-01-01T00:00:00Z.
const START_UNIX: i64 = 1_767_225_600;

/// A test server wrapper with all dependencies.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct TestServer {
    pub router: axum::Router,
    pub state: AppState,
    pub clock: Arc<ManualClock>,
    pub config: AppConfig,
    pub temp_dir: TempDir,
}

#[allow(dead_code)]
impl TestServer {
    /// Create a test server with a volatile arena and no external store.
    pub async fn new() -> Self {
        Self::with_config(|_, _| {}).await
    }

    /// Create a test server with custom config modifications.
    ///
    /// The modifier also receives the temp directory, for paths that must
    /// outlive a single request.
    pub async fn with_config<F>(modifier: F) -> Self
    where
        F: FnOnce(&mut AppConfig, &Path),
    {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");

        let mut config = AppConfig::for_testing();
        config.metadata = MetadataConfig::Sqlite {
            path: temp_dir.path().join("metadata.db"),
        };
        config.server.sweep_interval_secs = 0;
        config.auth.tokens = vec![token_config("alice", ALICE), token_config("bob", BOB)];
        modifier(&mut config, temp_dir.path());

        let clock = Arc::new(ManualClock::new(
            OffsetDateTime::from_unix_timestamp(START_UNIX).unwrap(),
        ));
        Self::open(config, clock, temp_dir).await
    }

    /// Open a server over an existing configuration and clock.
    pub async fn open(config: AppConfig, clock: Arc<ManualClock>, temp_dir: TempDir) -> Self {
        keepsake_server::metrics::register_metrics();
        let state = open_state(config.clone(), clock.clone())
            .await
            .expect("Failed to open state");
        let router = create_router(state.clone());
        Self {
            router,
            state,
            clock,
            config,
            temp_dir,
        }
    }

    /// Drop the running state and reopen everything from disk.
    pub async fn restart(self) -> Self {
        let Self {
            state,
            router,
            clock,
            config,
            temp_dir,
        } = self;
        state.arena.sync().expect("Failed to sync arena");
        drop(router);
        drop(state);
        Self::open(config, clock, temp_dir).await
    }

    /// Use a filesystem directory under the temp dir as the external store.
    pub fn external_filesystem(config: &mut AppConfig, dir: &Path) {
        config.external = Some(StorageConfig::Filesystem {
            path: dir.join("blobs"),
        });
    }

    pub fn advance(&self, by: time::Duration) {
        self.clock.advance(by);
    }

    /// Create a capsule and return its ID.
    pub async fn create_capsule(&self, token: &str) -> String {
        let (status, body) = json_request(&self.router, "POST", "/v1/capsules", None, Some(token)).await;
        assert_eq!(status, StatusCode::CREATED, "create capsule: {body}");
        body["capsule_id"].as_str().unwrap().to_string()
    }

    /// Begin an upload of `asset` in `chunk_count` chunks.
    pub async fn begin(
        &self,
        token: &str,
        capsule_id: &str,
        chunk_count: u32,
        idempotency_key: &str,
        asset: Value,
    ) -> (StatusCode, Value) {
        json_request(
            &self.router,
            "POST",
            "/v1/uploads",
            Some(json!({
                "capsule_id": capsule_id,
                "chunk_count": chunk_count,
                "idempotency_key": idempotency_key,
                "asset": asset,
            })),
            Some(token),
        )
        .await
    }

    pub async fn put_chunk(
        &self,
        token: &str,
        session_id: &str,
        index: u32,
        data: &[u8],
    ) -> (StatusCode, Value) {
        let (status, _, body) = bytes_request(
            &self.router,
            "PUT",
            &format!("/v1/uploads/{session_id}/chunks/{index}"),
            Bytes::copy_from_slice(data),
            Some(token),
            &[("content-type", "application/octet-stream")],
        )
        .await;
        (status, parse_body(&body))
    }

    /// Finish with the digest and length of `data`.
    pub async fn finish(&self, token: &str, session_id: &str, data: &[u8]) -> (StatusCode, Value) {
        self.finish_with(token, session_id, &sha256_hex(data), data.len() as u64)
            .await
    }

    pub async fn finish_with(
        &self,
        token: &str,
        session_id: &str,
        expected_sha256: &str,
        total_length: u64,
    ) -> (StatusCode, Value) {
        json_request(
            &self.router,
            "POST",
            &format!("/v1/uploads/{session_id}/finish"),
            Some(json!({
                "expected_sha256": expected_sha256,
                "total_length": total_length,
            })),
            Some(token),
        )
        .await
    }

    pub async fn status(&self, token: &str, session_id: &str) -> (StatusCode, Value) {
        json_request(
            &self.router,
            "GET",
            &format!("/v1/uploads/{session_id}"),
            None,
            Some(token),
        )
        .await
    }

    /// Upload `data` end to end and return the finish response.
    pub async fn upload(
        &self,
        token: &str,
        capsule_id: &str,
        data: &[u8],
        chunk_size: usize,
        asset: Value,
    ) -> Value {
        let chunks = split_into_chunks(data, chunk_size);
        let key = format!("key-{}", sha256_hex(data));
        let (status, begun) = self
            .begin(token, capsule_id, chunks.len() as u32, &key, asset)
            .await;
        assert!(status.is_success(), "begin: {status} {begun}");
        let session_id = begun["session_id"].as_str().unwrap().to_string();

        for (index, chunk) in chunks.iter().enumerate() {
            let (status, body) = self.put_chunk(token, &session_id, index as u32, chunk).await;
            assert_eq!(status, StatusCode::OK, "chunk {index}: {body}");
        }

        let (status, finished) = self.finish(token, &session_id, data).await;
        assert_eq!(status, StatusCode::OK, "finish: {finished}");
        finished
    }

    /// Upload a single-chunk original of `data` into a fresh capsule of `token`.
    pub async fn upload_original(&self, token: &str, data: &[u8]) -> (String, Value) {
        let capsule_id = self.create_capsule(token).await;
        let finished = self
            .upload(
                token,
                &capsule_id,
                data,
                data.len().max(1),
                asset_json("original", "image/jpeg", data.len() as u64),
            )
            .await;
        (capsule_id, finished)
    }

    /// GET an asset: status, headers and raw body.
    pub async fn fetch(&self, token: &str, uri: &str) -> (StatusCode, HeaderMap, Bytes) {
        bytes_request(&self.router, "GET", uri, Bytes::new(), Some(token), &[]).await
    }
}

fn token_config(principal: &str, token: &str) -> TokenConfig {
    TokenConfig {
        principal: principal.to_string(),
        token_hash: ContentHash::compute(token.as_bytes()).to_hex(),
    }
}

fn parse_body(bytes: &[u8]) -> Value {
    if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(bytes).unwrap_or(Value::Null)
    }
}

/// Helper to make JSON requests.
#[allow(dead_code)]
pub async fn json_request(
    router: &axum::Router,
    method: &str,
    uri: &str,
    body: Option<Value>,
    auth_token: Option<&str>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);

    if let Some(token) = auth_token {
        builder = builder.header("Authorization", format!("Bearer {}", token));
    }

    let body = match body {
        Some(v) => {
            builder = builder.header("Content-Type", "application/json");
            Body::from(serde_json::to_vec(&v).unwrap())
        }
        None => Body::empty(),
    };

    let request = builder.body(body).unwrap();
    let response = router.clone().oneshot(request).await.unwrap();

    let status = response.status();
    let body_bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();

    (status, parse_body(&body_bytes))
}

/// Helper to send a raw body and read back a raw body.
#[allow(dead_code)]
pub async fn bytes_request(
    router: &axum::Router,
    method: &str,
    uri: &str,
    body: Bytes,
    auth_token: Option<&str>,
    headers: &[(&str, &str)],
) -> (StatusCode, HeaderMap, Bytes) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = auth_token {
        builder = builder.header("Authorization", format!("Bearer {}", token));
    }
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }

    let request = builder.body(Body::from(body)).unwrap();
    let response = router.clone().oneshot(request).await.unwrap();

    let status = response.status();
    let headers = response.headers().clone();
    let body_bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, headers, body_bytes)
}

/// Decode a JSON error body's code.
#[allow(dead_code)]
pub fn error_code(body: &Bytes) -> String {
    parse_body(body)["code"].as_str().unwrap_or_default().to_string()
}

//! Integration tests for session expiry and restart recovery.

mod common;

use axum::http::StatusCode;
use common::{ALICE, TestServer, asset_json, json_request, seeded_bytes};
use keepsake_core::config::ArenaConfig;
use serde_json::json;
use time::Duration;

async fn persistent_server() -> TestServer {
    TestServer::with_config(|config, dir| {
        config.arena = ArenaConfig::File {
            path: dir.join("arena.pages"),
        };
    })
    .await
}

async fn sweep(server: &TestServer) -> serde_json::Value {
    let (status, stats) =
        json_request(&server.router, "POST", "/v1/admin/sweep", None, Some(ALICE)).await;
    assert_eq!(status, StatusCode::OK, "sweep: {stats}");
    stats
}

#[tokio::test]
async fn test_sweep_releases_expired_sessions() {
    let server = TestServer::new().await;
    let capsule_id = server.create_capsule(ALICE).await;
    let (_, begun) = server
        .begin(
            ALICE,
            &capsule_id,
            3,
            "stale",
            asset_json("original", "image/jpeg", 300),
        )
        .await;
    let session_id = begun["session_id"].as_str().unwrap();
    server.put_chunk(ALICE, session_id, 0, &[1u8; 100]).await;
    server.put_chunk(ALICE, session_id, 1, &[2u8; 100]).await;
    // Ranges are allocated in 64-byte blocks.
    assert_eq!(server.state.arena.bytes_in_use(), 256);

    // Nothing is due yet.
    let stats = sweep(&server).await;
    assert_eq!(stats["expired_sessions"], 0);
    assert_eq!(server.state.arena.bytes_in_use(), 256);

    server.advance(Duration::seconds(server.config.server.upload_ttl_secs as i64 + 1));
    let stats = sweep(&server).await;
    assert_eq!(stats["expired_sessions"], 1);
    assert_eq!(stats["released_ranges"], 2);
    assert_eq!(stats["released_bytes"], 200);
    assert_eq!(server.state.arena.bytes_in_use(), 0);

    let (status, body) = server.status(ALICE, session_id).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "not_found");
}

#[tokio::test]
async fn test_sweep_removes_tombstones_after_ttl() {
    let server = TestServer::new().await;
    let (capsule_id, finished) = server.upload_original(ALICE, b"kept bytes").await;

    server.advance(Duration::seconds(server.config.server.upload_ttl_secs as i64 + 1));
    let stats = sweep(&server).await;
    assert_eq!(stats["removed_tombstones"], 1);
    assert_eq!(stats["expired_sessions"], 0);

    // The asset outlives its session record.
    let (status, _, body) = server
        .fetch(
            ALICE,
            &format!(
                "/v1/memories/{}/assets/original",
                finished["memory_id"].as_str().unwrap()
            ),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_ref(), b"kept bytes");

    // With the tombstone gone, the same key starts a new session.
    let key = format!("key-{}", common::sha256_hex(b"kept bytes"));
    let (status, begun) = server
        .begin(ALICE, &capsule_id, 1, &key, asset_json("original", "image/jpeg", 10))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(begun["resumed"], false);
}

#[tokio::test]
async fn test_sweep_is_idempotent() {
    let server = TestServer::new().await;
    let capsule_id = server.create_capsule(ALICE).await;
    server
        .begin(ALICE, &capsule_id, 1, "k", asset_json("original", "image/jpeg", 1))
        .await;

    server.advance(Duration::days(2));
    assert_eq!(sweep(&server).await["expired_sessions"], 1);
    let again = sweep(&server).await;
    assert_eq!(
        again,
        json!({
            "expired_sessions": 0,
            "removed_tombstones": 0,
            "reopened_sessions": 0,
            "released_ranges": 0,
            "released_bytes": 0,
        })
    );
}

#[tokio::test]
async fn test_sweep_requires_a_token() {
    let server = TestServer::new().await;
    let (status, body) = json_request(&server.router, "POST", "/v1/admin/sweep", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "unauthenticated");
}

#[tokio::test]
async fn test_assets_survive_restart() {
    let server = persistent_server().await;
    let data = seeded_bytes(11, 40_000);
    let (_, finished) = server.upload_original(ALICE, &data).await;
    let uri = format!(
        "/v1/memories/{}/assets/original",
        finished["memory_id"].as_str().unwrap()
    );
    let in_use = server.state.arena.bytes_in_use();

    let server = server.restart().await;
    assert_eq!(server.state.arena.bytes_in_use(), in_use);

    let (status, headers, body) = server.fetch(ALICE, &uri).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["x-keepsake-tier"], "internal");
    assert_eq!(body, data);
}

#[tokio::test]
async fn test_upload_resumes_after_restart() {
    let server = persistent_server().await;
    let capsule_id = server.create_capsule(ALICE).await;
    let data = seeded_bytes(12, 6_000);
    let (_, begun) = server
        .begin(
            ALICE,
            &capsule_id,
            2,
            "resume-me",
            asset_json("original", "image/png", 6_000),
        )
        .await;
    let session_id = begun["session_id"].as_str().unwrap().to_string();
    server.put_chunk(ALICE, &session_id, 0, &data[..3_000]).await;

    let server = server.restart().await;

    let (status, resumed) = server
        .begin(
            ALICE,
            &capsule_id,
            2,
            "resume-me",
            asset_json("original", "image/png", 6_000),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(resumed["resumed"], true);
    assert_eq!(resumed["session_id"], session_id.as_str());
    let (_, status_body) = server.status(ALICE, &session_id).await;
    assert_eq!(status_body["missing_chunks"], json!([1]));

    let (status, _) = server.put_chunk(ALICE, &session_id, 1, &data[3_000..]).await;
    assert_eq!(status, StatusCode::OK);
    let (status, finished) = server.finish(ALICE, &session_id, &data).await;
    assert_eq!(status, StatusCode::OK, "{finished}");

    let (_, _, body) = server
        .fetch(
            ALICE,
            &format!(
                "/v1/memories/{}/assets/original",
                finished["memory_id"].as_str().unwrap()
            ),
        )
        .await;
    assert_eq!(body, data);
}

#[tokio::test]
async fn test_restart_does_not_double_allocate() {
    let server = persistent_server().await;
    let (_, first) = server.upload_original(ALICE, &seeded_bytes(1, 50_000)).await;
    let server = server.restart().await;
    let (_, second) = server.upload_original(ALICE, &seeded_bytes(2, 50_000)).await;

    // Both assets are intact, so the second did not land on the first's range.
    for (finished, seed) in [(&first, 1), (&second, 2)] {
        let (_, _, body) = server
            .fetch(
                ALICE,
                &format!(
                    "/v1/memories/{}/assets/original",
                    finished["memory_id"].as_str().unwrap()
                ),
            )
            .await;
        assert_eq!(body, seeded_bytes(seed, 50_000));
    }
}

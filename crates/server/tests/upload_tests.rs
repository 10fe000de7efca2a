//! Integration tests for the upload session lifecycle.

mod common;

use axum::http::StatusCode;
use bytes::Bytes;
use common::{ALICE, BOB, TestServer, asset_json, bytes_request, json_request, seeded_bytes, sha256_hex};
use serde_json::json;

async fn begin_session(server: &TestServer, capsule_id: &str, chunks: u32, size: u64) -> String {
    let (status, body) = server
        .begin(
            ALICE,
            capsule_id,
            chunks,
            "photo-1",
            asset_json("original", "image/jpeg", size),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "begin: {body}");
    body["session_id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_chunked_upload_round_trip() {
    let server = TestServer::new().await;
    let capsule_id = server.create_capsule(ALICE).await;
    let data = seeded_bytes(7, 40_000);

    let finished = server
        .upload(
            ALICE,
            &capsule_id,
            &data,
            3_000,
            asset_json("original", "image/jpeg", data.len() as u64),
        )
        .await;
    let memory_id = finished["memory_id"].as_str().unwrap();
    assert!(finished["asset_id"].is_string());

    let (status, headers, body) = server
        .fetch(ALICE, &format!("/v1/memories/{memory_id}/assets/original"))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, data);
    assert_eq!(headers["content-type"], "image/jpeg");
    assert_eq!(headers["content-length"], "40000");
    assert_eq!(headers["etag"], format!("\"{}\"", sha256_hex(&data)).as_str());
    assert_eq!(headers["x-keepsake-tier"], "internal");
}

#[tokio::test]
async fn test_two_chunk_upload_lands_internal_and_finish_is_repeatable() {
    let server = TestServer::new().await;
    let capsule_id = server.create_capsule(ALICE).await;
    let first = vec![0xAAu8; 1024 * 1024];
    let second = vec![0xBBu8; 512 * 1024];
    let whole = [first.as_slice(), second.as_slice()].concat();
    assert_eq!(whole.len(), 1_572_864);

    let (status, body) = server
        .begin(
            ALICE,
            &capsule_id,
            2,
            "k1",
            asset_json("original", "application/octet-stream", 1_572_864),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "begin: {body}");
    let session_id = body["session_id"].as_str().unwrap().to_string();

    let (status, body) = server.put_chunk(ALICE, &session_id, 0, &first).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let (status, body) = server.put_chunk(ALICE, &session_id, 1, &second).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["received_bytes"], 1_572_864);

    let (status, finished) = server
        .finish_with(ALICE, &session_id, &sha256_hex(&whole), 1_572_864)
        .await;
    assert_eq!(status, StatusCode::OK, "{finished}");
    let memory_id = finished["memory_id"].as_str().unwrap();

    let (status, headers, served) = server
        .fetch(ALICE, &format!("/v1/memories/{memory_id}/assets/original"))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(served.as_ref(), whole.as_slice());
    assert_eq!(headers["x-keepsake-tier"], "internal");

    let (status, again) = server
        .finish_with(ALICE, &session_id, &sha256_hex(&whole), 1_572_864)
        .await;
    assert_eq!(status, StatusCode::OK, "{again}");
    assert_eq!(again["asset_id"], finished["asset_id"]);
    assert_eq!(again["memory_id"], finished["memory_id"]);
}

#[tokio::test]
async fn test_chunks_may_arrive_in_any_order() {
    let server = TestServer::new().await;
    let capsule_id = server.create_capsule(ALICE).await;
    let data = seeded_bytes(11, 900);
    let session_id = begin_session(&server, &capsule_id, 3, 900).await;

    for index in [2u32, 0, 1] {
        let start = index as usize * 300;
        let (status, _) = server
            .put_chunk(ALICE, &session_id, index, &data[start..start + 300])
            .await;
        assert_eq!(status, StatusCode::OK);
    }

    let (status, body) = server.finish(ALICE, &session_id, &data).await;
    assert_eq!(status, StatusCode::OK, "{body}");
}

#[tokio::test]
async fn test_resent_chunk_replaces_previous_bytes() {
    let server = TestServer::new().await;
    let capsule_id = server.create_capsule(ALICE).await;
    let data = seeded_bytes(3, 200);
    let session_id = begin_session(&server, &capsule_id, 2, 200).await;

    let (_, first) = server.put_chunk(ALICE, &session_id, 0, &[0u8; 100]).await;
    assert_eq!(first["received_bytes"], 100);
    let (_, resent) = server.put_chunk(ALICE, &session_id, 0, &data[..100]).await;
    assert_eq!(resent["received_chunk_count"], 1);
    assert_eq!(resent["received_bytes"], 100);

    let (_, second) = server.put_chunk(ALICE, &session_id, 1, &data[100..]).await;
    assert_eq!(second["received_chunk_count"], 2);
    assert_eq!(second["received_bytes"], 200);

    let (status, body) = server.finish(ALICE, &session_id, &data).await;
    assert_eq!(status, StatusCode::OK, "{body}");
}

#[tokio::test]
async fn test_begin_is_idempotent_per_owner_and_key() {
    let server = TestServer::new().await;
    let capsule_id = server.create_capsule(ALICE).await;
    let asset = asset_json("original", "image/png", 10);

    let (status, first) = server.begin(ALICE, &capsule_id, 1, "k", asset.clone()).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(first["resumed"], false);
    assert_eq!(first["state"], "open");

    let (status, again) = server.begin(ALICE, &capsule_id, 1, "k", asset.clone()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(again["resumed"], true);
    assert_eq!(again["session_id"], first["session_id"]);

    let (status, other_key) = server.begin(ALICE, &capsule_id, 1, "k2", asset.clone()).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_ne!(other_key["session_id"], first["session_id"]);

    // Same key, different owner: an independent session.
    let bob_capsule = server.create_capsule(BOB).await;
    let (status, bobs) = server.begin(BOB, &bob_capsule, 1, "k", asset).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_ne!(bobs["session_id"], first["session_id"]);
}

#[tokio::test]
async fn test_second_finish_returns_recorded_result() {
    let server = TestServer::new().await;
    let capsule_id = server.create_capsule(ALICE).await;
    let data = seeded_bytes(5, 64);
    let session_id = begin_session(&server, &capsule_id, 1, 64).await;
    server.put_chunk(ALICE, &session_id, 0, &data).await;

    let (status, first) = server.finish(ALICE, &session_id, &data).await;
    assert_eq!(status, StatusCode::OK);
    let (status, second) = server.finish(ALICE, &session_id, &data).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first, second);

    // The completed session still answers begin for its key.
    let (status, resumed) = server
        .begin(
            ALICE,
            &capsule_id,
            1,
            "photo-1",
            asset_json("original", "image/jpeg", 64),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(resumed["state"], "completed");
    assert_eq!(resumed["session_id"], session_id.as_str());

    let (_, status_body) = server.status(ALICE, &session_id).await;
    assert_eq!(status_body["state"], "completed");
    assert_eq!(status_body["missing_chunks"], json!([]));

    let (_, listed) = json_request(
        &server.router,
        "GET",
        &format!("/v1/memories/{}/assets", first["memory_id"].as_str().unwrap()),
        None,
        Some(ALICE),
    )
    .await;
    assert_eq!(listed["assets"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_finish_requires_every_chunk() {
    let server = TestServer::new().await;
    let capsule_id = server.create_capsule(ALICE).await;
    let data = seeded_bytes(9, 300);
    let session_id = begin_session(&server, &capsule_id, 3, 300).await;
    server.put_chunk(ALICE, &session_id, 1, &data[100..200]).await;

    let (status, body) = server.finish(ALICE, &session_id, &data).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "incomplete_upload");

    let (status, progress) = server.status(ALICE, &session_id).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(progress["state"], "open");
    assert_eq!(progress["received_chunk_count"], 1);
    assert_eq!(progress["missing_chunks"], json!([0, 2]));
}

#[tokio::test]
async fn test_chunk_index_out_of_range() {
    let server = TestServer::new().await;
    let capsule_id = server.create_capsule(ALICE).await;
    let session_id = begin_session(&server, &capsule_id, 2, 10).await;

    let (status, body) = server.put_chunk(ALICE, &session_id, 2, b"abc").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "out_of_range");

    let (status, body) = server.put_chunk(ALICE, &session_id, u32::MAX, b"abc").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "out_of_range");
}

#[tokio::test]
async fn test_checksum_mismatch_reopens_session() {
    let server = TestServer::new().await;
    let capsule_id = server.create_capsule(ALICE).await;
    let data = seeded_bytes(21, 500);
    let session_id = begin_session(&server, &capsule_id, 2, 500).await;

    let mut corrupted = data[250..].to_vec();
    corrupted[0] ^= 0xff;
    server.put_chunk(ALICE, &session_id, 0, &data[..250]).await;
    server.put_chunk(ALICE, &session_id, 1, &corrupted).await;

    let (status, body) = server.finish(ALICE, &session_id, &data).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "checksum_mismatch");

    let (_, progress) = server.status(ALICE, &session_id).await;
    assert_eq!(progress["state"], "open");

    // Fix the bad chunk and finish again.
    server.put_chunk(ALICE, &session_id, 1, &data[250..]).await;
    let (status, body) = server.finish(ALICE, &session_id, &data).await;
    assert_eq!(status, StatusCode::OK, "{body}");
}

#[tokio::test]
async fn test_size_mismatch_is_rejected() {
    let server = TestServer::new().await;
    let capsule_id = server.create_capsule(ALICE).await;
    let data = seeded_bytes(4, 40);
    let session_id = begin_session(&server, &capsule_id, 1, 40).await;
    server.put_chunk(ALICE, &session_id, 0, &data).await;

    let (status, body) = server
        .finish_with(ALICE, &session_id, &sha256_hex(&data), 41)
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "size_mismatch");

    // The session is untouched and can still finish.
    let (status, _) = server.finish(ALICE, &session_id, &data).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_declared_size_must_match_received_bytes() {
    let server = TestServer::new().await;
    let capsule_id = server.create_capsule(ALICE).await;
    let data = seeded_bytes(4, 30);
    // Declares 40 bytes but only 30 arrive.
    let session_id = begin_session(&server, &capsule_id, 1, 40).await;
    server.put_chunk(ALICE, &session_id, 0, &data).await;

    let (status, body) = server.finish(ALICE, &session_id, &data).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "size_mismatch");
}

#[tokio::test]
async fn test_malformed_digest_is_invalid_argument() {
    let server = TestServer::new().await;
    let capsule_id = server.create_capsule(ALICE).await;
    let session_id = begin_session(&server, &capsule_id, 1, 3).await;
    server.put_chunk(ALICE, &session_id, 0, b"abc").await;

    for digest in ["abc", &"zz".repeat(32), &"ab".repeat(33)] {
        let (status, body) = server.finish_with(ALICE, &session_id, digest, 3).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{digest}");
        assert_eq!(body["code"], "invalid_argument");
    }

    // Uppercase hex is accepted.
    let upper = sha256_hex(b"abc").to_uppercase();
    let (status, _) = server.finish_with(ALICE, &session_id, &upper, 3).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_oversized_chunk_is_invalid_argument() {
    let server = TestServer::with_config(|config, _| {
        config.server.max_chunk_size = 64;
    })
    .await;
    let capsule_id = server.create_capsule(ALICE).await;
    let session_id = begin_session(&server, &capsule_id, 2, 100).await;

    let (status, body) = server.put_chunk(ALICE, &session_id, 0, &[1u8; 65]).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_argument");

    let (status, _) = server.put_chunk(ALICE, &session_id, 0, &[1u8; 64]).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_begin_validates_arguments() {
    let server = TestServer::new().await;
    let capsule_id = server.create_capsule(ALICE).await;
    let asset = asset_json("original", "image/jpeg", 10);

    let (status, body) = server.begin(ALICE, &capsule_id, 0, "k", asset.clone()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_argument");

    let (status, body) = server.begin(ALICE, &capsule_id, 1, "", asset.clone()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_argument");

    let (status, body) = server
        .begin(ALICE, &capsule_id, 1, "k", asset_json("preview", "image/jpeg", 10))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_argument");

    let unknown = uuid::Uuid::new_v4().to_string();
    let (status, body) = server.begin(ALICE, &unknown, 1, "k", asset).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "not_found");
}

#[tokio::test]
async fn test_only_the_owner_may_touch_a_session() {
    let server = TestServer::new().await;
    let capsule_id = server.create_capsule(ALICE).await;
    let session_id = begin_session(&server, &capsule_id, 1, 3).await;

    let (status, body) = server.put_chunk(BOB, &session_id, 0, b"abc").await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "unauthorized");

    let (status, body) = server.status(BOB, &session_id).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "unauthorized");

    let (status, body) = server.finish(BOB, &session_id, b"abc").await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "unauthorized");

    let (status, body) = json_request(
        &server.router,
        "DELETE",
        &format!("/v1/uploads/{session_id}"),
        None,
        Some(BOB),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "unauthorized");

    // Bob cannot begin into Alice's capsule either.
    let (status, body) = server
        .begin(BOB, &capsule_id, 1, "k", asset_json("original", "image/jpeg", 3))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "unauthorized");
}

#[tokio::test]
async fn test_abort_releases_session() {
    let server = TestServer::new().await;
    let capsule_id = server.create_capsule(ALICE).await;
    let session_id = begin_session(&server, &capsule_id, 2, 6).await;
    server.put_chunk(ALICE, &session_id, 0, b"abc").await;
    assert!(server.state.arena.bytes_in_use() > 0);

    let uri = format!("/v1/uploads/{session_id}");
    let (status, _) = json_request(&server.router, "DELETE", &uri, None, Some(ALICE)).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(server.state.arena.bytes_in_use(), 0);

    // Aborting again is a no-op.
    let (status, _) = json_request(&server.router, "DELETE", &uri, None, Some(ALICE)).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = server.put_chunk(ALICE, &session_id, 1, b"def").await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "conflict");

    let (status, body) = server.finish(ALICE, &session_id, b"abcdef").await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "conflict");

    // The key is free again.
    let (status, body) = server
        .begin(ALICE, &capsule_id, 2, "photo-1", asset_json("original", "image/jpeg", 6))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_ne!(body["session_id"], session_id.as_str());

    // Unknown sessions abort cleanly.
    let unknown = format!("/v1/uploads/{}", uuid::Uuid::new_v4());
    let (status, _) = json_request(&server.router, "DELETE", &unknown, None, Some(ALICE)).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn test_expired_session_is_not_found() {
    let server = TestServer::new().await;
    let capsule_id = server.create_capsule(ALICE).await;
    let session_id = begin_session(&server, &capsule_id, 2, 6).await;
    server.put_chunk(ALICE, &session_id, 0, b"abc").await;

    server.advance(time::Duration::days(2));

    let (status, body) = server.put_chunk(ALICE, &session_id, 1, b"def").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "not_found");

    let (status, body) = server.finish(ALICE, &session_id, b"abcdef").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "not_found");

    // The same key starts over with a fresh session.
    let (status, body) = server
        .begin(ALICE, &capsule_id, 2, "photo-1", asset_json("original", "image/jpeg", 6))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_ne!(body["session_id"], session_id.as_str());
    assert_eq!(server.state.arena.bytes_in_use(), 0);
}

#[tokio::test]
async fn test_unknown_session_is_not_found() {
    let server = TestServer::new().await;
    let unknown = uuid::Uuid::new_v4().to_string();

    let (status, body) = server.put_chunk(ALICE, &unknown, 0, b"x").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "not_found");

    let (status, body) = server.put_chunk(ALICE, "not-a-uuid", 0, b"x").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_argument");
}

#[tokio::test]
async fn test_requests_need_a_valid_token() {
    let server = TestServer::new().await;

    let (status, body) = json_request(&server.router, "POST", "/v1/capsules", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "unauthenticated");

    let (status, body) =
        json_request(&server.router, "POST", "/v1/capsules", None, Some("nope")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "unauthenticated");
}

#[tokio::test]
async fn test_chunk_bytes_are_binary_safe() {
    let server = TestServer::new().await;
    let capsule_id = server.create_capsule(ALICE).await;
    // Invalid UTF-8, NULs and CR/LF survive unchanged.
    let data: Vec<u8> = (0..=255u8).chain([0, 0, b'\r', b'\n', 0xc3, 0x28]).collect();

    let finished = server
        .upload(
            ALICE,
            &capsule_id,
            &data,
            100,
            asset_json("original", "application/octet-stream", data.len() as u64),
        )
        .await;

    let (status, _, body) = bytes_request(
        &server.router,
        "GET",
        &format!(
            "/v1/memories/{}/assets/original",
            finished["memory_id"].as_str().unwrap()
        ),
        Bytes::new(),
        Some(ALICE),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_ref(), data.as_slice());
}

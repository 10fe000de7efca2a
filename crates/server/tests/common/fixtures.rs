//! Payload builders shared by the server tests.

use bytes::Bytes;
use keepsake_core::ContentHash;
use serde_json::{Value, json};

/// Reproducible filler bytes; equal seeds give equal output.
pub fn seeded_bytes(seed: u64, len: usize) -> Bytes {
    let mut state = seed ^ 0x9e37_79b9_7f4a_7c15;
    let data: Vec<u8> = (0..len)
        .map(|_| {
            // xorshift64
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state >> 24) as u8
        })
        .collect();
    Bytes::from(data)
}

/// Lowercase SHA-256 hex of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    ContentHash::compute(data).to_hex()
}

/// Cut `data` into upload chunks; empty input still yields one chunk.
pub fn split_into_chunks(data: &[u8], chunk_size: usize) -> Vec<Bytes> {
    if data.is_empty() {
        return vec![Bytes::new()];
    }
    data.chunks(chunk_size).map(Bytes::copy_from_slice).collect()
}

/// Pending asset metadata for a begin request.
pub fn asset_json(variant: &str, mime_type: &str, byte_size: u64) -> Value {
    json!({
        "variant": variant,
        "mime_type": mime_type,
        "byte_size": byte_size,
    })
}

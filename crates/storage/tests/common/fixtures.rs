use bytes::Bytes;
use keepsake_core::ContentHash;

pub fn sha256_hash(data: &[u8]) -> String {
    ContentHash::compute(data).to_hex()
}

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

#[test]
fn seeds_are_reproducible_and_distinct() {
    assert_eq!(seeded_bytes(3, 512), seeded_bytes(3, 512));
    assert_ne!(seeded_bytes(3, 512), seeded_bytes(4, 512));
}

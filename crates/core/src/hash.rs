//! Content hashing and reassembled-stream verification.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// A SHA-256 content hash represented as 32 bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Create a new ContentHash from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Create from a byte slice, which must be exactly 32 bytes long.
    pub fn from_slice(bytes: &[u8]) -> crate::Result<Self> {
        let arr: [u8; 32] = bytes.try_into().map_err(|_| {
            crate::Error::InvalidArgument(format!(
                "sha256 digest must be 32 bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(arr))
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Compute SHA-256 hash of data.
    pub fn compute(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    /// Create an incremental hasher.
    pub fn hasher() -> ContentHasher {
        ContentHasher(Sha256::new())
    }

    /// Parse from a hex string (case-insensitive).
    pub fn from_hex(s: &str) -> crate::Result<Self> {
        if s.len() != 64 {
            return Err(crate::Error::InvalidArgument(format!(
                "expected 64 hex chars, got {}",
                s.len()
            )));
        }
        let mut bytes = [0u8; 32];
        for (i, pair) in s.as_bytes().chunks(2).enumerate() {
            let hex_str = std::str::from_utf8(pair)
                .map_err(|e| crate::Error::InvalidArgument(e.to_string()))?;
            bytes[i] = u8::from_str_radix(hex_str, 16)
                .map_err(|e| crate::Error::InvalidArgument(format!("invalid hex digest: {e}")))?;
        }
        Ok(Self(bytes))
    }

    /// Encode as lowercase hex string.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Incremental SHA-256 hasher.
pub struct ContentHasher(Sha256);

impl ContentHasher {
    /// Update the hasher with data.
    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    /// Finalize and return the hash.
    pub fn finalize(self) -> ContentHash {
        ContentHash(self.0.finalize().into())
    }
}

/// Verifies a byte stream fed to it piecewise against a declared digest and length.
///
/// The stream is never buffered; only the running digest and byte count are kept.
pub struct HashVerifier {
    hasher: ContentHasher,
    bytes_seen: u64,
}

impl HashVerifier {
    pub fn new() -> Self {
        Self {
            hasher: ContentHash::hasher(),
            bytes_seen: 0,
        }
    }

    /// Feed the next slice of the stream.
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.bytes_seen += data.len() as u64;
    }

    /// Number of bytes fed so far.
    pub fn bytes_seen(&self) -> u64 {
        self.bytes_seen
    }

    /// Finish the stream, checking the length first and then the digest.
    ///
    /// Returns the computed digest on success.
    pub fn verify(self, expected: &ContentHash, expected_len: u64) -> crate::Result<ContentHash> {
        if self.bytes_seen != expected_len {
            return Err(crate::Error::SizeMismatch {
                expected: expected_len,
                actual: self.bytes_seen,
            });
        }
        let actual = self.hasher.finalize();
        if actual != *expected {
            return Err(crate::Error::ChecksumMismatch {
                expected: expected.to_hex(),
                actual: actual.to_hex(),
            });
        }
        Ok(actual)
    }

    /// Finish the stream without checking against an expected digest.
    pub fn finalize(self) -> (ContentHash, u64) {
        (self.hasher.finalize(), self.bytes_seen)
    }
}

impl Default for HashVerifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn test_content_hash_hex_roundtrip() {
        let hash = ContentHash::compute(b"hello world");
        let hex = hash.to_hex();
        assert_eq!(
            hex,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert_eq!(ContentHash::from_hex(&hex).unwrap(), hash);
        assert_eq!(ContentHash::from_hex(&hex.to_uppercase()).unwrap(), hash);
    }

    #[test]
    fn test_content_hash_rejects_bad_input() {
        assert!(matches!(
            ContentHash::from_hex("abcd"),
            Err(Error::InvalidArgument(_))
        ));
        let not_hex = "zz".repeat(32);
        assert!(ContentHash::from_hex(&not_hex).is_err());
        assert!(ContentHash::from_slice(&[0u8; 31]).is_err());
        assert!(ContentHash::from_slice(&[7u8; 32]).is_ok());
    }

    #[test]
    fn test_verifier_matches_one_shot_hash_across_splits() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let expected = ContentHash::compute(&data);

        for split in [1usize, 7, 1000, 4096, 10_000] {
            let mut verifier = HashVerifier::new();
            for piece in data.chunks(split) {
                verifier.update(piece);
            }
            assert_eq!(verifier.bytes_seen(), data.len() as u64);
            let digest = verifier.verify(&expected, data.len() as u64).unwrap();
            assert_eq!(digest, expected);
        }
    }

    #[test]
    fn test_verifier_reports_size_before_checksum() {
        let mut verifier = HashVerifier::new();
        verifier.update(b"abc");
        let err = verifier
            .verify(&ContentHash::compute(b"abcd"), 4)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::SizeMismatch {
                expected: 4,
                actual: 3
            }
        ));
    }

    #[test]
    fn test_verifier_detects_tampering() {
        let expected = ContentHash::compute(b"original");
        let mut verifier = HashVerifier::new();
        verifier.update(b"origina!");
        let err = verifier.verify(&expected, 8).unwrap_err();
        assert!(matches!(err, Error::ChecksumMismatch { .. }));
    }
}

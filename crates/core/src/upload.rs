//! Upload session types and lifecycle.

use crate::asset::AssetVariant;
use crate::ids::{AssetId, CapsuleId, MemoryId, SessionId};
use crate::principal::Principal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Maximum length of an idempotency key.
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 128;

/// Maximum length of a MIME type.
pub const MAX_MIME_TYPE_LEN: usize = 255;

/// Maximum number of tags carried by one asset.
pub const MAX_TAGS: usize = 64;

/// Upload session state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Accepting chunks.
    Open,
    /// A finish call is assembling the asset.
    Finishing,
    /// Finished. Kept only so a repeated finish can return the same result.
    Completed,
    /// Aborted by its owner.
    Aborted,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Finishing => "finishing",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
        }
    }

    pub fn parse(s: &str) -> crate::Result<Self> {
        match s {
            "open" => Ok(Self::Open),
            "finishing" => Ok(Self::Finishing),
            "completed" => Ok(Self::Completed),
            "aborted" => Ok(Self::Aborted),
            other => Err(crate::Error::InvalidArgument(format!(
                "unknown session state: {other}"
            ))),
        }
    }

    /// Check if the session can still receive chunks.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Open)
    }

    /// Check if the session reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }
}

/// Describes the asset a session is building.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingAssetMetadata {
    pub variant: AssetVariant,
    pub mime_type: String,
    /// Declared size of the finished asset in bytes.
    pub byte_size: u64,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    /// Memory the asset belongs to. A new memory is created when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_id: Option<MemoryId>,
    /// Remove older assets of the same variant once this one is stored.
    #[serde(default)]
    pub replace: bool,
}

impl PendingAssetMetadata {
    pub fn new(variant: AssetVariant, mime_type: impl Into<String>, byte_size: u64) -> Self {
        Self {
            variant,
            mime_type: mime_type.into(),
            byte_size,
            tags: Vec::new(),
            width: None,
            height: None,
            memory_id: None,
            replace: false,
        }
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.mime_type.trim().is_empty() {
            return Err(crate::Error::InvalidArgument(
                "mime_type must not be empty".to_string(),
            ));
        }
        if self.mime_type.len() > MAX_MIME_TYPE_LEN {
            return Err(crate::Error::InvalidArgument(format!(
                "mime_type exceeds {MAX_MIME_TYPE_LEN} bytes"
            )));
        }
        if self.tags.len() > MAX_TAGS {
            return Err(crate::Error::InvalidArgument(format!(
                "at most {MAX_TAGS} tags are allowed"
            )));
        }
        Ok(())
    }
}

/// An in-flight upload.
#[derive(Clone, Debug)]
pub struct UploadSession {
    pub id: SessionId,
    /// Only this identity may act on the session.
    pub owner: Principal,
    pub capsule_id: CapsuleId,
    pub declared_chunk_count: u32,
    /// Number of distinct chunk indices written so far.
    pub received_chunk_count: u32,
    /// Sum of the current lengths of all written chunks.
    pub received_bytes: u64,
    pub idempotency_key: String,
    pub pending: PendingAssetMetadata,
    pub state: SessionState,
    /// Result recorded when the session completed.
    pub result: Option<(AssetId, MemoryId)>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
}

impl UploadSession {
    /// Create a new open session expiring `ttl` after `now`.
    pub fn new(
        owner: Principal,
        capsule_id: CapsuleId,
        declared_chunk_count: u32,
        idempotency_key: String,
        pending: PendingAssetMetadata,
        now: OffsetDateTime,
        ttl: time::Duration,
    ) -> Self {
        Self {
            id: SessionId::new(),
            owner,
            capsule_id,
            declared_chunk_count,
            received_chunk_count: 0,
            received_bytes: 0,
            idempotency_key,
            pending,
            state: SessionState::Open,
            result: None,
            created_at: now,
            updated_at: now,
            expires_at: now + ttl,
        }
    }

    /// Check if the session has expired as of `now`.
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        self.expires_at < now
    }

    /// Check if every declared index has been written.
    pub fn is_complete(&self) -> bool {
        self.received_chunk_count == self.declared_chunk_count
    }
}

/// Validate an idempotency key.
pub fn validate_idempotency_key(key: &str) -> crate::Result<()> {
    if key.is_empty() {
        return Err(crate::Error::InvalidArgument(
            "idempotency_key must not be empty".to_string(),
        ));
    }
    if key.chars().count() > MAX_IDEMPOTENCY_KEY_LEN {
        return Err(crate::Error::InvalidArgument(format!(
            "idempotency_key exceeds {MAX_IDEMPOTENCY_KEY_LEN} characters"
        )));
    }
    Ok(())
}

/// Request to begin an upload session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BeginUploadRequest {
    pub capsule_id: CapsuleId,
    pub chunk_count: u32,
    pub idempotency_key: String,
    pub asset: PendingAssetMetadata,
}

/// Response from beginning an upload session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BeginUploadResponse {
    pub session_id: SessionId,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    /// True when an existing session was returned for the idempotency key.
    pub resumed: bool,
    pub state: SessionState,
}

/// Progress after accepting one chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutChunkResponse {
    pub chunk_index: u32,
    pub received_chunk_count: u32,
    pub received_bytes: u64,
}

/// Request to finish an upload.
///
/// The digest travels as 64 hex characters that decode to exactly 32 bytes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FinishUploadRequest {
    pub expected_sha256: String,
    pub total_length: u64,
}

/// Result of a finished upload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinishUploadResponse {
    pub asset_id: AssetId,
    pub memory_id: MemoryId,
}

/// Response from querying upload state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadStatusResponse {
    pub session_id: SessionId,
    pub state: SessionState,
    pub declared_chunk_count: u32,
    pub received_chunk_count: u32,
    pub received_bytes: u64,
    /// Indices in `[0, declared_chunk_count)` not yet written.
    pub missing_chunks: Vec<u32>,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

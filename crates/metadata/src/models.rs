//! Database models mapping to the metadata schema.

use crate::error::{MetadataError, MetadataResult};
use keepsake_core::{
    Asset, AssetId, AssetLocation, AssetVariant, CapsuleId, ContentHash, LocationTier, MemoryId,
    PendingAssetMetadata, Principal, SessionId, SessionState, UploadSession,
};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

/// A byte range in the persistent arena, as recorded in the index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StoredRange {
    pub offset: u64,
    pub len: u64,
}

impl StoredRange {
    pub fn new(offset: u64, len: u64) -> Self {
        Self { offset, len }
    }
}

pub(crate) fn to_i64(value: u64, field: &str) -> MetadataResult<i64> {
    i64::try_from(value)
        .map_err(|_| MetadataError::Constraint(format!("{field} {value} exceeds i64 range")))
}

pub(crate) fn to_u64(value: i64, field: &str) -> MetadataResult<u64> {
    u64::try_from(value).map_err(|_| MetadataError::Corrupt(format!("negative {field}: {value}")))
}

fn to_u32(value: i64, field: &str) -> MetadataResult<u32> {
    u32::try_from(value).map_err(|_| MetadataError::Corrupt(format!("{field} out of range: {value}")))
}

fn corrupt(what: &'static str) -> impl FnOnce(keepsake_core::Error) -> MetadataError {
    move |e| MetadataError::Corrupt(format!("{what}: {e}"))
}

// =============================================================================
// Capsules and memories
// =============================================================================

/// Capsule record: the namespace memories belong to.
#[derive(Debug, Clone, FromRow)]
pub struct CapsuleRow {
    pub capsule_id: Uuid,
    pub owner: String,
    pub created_at: OffsetDateTime,
}

/// Principal allowed to write into a capsule besides its owner.
#[derive(Debug, Clone, FromRow)]
pub struct CapsuleWriterRow {
    pub capsule_id: Uuid,
    pub principal: String,
    pub granted_at: OffsetDateTime,
}

/// Memory record.
#[derive(Debug, Clone, FromRow)]
pub struct MemoryRow {
    pub memory_id: Uuid,
    pub capsule_id: Uuid,
    pub created_at: OffsetDateTime,
}

impl MemoryRow {
    pub fn new(memory_id: MemoryId, capsule_id: CapsuleId, created_at: OffsetDateTime) -> Self {
        Self {
            memory_id: *memory_id.as_uuid(),
            capsule_id: *capsule_id.as_uuid(),
            created_at,
        }
    }
}

// =============================================================================
// Upload sessions
// =============================================================================

/// Upload session record.
#[derive(Debug, Clone, FromRow)]
pub struct UploadSessionRow {
    pub session_id: Uuid,
    pub owner: String,
    pub capsule_id: Uuid,
    pub declared_chunk_count: i64,
    pub received_chunk_count: i64,
    pub received_bytes: i64,
    pub idempotency_key: String,
    /// JSON-encoded [`PendingAssetMetadata`].
    pub pending_asset: String,
    pub state: String,
    pub result_asset_id: Option<Uuid>,
    pub result_memory_id: Option<Uuid>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
}

impl UploadSessionRow {
    pub fn from_session(session: &UploadSession) -> MetadataResult<Self> {
        let (result_asset_id, result_memory_id) = match session.result {
            Some((asset_id, memory_id)) => (Some(*asset_id.as_uuid()), Some(*memory_id.as_uuid())),
            None => (None, None),
        };
        Ok(Self {
            session_id: *session.id.as_uuid(),
            owner: session.owner.as_str().to_string(),
            capsule_id: *session.capsule_id.as_uuid(),
            declared_chunk_count: i64::from(session.declared_chunk_count),
            received_chunk_count: i64::from(session.received_chunk_count),
            received_bytes: to_i64(session.received_bytes, "received_bytes")?,
            idempotency_key: session.idempotency_key.clone(),
            pending_asset: serde_json::to_string(&session.pending)?,
            state: session.state.as_str().to_string(),
            result_asset_id,
            result_memory_id,
            created_at: session.created_at,
            updated_at: session.updated_at,
            expires_at: session.expires_at,
        })
    }

    pub fn into_session(self) -> MetadataResult<UploadSession> {
        let pending: PendingAssetMetadata = serde_json::from_str(&self.pending_asset)?;
        let result = match (self.result_asset_id, self.result_memory_id) {
            (Some(asset_id), Some(memory_id)) => Some((
                AssetId::from_uuid(asset_id),
                MemoryId::from_uuid(memory_id),
            )),
            (None, None) => None,
            _ => {
                return Err(MetadataError::Corrupt(format!(
                    "session {} has a partial result",
                    self.session_id
                )));
            }
        };
        Ok(UploadSession {
            id: SessionId::from_uuid(self.session_id),
            owner: Principal::parse(&self.owner).map_err(corrupt("session owner"))?,
            capsule_id: CapsuleId::from_uuid(self.capsule_id),
            declared_chunk_count: to_u32(self.declared_chunk_count, "declared_chunk_count")?,
            received_chunk_count: to_u32(self.received_chunk_count, "received_chunk_count")?,
            received_bytes: to_u64(self.received_bytes, "received_bytes")?,
            idempotency_key: self.idempotency_key,
            pending,
            state: SessionState::parse(&self.state).map_err(corrupt("session state"))?,
            result,
            created_at: self.created_at,
            updated_at: self.updated_at,
            expires_at: self.expires_at,
        })
    }
}

/// One received chunk: where its bytes live in the arena.
#[derive(Debug, Clone, FromRow)]
pub struct UploadChunkRow {
    pub session_id: Uuid,
    pub chunk_index: i64,
    pub arena_offset: i64,
    pub arena_len: i64,
    pub written_at: OffsetDateTime,
}

impl UploadChunkRow {
    pub fn range(&self) -> MetadataResult<StoredRange> {
        Ok(StoredRange::new(
            to_u64(self.arena_offset, "arena_offset")?,
            to_u64(self.arena_len, "arena_len")?,
        ))
    }
}

/// Outcome of recording a chunk in the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRecordOutcome {
    /// Range the index pointed at before this write, if the index was already written.
    pub previous: Option<StoredRange>,
    /// Distinct indices written after this call.
    pub received_chunk_count: u32,
    pub received_bytes: u64,
}

impl ChunkRecordOutcome {
    pub fn first_write(&self) -> bool {
        self.previous.is_none()
    }
}

/// Outcome of a begin call against the idempotency index.
#[derive(Debug, Clone)]
pub enum BeginOutcome {
    /// A live session already holds the key.
    Existing(UploadSessionRow),
    /// A new session row was inserted. `reclaimed` holds chunk ranges of an
    /// expired session that previously held the key.
    Created {
        row: UploadSessionRow,
        reclaimed: Vec<StoredRange>,
    },
}

/// A session removed by the expiry sweep.
#[derive(Debug, Clone)]
pub struct ExpiredSession {
    pub session_id: Uuid,
    pub state: String,
    pub ranges: Vec<StoredRange>,
}

// =============================================================================
// Assets
// =============================================================================

/// Finished asset record.
#[derive(Debug, Clone, FromRow)]
pub struct AssetRow {
    pub asset_id: Uuid,
    pub memory_id: Uuid,
    pub variant: String,
    pub tier: String,
    pub byte_size: i64,
    pub mime_type: String,
    pub sha256: String,
    /// JSON array of tags.
    pub tags: String,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub inline_data: Option<Vec<u8>>,
    pub arena_offset: Option<i64>,
    pub arena_len: Option<i64>,
    pub external_key: Option<String>,
    pub created_at: OffsetDateTime,
}

impl AssetRow {
    pub fn from_asset(asset: &Asset) -> MetadataResult<Self> {
        let (inline_data, arena_offset, arena_len, external_key) = match &asset.location {
            AssetLocation::Inline(data) => (Some(data.clone()), None, None, None),
            AssetLocation::Internal { offset, len } => (
                None,
                Some(to_i64(*offset, "arena_offset")?),
                Some(to_i64(*len, "arena_len")?),
                None,
            ),
            AssetLocation::External { key } => (None, None, None, Some(key.clone())),
        };
        Ok(Self {
            asset_id: *asset.id.as_uuid(),
            memory_id: *asset.memory_id.as_uuid(),
            variant: asset.variant.as_str().to_string(),
            tier: asset.tier().as_str().to_string(),
            byte_size: to_i64(asset.byte_size, "byte_size")?,
            mime_type: asset.mime_type.clone(),
            sha256: asset.sha256.to_hex(),
            tags: serde_json::to_string(&asset.tags)?,
            width: asset.width.map(i64::from),
            height: asset.height.map(i64::from),
            inline_data,
            arena_offset,
            arena_len,
            external_key,
            created_at: asset.created_at,
        })
    }

    pub fn into_asset(self) -> MetadataResult<Asset> {
        let tier = LocationTier::parse(&self.tier).map_err(corrupt("asset tier"))?;
        let stored = (
            tier,
            self.inline_data,
            self.arena_offset,
            self.arena_len,
            self.external_key,
        );
        let location = match stored {
            (LocationTier::Inline, Some(data), None, None, None) => AssetLocation::Inline(data),
            (LocationTier::Internal, None, Some(offset), Some(len), None) => {
                AssetLocation::Internal {
                    offset: to_u64(offset, "arena_offset")?,
                    len: to_u64(len, "arena_len")?,
                }
            }
            (LocationTier::External, None, None, None, Some(key)) => {
                AssetLocation::External { key }
            }
            _ => {
                return Err(MetadataError::Corrupt(format!(
                    "asset {} location does not match tier {tier}",
                    self.asset_id
                )));
            }
        };
        Ok(Asset {
            id: AssetId::from_uuid(self.asset_id),
            memory_id: MemoryId::from_uuid(self.memory_id),
            variant: AssetVariant::parse(&self.variant).map_err(corrupt("asset variant"))?,
            location,
            byte_size: to_u64(self.byte_size, "byte_size")?,
            mime_type: self.mime_type,
            sha256: ContentHash::from_hex(&self.sha256).map_err(corrupt("asset sha256"))?,
            tags: serde_json::from_str(&self.tags)?,
            width: self.width.map(|w| to_u32(w, "width")).transpose()?,
            height: self.height.map(|h| to_u32(h, "height")).transpose()?,
            created_at: self.created_at,
        })
    }
}

// =============================================================================
// Tokens
// =============================================================================

/// Bearer token record. Only the SHA-256 of the token is stored.
#[derive(Debug, Clone, FromRow)]
pub struct TokenRow {
    pub token_id: Uuid,
    pub principal: String,
    pub token_hash: String,
    pub created_at: OffsetDateTime,
    pub last_used_at: Option<OffsetDateTime>,
    pub revoked_at: Option<OffsetDateTime>,
}

//! Asset variant store: the single path by which finished bytes become an asset.
//!
//! Chunked uploads and one-shot derivative ingestion both end in
//! [`AssetStore::put_finished_asset`], so every asset gets the same tiering,
//! the same verification and the same record shape no matter how its bytes
//! were assembled.

use super::access::require_memory_access;
use crate::error::{ApiError, ApiResult};
use crate::metrics;
use bytes::Bytes;
use futures::StreamExt;
use keepsake_core::config::TieringConfig;
use keepsake_core::{
    Asset, AssetId, AssetLocation, AssetVariant, Clock, ContentHash, HashVerifier, LocationTier,
    MemoryId, PendingAssetMetadata, Principal,
};
use keepsake_metadata::MetadataStore;
use keepsake_metadata::models::AssetRow;
use keepsake_storage::{
    ArenaRange, BlobStore, ByteArena, ByteStream, StorageResult, StreamingUpload,
};
use std::sync::Arc;
use tracing::instrument;

/// Everything about a finished asset except its bytes.
#[derive(Clone, Debug)]
pub struct FinishedAsset {
    pub memory_id: MemoryId,
    pub variant: AssetVariant,
    pub mime_type: String,
    /// Exact length the byte stream must have.
    pub byte_size: u64,
    /// Digest the byte stream must hash to, when the producer knows it.
    pub expected_sha256: Option<ContentHash>,
    pub tags: Vec<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl FinishedAsset {
    pub fn from_pending(
        memory_id: MemoryId,
        pending: &PendingAssetMetadata,
        expected_sha256: Option<ContentHash>,
    ) -> Self {
        Self {
            memory_id,
            variant: pending.variant,
            mime_type: pending.mime_type.clone(),
            byte_size: pending.byte_size,
            expected_sha256,
            tags: pending.tags.clone(),
            width: pending.width,
            height: pending.height,
        }
    }
}

/// Optional inputs for derivative ingestion.
#[derive(Clone, Debug, Default)]
pub struct DerivativeOptions {
    pub mime_type: String,
    pub expected_sha256: Option<ContentHash>,
    pub tags: Vec<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub replace: bool,
}

/// Bytes written to a tier but not yet verified.
enum Staged {
    Inline(Vec<u8>),
    Internal(ArenaRange),
    External {
        key: String,
        upload: Box<dyn StreamingUpload>,
    },
}

impl Staged {
    async fn append(&mut self, arena: &Arc<ByteArena>, at: u64, piece: Bytes) -> StorageResult<()> {
        match self {
            Staged::Inline(buf) => {
                buf.extend_from_slice(&piece);
                Ok(())
            }
            Staged::Internal(range) => arena.write(*range, at, piece).await,
            Staged::External { upload, .. } => upload.write(piece).await,
        }
    }
}

/// Writes finished assets to their tier and removes them again.
pub struct AssetStore {
    metadata: Arc<dyn MetadataStore>,
    arena: Arc<ByteArena>,
    external: Option<Arc<dyn BlobStore>>,
    tiering: TieringConfig,
    clock: Arc<dyn Clock>,
}

impl AssetStore {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        arena: Arc<ByteArena>,
        external: Option<Arc<dyn BlobStore>>,
        tiering: TieringConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            metadata,
            arena,
            external,
            tiering,
            clock,
        }
    }

    pub fn has_external_tier(&self) -> bool {
        self.external.is_some()
    }

    /// Pick the tier for a payload of `size` bytes.
    pub fn select_tier(&self, size: u64) -> LocationTier {
        let tier = self.tiering.select_tier(size, self.external.is_some());
        if tier == LocationTier::Internal && size > self.tiering.internal_max_bytes {
            tracing::warn!(
                bytes = size,
                internal_max_bytes = self.tiering.internal_max_bytes,
                "No external store configured, keeping large asset in the arena"
            );
        }
        tier
    }

    /// Stream `source` into the tier chosen for `draft.byte_size`, verifying
    /// its length and digest on the way.
    ///
    /// The returned asset is not indexed yet. On any failure nothing is left
    /// behind in the tier. Once the caller has recorded the asset it owns the
    /// bytes; if recording fails it must hand them back via [`Self::release_bytes`].
    #[instrument(
        skip(self, draft, source),
        fields(memory_id = %draft.memory_id, variant = %draft.variant, bytes = draft.byte_size)
    )]
    pub async fn put_finished_asset(
        &self,
        draft: FinishedAsset,
        mut source: ByteStream,
    ) -> ApiResult<Asset> {
        let id = AssetId::new();
        let tier = self.select_tier(draft.byte_size);
        let mut staged = self.stage(tier, id, &draft).await?;

        let mut verifier = HashVerifier::new();
        while let Some(piece) = source.next().await {
            let piece = match piece {
                Ok(piece) => piece,
                Err(e) => {
                    self.abandon(staged).await;
                    return Err(e.into());
                }
            };
            let at = verifier.bytes_seen();
            verifier.update(&piece);
            // Past the declared length: keep hashing so the mismatch reports the real size.
            if verifier.bytes_seen() > draft.byte_size {
                continue;
            }
            if let Err(e) = staged.append(&self.arena, at, piece).await {
                self.abandon(staged).await;
                return Err(e.into());
            }
        }

        let verified = match &draft.expected_sha256 {
            Some(expected) => verifier.verify(expected, draft.byte_size),
            None => match verifier.finalize() {
                (hash, len) if len == draft.byte_size => Ok(hash),
                (_, len) => Err(keepsake_core::Error::SizeMismatch {
                    expected: draft.byte_size,
                    actual: len,
                }),
            },
        };
        let sha256 = match verified {
            Ok(hash) => hash,
            Err(e) => {
                self.abandon(staged).await;
                let err = ApiError::from(e);
                metrics::record_upload_error(err.code());
                tracing::warn!(error = %err, "Finished bytes failed verification");
                return Err(err);
            }
        };

        // The index must never point at arena bytes a crash could lose.
        if matches!(staged, Staged::Internal(_))
            && let Err(e) = self.arena.flush().await
        {
            self.abandon(staged).await;
            return Err(e.into());
        }

        let location = match staged {
            Staged::Inline(data) => AssetLocation::Inline(data),
            Staged::Internal(range) => AssetLocation::Internal {
                offset: range.offset,
                len: range.len,
            },
            Staged::External { key, upload } => {
                upload.finish().await?;
                AssetLocation::External { key }
            }
        };

        tracing::debug!(asset_id = %id, tier = %tier, "Stored finished asset bytes");
        Ok(Asset {
            id,
            memory_id: draft.memory_id,
            variant: draft.variant,
            location,
            byte_size: draft.byte_size,
            mime_type: draft.mime_type,
            sha256,
            tags: draft.tags,
            width: draft.width,
            height: draft.height,
            created_at: self.clock.now(),
        })
    }

    async fn stage(&self, tier: LocationTier, id: AssetId, draft: &FinishedAsset) -> ApiResult<Staged> {
        match tier {
            LocationTier::Inline => Ok(Staged::Inline(Vec::with_capacity(
                usize::try_from(draft.byte_size).unwrap_or(0),
            ))),
            LocationTier::Internal => Ok(Staged::Internal(self.arena.allocate(draft.byte_size)?)),
            LocationTier::External => {
                let store = self.external_store()?;
                let key = format!("assets/{}/{}", draft.memory_id, id);
                let upload = store.put_stream(&key).await?;
                Ok(Staged::External { key, upload })
            }
        }
    }

    async fn abandon(&self, staged: Staged) {
        match staged {
            Staged::Inline(_) => {}
            Staged::Internal(range) => self.arena.release(range),
            Staged::External { key, upload } => {
                if let Err(e) = upload.abort().await {
                    tracing::warn!(key = %key, error = %e, "Failed to abort external upload");
                }
            }
        }
    }

    fn external_store(&self) -> ApiResult<&Arc<dyn BlobStore>> {
        self.external
            .as_ref()
            .ok_or_else(|| ApiError::Internal("external store is not configured".to_string()))
    }

    /// Give back the bytes of an asset that is no longer indexed.
    pub async fn release_bytes(&self, asset: &Asset) {
        match &asset.location {
            AssetLocation::Inline(_) => {}
            AssetLocation::Internal { offset, len } => {
                self.arena.release(ArenaRange::new(*offset, *len));
            }
            AssetLocation::External { key } => match &self.external {
                Some(store) => {
                    if let Err(e) = store.delete(key).await {
                        tracing::warn!(
                            asset_id = %asset.id,
                            key = %key,
                            error = %e,
                            "Failed to delete external blob"
                        );
                    }
                }
                None => tracing::warn!(
                    asset_id = %asset.id,
                    key = %key,
                    "External blob left behind: no external store configured"
                ),
            },
        }
    }

    /// Delete every other asset of `kept`'s variant in its memory.
    ///
    /// Runs after `kept` is committed, so the memory never lacks the variant.
    pub async fn apply_replace(&self, kept: &Asset) -> ApiResult<usize> {
        let removed = self
            .metadata
            .delete_other_variants(
                *kept.memory_id.as_uuid(),
                kept.variant.as_str(),
                *kept.id.as_uuid(),
            )
            .await?;
        let count = removed.len();
        for row in removed {
            self.release_bytes(&row.into_asset()?).await;
        }
        if count > 0 {
            tracing::info!(
                memory_id = %kept.memory_id,
                variant = %kept.variant,
                replaced = count,
                "Replaced older assets"
            );
        }
        Ok(count)
    }

    /// Store complete bytes for a variant of an existing memory.
    ///
    /// The new asset is committed before older ones are replaced, so a
    /// failed replace is logged and the ingest still succeeds.
    #[instrument(skip(self, data, options), fields(caller = %caller, bytes = data.len()))]
    pub async fn ingest(
        &self,
        caller: &Principal,
        memory_id: MemoryId,
        variant: AssetVariant,
        data: Bytes,
        options: DerivativeOptions,
    ) -> ApiResult<Asset> {
        require_memory_access(self.metadata.as_ref(), memory_id, caller).await?;

        let mut pending = PendingAssetMetadata::new(variant, options.mime_type, data.len() as u64);
        pending.tags = options.tags;
        pending.width = options.width;
        pending.height = options.height;
        pending.validate()?;

        let draft = FinishedAsset::from_pending(memory_id, &pending, options.expected_sha256);
        let source: ByteStream = Box::pin(futures::stream::once(async move { Ok(data) }));
        let asset = self.put_finished_asset(draft, source).await?;

        let recorded = match AssetRow::from_asset(&asset) {
            Ok(row) => self.metadata.insert_asset(&row).await,
            Err(e) => Err(e),
        };
        if let Err(e) = recorded {
            self.release_bytes(&asset).await;
            return Err(e.into());
        }

        metrics::ASSETS_STORED
            .with_label_values(&[asset.tier().as_str()])
            .inc();
        metrics::set_arena_bytes_in_use(self.arena.bytes_in_use());
        tracing::info!(
            asset_id = %asset.id,
            memory_id = %memory_id,
            variant = %variant,
            tier = %asset.tier(),
            "Ingested asset"
        );

        if options.replace
            && let Err(e) = self.apply_replace(&asset).await
        {
            tracing::warn!(error = %e, asset_id = %asset.id, "Failed to remove replaced assets");
        }
        Ok(asset)
    }

    /// Delete a memory with all of its assets and their bytes.
    #[instrument(skip(self), fields(caller = %caller))]
    pub async fn delete_memory(&self, caller: &Principal, memory_id: MemoryId) -> ApiResult<usize> {
        require_memory_access(self.metadata.as_ref(), memory_id, caller).await?;

        let removed = self.metadata.delete_memory(*memory_id.as_uuid()).await?;
        let count = removed.len();
        for row in removed {
            self.release_bytes(&row.into_asset()?).await;
        }
        metrics::set_arena_bytes_in_use(self.arena.bytes_in_use());
        tracing::info!(memory_id = %memory_id, assets = count, "Deleted memory");
        Ok(count)
    }
}

//! Asset resolver: finds the asset that serves a (memory, variant) request.

use super::access::require_memory_access;
use crate::error::{ApiError, ApiResult};
use crate::metrics;
use bytes::Bytes;
use keepsake_core::{
    Asset, AssetLocation, AssetVariant, LocationTier, MemoryId, Principal, RESOLVE_ORDER,
};
use keepsake_metadata::MetadataStore;
use keepsake_storage::{ArenaRange, BlobStore, ByteArena, ByteStream};
use std::sync::Arc;
use tracing::instrument;

/// Picks the asset to serve among those stored for a memory.
///
/// Only assets of exactly the requested variant are candidates. Among them
/// the first non-empty tier in [`RESOLVE_ORDER`] wins, and within a tier the
/// newest asset. `candidates` must be ordered newest first.
pub fn select_for_serving(candidates: &[Asset], variant: AssetVariant) -> Option<&Asset> {
    RESOLVE_ORDER.iter().find_map(|tier| {
        candidates
            .iter()
            .find(|asset| asset.variant == variant && asset.tier() == *tier)
    })
}

/// Resolves assets and opens their bytes.
pub struct AssetResolver {
    metadata: Arc<dyn MetadataStore>,
    arena: Arc<ByteArena>,
    external: Option<Arc<dyn BlobStore>>,
}

impl AssetResolver {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        arena: Arc<ByteArena>,
        external: Option<Arc<dyn BlobStore>>,
    ) -> Self {
        Self {
            metadata,
            arena,
            external,
        }
    }

    async fn variant_assets(
        &self,
        caller: &Principal,
        memory_id: MemoryId,
        variant: AssetVariant,
    ) -> ApiResult<Vec<Asset>> {
        require_memory_access(self.metadata.as_ref(), memory_id, caller).await?;
        let rows = self
            .metadata
            .list_variant(*memory_id.as_uuid(), variant.as_str())
            .await?;
        rows.into_iter()
            .map(|row| row.into_asset().map_err(ApiError::from))
            .collect()
    }

    /// Resolve a variant name to the asset that serves it.
    ///
    /// An unknown variant name is `InvalidArgument`. A memory without an
    /// asset of that exact variant is `NotFound`; no other variant is ever
    /// substituted.
    #[instrument(skip(self), fields(caller = %caller))]
    pub async fn resolve(
        &self,
        caller: &Principal,
        memory_id: MemoryId,
        variant: &str,
    ) -> ApiResult<Asset> {
        let variant = AssetVariant::parse(variant)?;
        let candidates = self.variant_assets(caller, memory_id, variant).await?;
        let asset = select_for_serving(&candidates, variant).ok_or_else(|| {
            ApiError::NotFound(format!("memory {memory_id} has no {variant} asset"))
        })?;

        metrics::ASSETS_RESOLVED
            .with_label_values(&[asset.tier().as_str()])
            .inc();
        Ok(asset.clone())
    }

    /// Resolve only the Inline-tier representation of a variant.
    ///
    /// Callers opt into this path explicitly; `resolve` never falls back to it.
    #[instrument(skip(self), fields(caller = %caller))]
    pub async fn resolve_inline(
        &self,
        caller: &Principal,
        memory_id: MemoryId,
        variant: &str,
    ) -> ApiResult<Asset> {
        let variant = AssetVariant::parse(variant)?;
        let candidates = self.variant_assets(caller, memory_id, variant).await?;
        let asset = candidates
            .into_iter()
            .find(|asset| asset.tier() == LocationTier::Inline)
            .ok_or_else(|| {
                ApiError::NotFound(format!("memory {memory_id} has no inline {variant} asset"))
            })?;

        metrics::ASSETS_RESOLVED
            .with_label_values(&[LocationTier::Inline.as_str()])
            .inc();
        Ok(asset)
    }

    /// List every asset of a memory, oldest first.
    #[instrument(skip(self), fields(caller = %caller))]
    pub async fn list(&self, caller: &Principal, memory_id: MemoryId) -> ApiResult<Vec<Asset>> {
        require_memory_access(self.metadata.as_ref(), memory_id, caller).await?;
        let rows = self.metadata.list_assets(*memory_id.as_uuid()).await?;
        rows.into_iter()
            .map(|row| row.into_asset().map_err(ApiError::from))
            .collect()
    }

    /// Open an asset's bytes as a stream.
    pub async fn open(&self, asset: &Asset) -> ApiResult<ByteStream> {
        match &asset.location {
            AssetLocation::Inline(data) => {
                let data = Bytes::from(data.clone());
                Ok(Box::pin(futures::stream::once(async move { Ok(data) })))
            }
            AssetLocation::Internal { offset, len } => {
                Ok(self.arena.stream(ArenaRange::new(*offset, *len)))
            }
            AssetLocation::External { key } => {
                let store = self.external.as_ref().ok_or_else(|| {
                    ApiError::Internal(format!(
                        "asset {} is held externally but no external store is configured",
                        asset.id
                    ))
                })?;
                Ok(store.get_stream(key).await?)
            }
        }
    }
}

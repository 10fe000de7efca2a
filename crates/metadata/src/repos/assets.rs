//! Memory and asset repositories.

use crate::error::MetadataResult;
use crate::models::{AssetRow, MemoryRow, StoredRange};
use async_trait::async_trait;
use uuid::Uuid;

/// Repository for memories.
#[async_trait]
pub trait MemoryRepo: Send + Sync {
    /// Create a memory.
    async fn create_memory(&self, memory: &MemoryRow) -> MetadataResult<()>;

    /// Get a memory by ID.
    async fn get_memory(&self, memory_id: Uuid) -> MetadataResult<Option<MemoryRow>>;

    /// Delete a memory and all of its assets.
    ///
    /// Returns the deleted asset rows so their bytes can be released.
    async fn delete_memory(&self, memory_id: Uuid) -> MetadataResult<Vec<AssetRow>>;
}

/// Repository for finished assets.
#[async_trait]
pub trait AssetRepo: Send + Sync {
    /// Insert an asset. The memory must exist.
    async fn insert_asset(&self, asset: &AssetRow) -> MetadataResult<()>;

    /// List all assets of a memory, oldest first.
    async fn list_assets(&self, memory_id: Uuid) -> MetadataResult<Vec<AssetRow>>;

    /// List assets of exactly `variant`, newest first.
    async fn list_variant(&self, memory_id: Uuid, variant: &str) -> MetadataResult<Vec<AssetRow>>;

    /// Delete every asset of `variant` other than `keep`.
    ///
    /// Returns the deleted rows so their bytes can be released.
    async fn delete_other_variants(
        &self,
        memory_id: Uuid,
        variant: &str,
        keep: Uuid,
    ) -> MetadataResult<Vec<AssetRow>>;

    /// All arena ranges referenced by Internal-tier assets.
    async fn live_internal_ranges(&self) -> MetadataResult<Vec<StoredRange>>;
}

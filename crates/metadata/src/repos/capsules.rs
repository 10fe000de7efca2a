//! Capsule repository.

use crate::error::MetadataResult;
use crate::models::{CapsuleRow, CapsuleWriterRow};
use async_trait::async_trait;
use uuid::Uuid;

/// Repository for capsules and their writers.
#[async_trait]
pub trait CapsuleRepo: Send + Sync {
    /// Create a capsule.
    async fn create_capsule(&self, capsule: &CapsuleRow) -> MetadataResult<()>;

    /// Get a capsule by ID.
    async fn get_capsule(&self, capsule_id: Uuid) -> MetadataResult<Option<CapsuleRow>>;

    /// Grant write access. Granting twice is a no-op.
    async fn add_writer(&self, writer: &CapsuleWriterRow) -> MetadataResult<()>;

    /// Check whether `principal` was granted write access.
    async fn is_writer(&self, capsule_id: Uuid, principal: &str) -> MetadataResult<bool>;
}

//! Capsules, writers and the access rule shared by uploads and serving.

use crate::error::{ApiError, ApiResult};
use keepsake_core::{CapsuleId, Clock, MemoryId, Principal};
use keepsake_metadata::MetadataStore;
use keepsake_metadata::models::{CapsuleRow, CapsuleWriterRow, MemoryRow};
use std::sync::Arc;
use tracing::instrument;

/// Load a capsule and check that `caller` may write to it.
///
/// Write access means the caller owns the capsule or was granted as a writer.
/// Reading assets requires the same access.
pub(crate) async fn require_access(
    metadata: &dyn MetadataStore,
    capsule_id: CapsuleId,
    caller: &Principal,
) -> ApiResult<CapsuleRow> {
    let capsule = metadata
        .get_capsule(*capsule_id.as_uuid())
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("capsule {capsule_id}")))?;

    if capsule.owner == caller.as_str()
        || metadata
            .is_writer(capsule.capsule_id, caller.as_str())
            .await?
    {
        Ok(capsule)
    } else {
        Err(ApiError::Unauthorized(format!(
            "no write access to capsule {capsule_id}"
        )))
    }
}

/// Load a memory and check that `caller` has access to its capsule.
pub(crate) async fn require_memory_access(
    metadata: &dyn MetadataStore,
    memory_id: MemoryId,
    caller: &Principal,
) -> ApiResult<MemoryRow> {
    let memory = metadata
        .get_memory(*memory_id.as_uuid())
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("memory {memory_id}")))?;
    require_access(metadata, CapsuleId::from_uuid(memory.capsule_id), caller).await?;
    Ok(memory)
}

/// Capsule management.
pub struct CapsuleService {
    metadata: Arc<dyn MetadataStore>,
    clock: Arc<dyn Clock>,
}

impl CapsuleService {
    pub fn new(metadata: Arc<dyn MetadataStore>, clock: Arc<dyn Clock>) -> Self {
        Self { metadata, clock }
    }

    /// Create a capsule owned by `owner`.
    #[instrument(skip(self), fields(owner = %owner))]
    pub async fn create_capsule(&self, owner: &Principal) -> ApiResult<CapsuleRow> {
        let capsule = CapsuleRow {
            capsule_id: *CapsuleId::new().as_uuid(),
            owner: owner.as_str().to_string(),
            created_at: self.clock.now(),
        };
        self.metadata.create_capsule(&capsule).await?;
        tracing::info!(capsule_id = %capsule.capsule_id, "Created capsule");
        Ok(capsule)
    }

    /// Let `principal` write to a capsule. Only the owner may grant.
    #[instrument(skip(self), fields(caller = %caller, principal = %principal))]
    pub async fn grant_writer(
        &self,
        caller: &Principal,
        capsule_id: CapsuleId,
        principal: &Principal,
    ) -> ApiResult<()> {
        let capsule = self
            .metadata
            .get_capsule(*capsule_id.as_uuid())
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("capsule {capsule_id}")))?;
        if capsule.owner != caller.as_str() {
            return Err(ApiError::Unauthorized(format!(
                "only the owner may grant access to capsule {capsule_id}"
            )));
        }

        self.metadata
            .add_writer(&CapsuleWriterRow {
                capsule_id: capsule.capsule_id,
                principal: principal.as_str().to_string(),
                granted_at: self.clock.now(),
            })
            .await?;
        Ok(())
    }
}

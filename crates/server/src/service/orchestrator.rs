//! Upload orchestrator: begin, chunk, finish and abort.

use super::access::require_access;
use super::sessions::{BegunSession, SessionManager};
use super::variants::{AssetStore, FinishedAsset};
use super::{arena_range, stored_range};
use crate::error::{ApiError, ApiResult};
use crate::metrics;
use bytes::Bytes;
use keepsake_core::upload::{FinishUploadResponse, PutChunkResponse};
use keepsake_core::{
    Asset, CapsuleId, Clock, ContentHash, MemoryId, PendingAssetMetadata, Principal, SessionId,
    SessionState, UploadSession,
};
use keepsake_metadata::models::{AssetRow, MemoryRow};
use keepsake_metadata::{MetadataError, MetadataStore};
use std::sync::Arc;
use std::time::Instant;
use tracing::instrument;

/// Drives uploads from `begin` to a stored asset.
pub struct UploadOrchestrator {
    metadata: Arc<dyn MetadataStore>,
    sessions: Arc<SessionManager>,
    assets: Arc<AssetStore>,
    clock: Arc<dyn Clock>,
}

impl UploadOrchestrator {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        sessions: Arc<SessionManager>,
        assets: Arc<AssetStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            metadata,
            sessions,
            assets,
            clock,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Start (or resume) an upload into a capsule the caller may write to.
    pub async fn begin(
        &self,
        caller: &Principal,
        capsule_id: CapsuleId,
        chunk_count: u32,
        idempotency_key: &str,
        pending: PendingAssetMetadata,
    ) -> ApiResult<BegunSession> {
        require_access(self.metadata.as_ref(), capsule_id, caller).await?;
        if let Some(memory_id) = pending.memory_id {
            self.target_memory(capsule_id, memory_id).await?;
        }
        self.sessions
            .begin(caller, capsule_id, chunk_count, idempotency_key, pending)
            .await
    }

    /// Write the bytes of one chunk, replacing any earlier bytes at that index.
    #[instrument(skip(self, data), fields(caller = %caller, bytes = data.len()))]
    pub async fn put_chunk(
        &self,
        caller: &Principal,
        session_id: SessionId,
        chunk_index: u32,
        data: Bytes,
    ) -> ApiResult<PutChunkResponse> {
        let session = self.sessions.touch_and_validate(session_id, caller).await?;
        if chunk_index >= session.declared_chunk_count {
            return Err(ApiError::OutOfRange {
                index: chunk_index,
                declared: session.declared_chunk_count,
            });
        }
        let max_chunk_size = self.sessions.config().max_chunk_size;
        if data.len() as u64 > max_chunk_size {
            return Err(ApiError::InvalidArgument(format!(
                "chunk of {} bytes exceeds the limit of {max_chunk_size} bytes",
                data.len()
            )));
        }
        if session.state != SessionState::Open {
            return Err(ApiError::Conflict(format!(
                "upload session {session_id} is {} and no longer accepts chunks",
                session.state.as_str()
            )));
        }

        let len = data.len() as u64;
        let sink = self.sessions.sink();
        let range = sink.write(data).await?;

        let outcome = match self
            .metadata
            .record_chunk(
                *session_id.as_uuid(),
                chunk_index,
                stored_range(range),
                self.clock.now(),
            )
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                sink.release_all([range]);
                return Err(match e {
                    MetadataError::NotFound(_) => {
                        ApiError::NotFound(format!("upload session {session_id}"))
                    }
                    other => other.into(),
                });
            }
        };
        if let Some(previous) = outcome.previous {
            sink.release_all([arena_range(previous)]);
        }

        metrics::CHUNKS_RECEIVED.inc();
        metrics::CHUNK_BYTES_RECEIVED.inc_by(len);
        metrics::set_arena_bytes_in_use(sink.arena().bytes_in_use());
        tracing::debug!(
            session_id = %session_id,
            chunk_index,
            bytes = len,
            resend = !outcome.first_write(),
            "Stored chunk"
        );

        Ok(PutChunkResponse {
            chunk_index,
            received_chunk_count: outcome.received_chunk_count,
            received_bytes: outcome.received_bytes,
        })
    }

    /// Verify the assembled upload and store it as an asset.
    ///
    /// A completed session answers with its recorded result. On a failed
    /// verification the session is reopened so the caller can fix the
    /// offending chunks and finish again.
    #[instrument(skip(self, expected_sha256), fields(caller = %caller))]
    pub async fn finish(
        &self,
        caller: &Principal,
        session_id: SessionId,
        expected_sha256: ContentHash,
        total_length: u64,
    ) -> ApiResult<FinishUploadResponse> {
        let session = self.sessions.touch_and_validate(session_id, caller).await?;
        match session.state {
            SessionState::Completed => return recorded_result(&session),
            SessionState::Finishing => {
                return Err(ApiError::Conflict(format!(
                    "upload session {session_id} is already being finished"
                )));
            }
            SessionState::Aborted => {
                return Err(ApiError::Conflict(format!(
                    "upload session {session_id} was aborted"
                )));
            }
            SessionState::Open => {}
        }

        if !session.is_complete() {
            return Err(ApiError::IncompleteUpload {
                received: session.received_chunk_count,
                declared: session.declared_chunk_count,
            });
        }
        if total_length != session.received_bytes {
            metrics::record_upload_error("size_mismatch");
            return Err(ApiError::SizeMismatch {
                expected: total_length,
                actual: session.received_bytes,
            });
        }
        if total_length != session.pending.byte_size {
            metrics::record_upload_error("size_mismatch");
            return Err(ApiError::SizeMismatch {
                expected: session.pending.byte_size,
                actual: total_length,
            });
        }

        let claimed = self
            .metadata
            .begin_finish(*session_id.as_uuid(), self.clock.now())
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("upload session {session_id}")))?
            .into_session()?;
        match claimed.state {
            SessionState::Finishing => {}
            // Another finish got there between our read and the claim.
            SessionState::Completed => return recorded_result(&claimed),
            other => {
                return Err(ApiError::Conflict(format!(
                    "upload session {session_id} is {}",
                    other.as_str()
                )));
            }
        }

        let started = Instant::now();
        match self.store_claimed(&claimed, expected_sha256).await {
            Ok(asset) => {
                metrics::FINISH_DURATION.observe(started.elapsed().as_secs_f64());
                metrics::UPLOAD_SESSIONS_FINISHED.inc();
                metrics::ASSETS_STORED
                    .with_label_values(&[asset.tier().as_str()])
                    .inc();
                metrics::set_arena_bytes_in_use(self.sessions.sink().arena().bytes_in_use());
                tracing::info!(
                    session_id = %session_id,
                    asset_id = %asset.id,
                    memory_id = %asset.memory_id,
                    variant = %asset.variant,
                    tier = %asset.tier(),
                    bytes = asset.byte_size,
                    "Finished upload"
                );

                if claimed.pending.replace
                    && let Err(e) = self.assets.apply_replace(&asset).await
                {
                    tracing::warn!(error = %e, asset_id = %asset.id, "Failed to remove replaced assets");
                }

                Ok(FinishUploadResponse {
                    asset_id: asset.id,
                    memory_id: asset.memory_id,
                })
            }
            Err(e) => {
                if let Err(reopen) = self
                    .metadata
                    .reopen_session(*session_id.as_uuid(), self.clock.now())
                    .await
                {
                    tracing::error!(
                        session_id = %session_id,
                        error = %reopen,
                        "Failed to reopen session after failed finish"
                    );
                }
                Err(e)
            }
        }
    }

    /// Stream the chunks of a claimed session into a stored, indexed asset.
    async fn store_claimed(
        &self,
        session: &UploadSession,
        expected_sha256: ContentHash,
    ) -> ApiResult<Asset> {
        let chunks = self.metadata.list_chunks(*session.id.as_uuid()).await?;
        let contiguous = chunks.len() == session.declared_chunk_count as usize
            && chunks
                .iter()
                .enumerate()
                .all(|(i, chunk)| chunk.chunk_index == i as i64);
        if !contiguous {
            return Err(ApiError::IncompleteUpload {
                received: chunks.len() as u32,
                declared: session.declared_chunk_count,
            });
        }
        let ranges = chunks
            .iter()
            .map(|chunk| chunk.range().map(arena_range))
            .collect::<Result<Vec<_>, _>>()?;

        let (memory_id, new_memory) = match session.pending.memory_id {
            Some(memory_id) => {
                self.target_memory(session.capsule_id, memory_id).await?;
                (memory_id, None)
            }
            None => {
                let memory_id = MemoryId::new();
                let row = MemoryRow::new(memory_id, session.capsule_id, self.clock.now());
                (memory_id, Some(row))
            }
        };

        let draft = FinishedAsset::from_pending(memory_id, &session.pending, Some(expected_sha256));
        let sink = self.sessions.sink();
        let asset = self
            .assets
            .put_finished_asset(draft, sink.assemble(ranges))
            .await?;

        let committed = match AssetRow::from_asset(&asset) {
            Ok(row) => {
                self.metadata
                    .complete_session(
                        *session.id.as_uuid(),
                        &row,
                        new_memory.as_ref(),
                        self.clock.now(),
                    )
                    .await
            }
            Err(e) => Err(e),
        };
        match committed {
            Ok(released) => {
                sink.release_all(released.into_iter().map(arena_range));
                Ok(asset)
            }
            Err(e) => {
                self.assets.release_bytes(&asset).await;
                Err(e.into())
            }
        }
    }

    /// The memory a session targets must exist in the session's capsule.
    async fn target_memory(&self, capsule_id: CapsuleId, memory_id: MemoryId) -> ApiResult<()> {
        match self.metadata.get_memory(*memory_id.as_uuid()).await? {
            Some(memory) if memory.capsule_id == *capsule_id.as_uuid() => Ok(()),
            _ => Err(ApiError::NotFound(format!(
                "memory {memory_id} in capsule {capsule_id}"
            ))),
        }
    }

    /// Abort an upload on behalf of its owner.
    pub async fn abort(&self, caller: &Principal, session_id: SessionId) -> ApiResult<()> {
        self.sessions.abort(session_id, caller).await
    }
}

fn recorded_result(session: &UploadSession) -> ApiResult<FinishUploadResponse> {
    let (asset_id, memory_id) = session.result.ok_or_else(|| {
        ApiError::Internal(format!(
            "completed upload session {} has no recorded result",
            session.id
        ))
    })?;
    Ok(FinishUploadResponse {
        asset_id,
        memory_id,
    })
}

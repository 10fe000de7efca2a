//! Upload session manager: creation, lookup and abort of sessions.

use super::arena_range;
use crate::error::{ApiError, ApiResult};
use crate::metrics;
use keepsake_core::config::ServerConfig;
use keepsake_core::upload::{UploadStatusResponse, validate_idempotency_key};
use keepsake_core::{
    CapsuleId, Clock, PendingAssetMetadata, Principal, SessionId, SessionState, UploadSession,
};
use keepsake_metadata::models::{BeginOutcome, UploadSessionRow};
use keepsake_metadata::{MetadataError, MetadataStore};
use keepsake_storage::ChunkSink;
use std::sync::Arc;
use tracing::instrument;

/// A session returned by [`SessionManager::begin`].
#[derive(Clone, Debug)]
pub struct BegunSession {
    pub session: UploadSession,
    /// True when an existing session was returned for the idempotency key.
    pub resumed: bool,
}

/// Owns the session lifecycle short of finishing.
pub struct SessionManager {
    metadata: Arc<dyn MetadataStore>,
    sink: ChunkSink,
    clock: Arc<dyn Clock>,
    config: ServerConfig,
}

impl SessionManager {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        sink: ChunkSink,
        clock: Arc<dyn Clock>,
        config: ServerConfig,
    ) -> Self {
        Self {
            metadata,
            sink,
            clock,
            config,
        }
    }

    pub fn sink(&self) -> &ChunkSink {
        &self.sink
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Create a session, or return the live one holding `(owner, idempotency_key)`.
    ///
    /// Access to the capsule is checked by the caller.
    #[instrument(skip(self, pending), fields(owner = %owner, capsule_id = %capsule_id))]
    pub async fn begin(
        &self,
        owner: &Principal,
        capsule_id: CapsuleId,
        declared_chunk_count: u32,
        idempotency_key: &str,
        pending: PendingAssetMetadata,
    ) -> ApiResult<BegunSession> {
        if declared_chunk_count == 0 {
            return Err(ApiError::InvalidArgument(
                "chunk_count must be at least 1".to_string(),
            ));
        }
        if declared_chunk_count > self.config.max_chunk_count {
            return Err(ApiError::InvalidArgument(format!(
                "chunk_count {declared_chunk_count} exceeds the limit of {}",
                self.config.max_chunk_count
            )));
        }
        validate_idempotency_key(idempotency_key)?;
        pending.validate()?;

        let largest = u64::from(declared_chunk_count).saturating_mul(self.config.max_chunk_size);
        if pending.byte_size > largest {
            return Err(ApiError::InvalidArgument(format!(
                "byte_size {} cannot fit in {declared_chunk_count} chunks of at most {} bytes",
                pending.byte_size, self.config.max_chunk_size
            )));
        }

        let now = self.clock.now();
        let session = UploadSession::new(
            owner.clone(),
            capsule_id,
            declared_chunk_count,
            idempotency_key.to_string(),
            pending,
            now,
            self.config.upload_ttl(),
        );
        let row = UploadSessionRow::from_session(&session)?;

        match self.metadata.begin_session(&row, now).await {
            Ok(BeginOutcome::Existing(existing)) => {
                let session = existing.into_session()?;
                metrics::UPLOAD_SESSIONS_RESUMED.inc();
                tracing::debug!(session_id = %session.id, "Resumed existing session");
                Ok(BegunSession {
                    session,
                    resumed: true,
                })
            }
            Ok(BeginOutcome::Created { reclaimed, .. }) => {
                if !reclaimed.is_empty() {
                    tracing::debug!(
                        ranges = reclaimed.len(),
                        "Reclaimed chunks of an expired session with the same key"
                    );
                }
                self.sink.release_all(reclaimed.into_iter().map(arena_range));
                metrics::UPLOAD_SESSIONS_CREATED.inc();
                tracing::info!(
                    session_id = %session.id,
                    chunks = declared_chunk_count,
                    variant = %session.pending.variant,
                    "Created upload session"
                );
                Ok(BegunSession {
                    session,
                    resumed: false,
                })
            }
            Err(MetadataError::AlreadyExists(_)) => {
                // Lost a race with an identical begin; the winner is now visible.
                match self.metadata.begin_session(&row, now).await? {
                    BeginOutcome::Existing(existing) => Ok(BegunSession {
                        session: existing.into_session()?,
                        resumed: true,
                    }),
                    BeginOutcome::Created { reclaimed, .. } => {
                        self.sink.release_all(reclaimed.into_iter().map(arena_range));
                        metrics::UPLOAD_SESSIONS_CREATED.inc();
                        Ok(BegunSession {
                            session,
                            resumed: false,
                        })
                    }
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Load a session if it exists, whatever its state.
    pub(crate) async fn load(&self, session_id: SessionId) -> ApiResult<Option<UploadSession>> {
        match self.metadata.get_session(*session_id.as_uuid()).await? {
            Some(row) => Ok(Some(row.into_session()?)),
            None => Ok(None),
        }
    }

    /// Load a live session acting on behalf of `caller`.
    ///
    /// Fails `NotFound` if the session is unknown or expired, `Unauthorized`
    /// if it belongs to someone else.
    pub async fn touch_and_validate(
        &self,
        session_id: SessionId,
        caller: &Principal,
    ) -> ApiResult<UploadSession> {
        let session = self
            .load(session_id)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("upload session {session_id}")))?;
        if session.is_expired(self.clock.now()) {
            return Err(ApiError::NotFound(format!(
                "upload session {session_id} has expired"
            )));
        }
        if &session.owner != caller {
            return Err(ApiError::Unauthorized(format!(
                "upload session {session_id} belongs to another principal"
            )));
        }
        Ok(session)
    }

    /// Report progress, including which indices are still missing.
    #[instrument(skip(self), fields(caller = %caller))]
    pub async fn status(
        &self,
        session_id: SessionId,
        caller: &Principal,
    ) -> ApiResult<UploadStatusResponse> {
        let session = self.touch_and_validate(session_id, caller).await?;

        let written = self.metadata.list_chunks(*session_id.as_uuid()).await?;
        // Chunk records are dropped once the asset is stored.
        let settled = session.state == SessionState::Completed;
        let mut present = vec![settled; session.declared_chunk_count as usize];
        for chunk in &written {
            if let Some(slot) = usize::try_from(chunk.chunk_index)
                .ok()
                .and_then(|i| present.get_mut(i))
            {
                *slot = true;
            }
        }
        let missing_chunks = present
            .iter()
            .enumerate()
            .filter(|(_, seen)| !**seen)
            .map(|(i, _)| i as u32)
            .collect();

        Ok(UploadStatusResponse {
            session_id,
            state: session.state,
            declared_chunk_count: session.declared_chunk_count,
            received_chunk_count: session.received_chunk_count,
            received_bytes: session.received_bytes,
            missing_chunks,
            expires_at: session.expires_at,
        })
    }

    /// Abort a session and release its chunks.
    ///
    /// Unknown, expired, aborted and completed sessions are a no-op. A
    /// session that is being finished cannot be aborted.
    #[instrument(skip(self), fields(caller = %caller))]
    pub async fn abort(&self, session_id: SessionId, caller: &Principal) -> ApiResult<()> {
        let Some(session) = self.load(session_id).await? else {
            return Ok(());
        };
        if &session.owner != caller {
            return Err(ApiError::Unauthorized(format!(
                "upload session {session_id} belongs to another principal"
            )));
        }
        if session.is_expired(self.clock.now()) {
            return Ok(());
        }

        match session.state {
            SessionState::Completed | SessionState::Aborted => Ok(()),
            SessionState::Finishing => Err(ApiError::Conflict(format!(
                "upload session {session_id} is being finished"
            ))),
            SessionState::Open => {
                match self
                    .metadata
                    .abort_session(*session_id.as_uuid(), self.clock.now())
                    .await
                {
                    Ok(ranges) => {
                        self.sink.release_all(ranges.into_iter().map(arena_range));
                        metrics::UPLOAD_SESSIONS_ABORTED.inc();
                        metrics::set_arena_bytes_in_use(self.sink.arena().bytes_in_use());
                        tracing::info!(session_id = %session_id, "Aborted upload session");
                        Ok(())
                    }
                    Err(MetadataError::NotFound(_)) => Ok(()),
                    Err(MetadataError::InvalidStateTransition { from, .. })
                        if from != SessionState::Finishing.as_str() =>
                    {
                        Ok(())
                    }
                    Err(e) => Err(e.into()),
                }
            }
        }
    }
}

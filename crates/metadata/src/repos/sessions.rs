//! Upload session and chunk index repository.

use crate::error::MetadataResult;
use crate::models::{
    AssetRow, BeginOutcome, ChunkRecordOutcome, ExpiredSession, MemoryRow, StoredRange,
    UploadChunkRow, UploadSessionRow,
};
use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

/// Repository for upload sessions and their chunk records.
#[async_trait]
pub trait SessionRepo: Send + Sync {
    /// Insert `row` unless an open, finishing or completed session already holds
    /// its `(owner, idempotency_key)`; that session is returned instead.
    ///
    /// A session holding the key that expired before `now` is deleted first and
    /// its chunk ranges are returned in [`BeginOutcome::Created`] for release.
    async fn begin_session(
        &self,
        row: &UploadSessionRow,
        now: OffsetDateTime,
    ) -> MetadataResult<BeginOutcome>;

    /// Get a session by ID.
    async fn get_session(&self, session_id: Uuid) -> MetadataResult<Option<UploadSessionRow>>;

    /// Point `(session_id, chunk_index)` at `range` and update the running totals.
    ///
    /// Fails with `NotFound` if the session is gone and with
    /// `InvalidStateTransition` if it no longer accepts chunks. The range the
    /// index pointed at before is returned so the caller can release it.
    async fn record_chunk(
        &self,
        session_id: Uuid,
        chunk_index: u32,
        range: StoredRange,
        now: OffsetDateTime,
    ) -> MetadataResult<ChunkRecordOutcome>;

    /// List chunk records in index order.
    async fn list_chunks(&self, session_id: Uuid) -> MetadataResult<Vec<UploadChunkRow>>;

    /// Atomically move an open session to `finishing`.
    ///
    /// Returns None if the session doesn't exist. Otherwise returns the row,
    /// whose state is `finishing` only if this call made the transition.
    async fn begin_finish(
        &self,
        session_id: Uuid,
        now: OffsetDateTime,
    ) -> MetadataResult<Option<UploadSessionRow>>;

    /// Return a `finishing` session to `open` after a failed finish.
    async fn reopen_session(&self, session_id: Uuid, now: OffsetDateTime) -> MetadataResult<()>;

    /// Record the finished asset and retire the session in one transaction.
    ///
    /// Inserts `new_memory` (if any) and `asset`, marks the session
    /// `completed` with its result and deletes its chunk records. Returns the
    /// chunk ranges that are now unreferenced.
    async fn complete_session(
        &self,
        session_id: Uuid,
        asset: &AssetRow,
        new_memory: Option<&MemoryRow>,
        now: OffsetDateTime,
    ) -> MetadataResult<Vec<StoredRange>>;

    /// Mark an open session `aborted` and drop its chunk records.
    ///
    /// Fails with `InvalidStateTransition` if the session is not open.
    async fn abort_session(
        &self,
        session_id: Uuid,
        now: OffsetDateTime,
    ) -> MetadataResult<Vec<StoredRange>>;

    /// Delete up to `limit` sessions whose `expires_at` is before `now`.
    ///
    /// Finishing sessions are only expired once their `updated_at` is before
    /// `stale_before`, so an in-flight finish keeps its chunks.
    async fn expire_sessions(
        &self,
        now: OffsetDateTime,
        stale_before: OffsetDateTime,
        limit: u32,
    ) -> MetadataResult<Vec<ExpiredSession>>;

    /// Return abandoned `finishing` sessions to `open`. Returns the number reopened.
    async fn reopen_stale_finishing(
        &self,
        stale_before: OffsetDateTime,
        now: OffsetDateTime,
        limit: u32,
    ) -> MetadataResult<u64>;

    /// All arena ranges referenced by chunk records.
    async fn live_chunk_ranges(&self) -> MetadataResult<Vec<StoredRange>>;
}

//! Metadata store trait and implementations.

use crate::error::MetadataResult;
use crate::models::StoredRange;
use crate::repos::{AssetRepo, CapsuleRepo, MemoryRepo, SessionRepo, TokenRepo};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Combined metadata store trait.
#[async_trait]
pub trait MetadataStore:
    SessionRepo + CapsuleRepo + MemoryRepo + AssetRepo + TokenRepo + Send + Sync
{
    /// Run database migrations.
    async fn migrate(&self) -> MetadataResult<()>;

    /// Check database connectivity and health.
    async fn health_check(&self) -> MetadataResult<()>;

    /// Every arena range the index still references: chunk records and
    /// Internal-tier assets. Used to rebuild the arena allocator at startup.
    async fn live_arena_ranges(&self) -> MetadataResult<Vec<StoredRange>> {
        let mut ranges = self.live_chunk_ranges().await?;
        ranges.extend(self.live_internal_ranges().await?);
        Ok(ranges)
    }
}

/// SQLite-based metadata store.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and run migrations.
    pub async fn new(path: impl AsRef<Path>) -> MetadataResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        // A single connection serializes writers, so each transaction below
        // observes the state the previous one committed.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        tracing::debug!(path = %path.display(), "SQLite metadata store ready");
        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn migrate(&self) -> MetadataResult<()> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

// Implement all the repository traits for SqliteStore
mod sqlite_impl {
    use super::*;
    use crate::error::{MetadataError, is_unique_violation};
    use crate::models::*;
    use sqlx::SqliteConnection;
    use time::OffsetDateTime;
    use uuid::Uuid;

    async fn session_chunk_ranges(
        conn: &mut SqliteConnection,
        session_id: Uuid,
    ) -> MetadataResult<Vec<StoredRange>> {
        let rows = sqlx::query_as::<_, UploadChunkRow>(
            "SELECT * FROM upload_chunks WHERE session_id = ? ORDER BY chunk_index",
        )
        .bind(session_id)
        .fetch_all(&mut *conn)
        .await?;
        rows.iter().map(UploadChunkRow::range).collect()
    }

    async fn session_state(
        conn: &mut SqliteConnection,
        session_id: Uuid,
    ) -> MetadataResult<Option<String>> {
        let state: Option<(String,)> =
            sqlx::query_as("SELECT state FROM upload_sessions WHERE session_id = ?")
                .bind(session_id)
                .fetch_optional(&mut *conn)
                .await?;
        Ok(state.map(|(s,)| s))
    }

    fn internal_range(row: &AssetRow) -> MetadataResult<Option<StoredRange>> {
        match (row.arena_offset, row.arena_len) {
            (Some(offset), Some(len)) => Ok(Some(StoredRange::new(
                to_u64(offset, "arena_offset")?,
                to_u64(len, "arena_len")?,
            ))),
            _ => Ok(None),
        }
    }

    async fn insert_asset_row(conn: &mut SqliteConnection, asset: &AssetRow) -> MetadataResult<()> {
        sqlx::query(
            r#"
            INSERT INTO assets (
                asset_id, memory_id, variant, tier, byte_size, mime_type, sha256,
                tags, width, height, inline_data, arena_offset, arena_len,
                external_key, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(asset.asset_id)
        .bind(asset.memory_id)
        .bind(&asset.variant)
        .bind(&asset.tier)
        .bind(asset.byte_size)
        .bind(&asset.mime_type)
        .bind(&asset.sha256)
        .bind(&asset.tags)
        .bind(asset.width)
        .bind(asset.height)
        .bind(&asset.inline_data)
        .bind(asset.arena_offset)
        .bind(asset.arena_len)
        .bind(&asset.external_key)
        .bind(asset.created_at)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    async fn insert_memory_row(
        conn: &mut SqliteConnection,
        memory: &MemoryRow,
    ) -> MetadataResult<()> {
        sqlx::query("INSERT INTO memories (memory_id, capsule_id, created_at) VALUES (?, ?, ?)")
            .bind(memory.memory_id)
            .bind(memory.capsule_id)
            .bind(memory.created_at)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    #[async_trait]
    impl SessionRepo for SqliteStore {
        async fn begin_session(
            &self,
            row: &UploadSessionRow,
            now: OffsetDateTime,
        ) -> MetadataResult<BeginOutcome> {
            let mut tx = self.pool.begin().await?;

            let existing = sqlx::query_as::<_, UploadSessionRow>(
                r#"
                SELECT * FROM upload_sessions
                WHERE owner = ? AND idempotency_key = ? AND state IN ('open', 'finishing', 'completed')
                ORDER BY created_at DESC
                LIMIT 1
                "#,
            )
            .bind(&row.owner)
            .bind(&row.idempotency_key)
            .fetch_optional(&mut *tx)
            .await?;

            let mut reclaimed = Vec::new();
            if let Some(existing) = existing {
                if existing.expires_at >= now {
                    tx.commit().await?;
                    return Ok(BeginOutcome::Existing(existing));
                }
                reclaimed = session_chunk_ranges(&mut tx, existing.session_id).await?;
                sqlx::query("DELETE FROM upload_sessions WHERE session_id = ?")
                    .bind(existing.session_id)
                    .execute(&mut *tx)
                    .await?;
                tracing::debug!(
                    session_id = %existing.session_id,
                    "Reclaimed expired session holding idempotency key"
                );
            }

            let inserted = sqlx::query(
                r#"
                INSERT INTO upload_sessions (
                    session_id, owner, capsule_id, declared_chunk_count,
                    received_chunk_count, received_bytes, idempotency_key,
                    pending_asset, state, result_asset_id, result_memory_id,
                    created_at, updated_at, expires_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(row.session_id)
            .bind(&row.owner)
            .bind(row.capsule_id)
            .bind(row.declared_chunk_count)
            .bind(row.received_chunk_count)
            .bind(row.received_bytes)
            .bind(&row.idempotency_key)
            .bind(&row.pending_asset)
            .bind(&row.state)
            .bind(row.result_asset_id)
            .bind(row.result_memory_id)
            .bind(row.created_at)
            .bind(row.updated_at)
            .bind(row.expires_at)
            .execute(&mut *tx)
            .await;

            match inserted {
                Ok(_) => {}
                Err(e) if is_unique_violation(&e, "upload_sessions") => {
                    return Err(MetadataError::AlreadyExists(format!(
                        "session for idempotency key {} already exists",
                        row.idempotency_key
                    )));
                }
                Err(e) => return Err(e.into()),
            }

            tx.commit().await?;
            Ok(BeginOutcome::Created {
                row: row.clone(),
                reclaimed,
            })
        }

        async fn get_session(&self, session_id: Uuid) -> MetadataResult<Option<UploadSessionRow>> {
            let row = sqlx::query_as::<_, UploadSessionRow>(
                "SELECT * FROM upload_sessions WHERE session_id = ?",
            )
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn record_chunk(
            &self,
            session_id: Uuid,
            chunk_index: u32,
            range: StoredRange,
            now: OffsetDateTime,
        ) -> MetadataResult<ChunkRecordOutcome> {
            let mut tx = self.pool.begin().await?;

            let session = sqlx::query_as::<_, UploadSessionRow>(
                "SELECT * FROM upload_sessions WHERE session_id = ?",
            )
            .bind(session_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| MetadataError::NotFound(format!("session {session_id}")))?;

            if session.state != "open" {
                return Err(MetadataError::InvalidStateTransition {
                    from: session.state,
                    to: "open".to_string(),
                });
            }
            if i64::from(chunk_index) >= session.declared_chunk_count {
                return Err(MetadataError::Constraint(format!(
                    "chunk index {chunk_index} beyond declared count {}",
                    session.declared_chunk_count
                )));
            }

            let previous = sqlx::query_as::<_, UploadChunkRow>(
                "SELECT * FROM upload_chunks WHERE session_id = ? AND chunk_index = ?",
            )
            .bind(session_id)
            .bind(i64::from(chunk_index))
            .fetch_optional(&mut *tx)
            .await?;

            let offset = to_i64(range.offset, "arena_offset")?;
            let len = to_i64(range.len, "arena_len")?;
            sqlx::query(
                r#"
                INSERT INTO upload_chunks (session_id, chunk_index, arena_offset, arena_len, written_at)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT (session_id, chunk_index) DO UPDATE SET
                    arena_offset = excluded.arena_offset,
                    arena_len = excluded.arena_len,
                    written_at = excluded.written_at
                "#,
            )
            .bind(session_id)
            .bind(i64::from(chunk_index))
            .bind(offset)
            .bind(len)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            // Re-sends replace the previous length instead of adding to it.
            let (count, bytes) = match &previous {
                Some(prev) => (
                    session.received_chunk_count,
                    session.received_bytes - prev.arena_len + len,
                ),
                None => (
                    session.received_chunk_count + 1,
                    session.received_bytes + len,
                ),
            };
            sqlx::query(
                r#"
                UPDATE upload_sessions
                SET received_chunk_count = ?, received_bytes = ?, updated_at = ?
                WHERE session_id = ?
                "#,
            )
            .bind(count)
            .bind(bytes)
            .bind(now)
            .bind(session_id)
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;

            Ok(ChunkRecordOutcome {
                previous: previous.as_ref().map(UploadChunkRow::range).transpose()?,
                received_chunk_count: u32::try_from(count).map_err(|_| {
                    MetadataError::Corrupt(format!("received_chunk_count out of range: {count}"))
                })?,
                received_bytes: to_u64(bytes, "received_bytes")?,
            })
        }

        async fn list_chunks(&self, session_id: Uuid) -> MetadataResult<Vec<UploadChunkRow>> {
            let rows = sqlx::query_as::<_, UploadChunkRow>(
                "SELECT * FROM upload_chunks WHERE session_id = ? ORDER BY chunk_index",
            )
            .bind(session_id)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn begin_finish(
            &self,
            session_id: Uuid,
            now: OffsetDateTime,
        ) -> MetadataResult<Option<UploadSessionRow>> {
            let mut tx = self.pool.begin().await?;

            let mut session = sqlx::query_as::<_, UploadSessionRow>(
                "SELECT * FROM upload_sessions WHERE session_id = ?",
            )
            .bind(session_id)
            .fetch_optional(&mut *tx)
            .await?;

            if let Some(ref mut s) = session
                && s.state == "open"
            {
                let result = sqlx::query(
                    "UPDATE upload_sessions SET state = 'finishing', updated_at = ? WHERE session_id = ? AND state = 'open'",
                )
                .bind(now)
                .bind(session_id)
                .execute(&mut *tx)
                .await?;

                if result.rows_affected() > 0 {
                    s.state = "finishing".to_string();
                    s.updated_at = now;
                }
            }

            tx.commit().await?;
            Ok(session)
        }

        async fn reopen_session(&self, session_id: Uuid, now: OffsetDateTime) -> MetadataResult<()> {
            sqlx::query(
                "UPDATE upload_sessions SET state = 'open', updated_at = ? WHERE session_id = ? AND state = 'finishing'",
            )
            .bind(now)
            .bind(session_id)
            .execute(&self.pool)
            .await?;
            Ok(())
        }

        async fn complete_session(
            &self,
            session_id: Uuid,
            asset: &AssetRow,
            new_memory: Option<&MemoryRow>,
            now: OffsetDateTime,
        ) -> MetadataResult<Vec<StoredRange>> {
            let mut tx = self.pool.begin().await?;

            match session_state(&mut tx, session_id).await?.as_deref() {
                Some("finishing") => {}
                Some(other) => {
                    return Err(MetadataError::InvalidStateTransition {
                        from: other.to_string(),
                        to: "completed".to_string(),
                    });
                }
                None => return Err(MetadataError::NotFound(format!("session {session_id}"))),
            }

            if let Some(memory) = new_memory {
                insert_memory_row(&mut tx, memory).await?;
            }
            insert_asset_row(&mut tx, asset).await?;

            sqlx::query(
                r#"
                UPDATE upload_sessions
                SET state = 'completed', result_asset_id = ?, result_memory_id = ?, updated_at = ?
                WHERE session_id = ?
                "#,
            )
            .bind(asset.asset_id)
            .bind(asset.memory_id)
            .bind(now)
            .bind(session_id)
            .execute(&mut *tx)
            .await?;

            let ranges = session_chunk_ranges(&mut tx, session_id).await?;
            sqlx::query("DELETE FROM upload_chunks WHERE session_id = ?")
                .bind(session_id)
                .execute(&mut *tx)
                .await?;

            tx.commit().await?;
            Ok(ranges)
        }

        async fn abort_session(
            &self,
            session_id: Uuid,
            now: OffsetDateTime,
        ) -> MetadataResult<Vec<StoredRange>> {
            let mut tx = self.pool.begin().await?;

            let result = sqlx::query(
                "UPDATE upload_sessions SET state = 'aborted', updated_at = ? WHERE session_id = ? AND state = 'open'",
            )
            .bind(now)
            .bind(session_id)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 0 {
                return match session_state(&mut tx, session_id).await? {
                    Some(from) => Err(MetadataError::InvalidStateTransition {
                        from,
                        to: "aborted".to_string(),
                    }),
                    None => Err(MetadataError::NotFound(format!("session {session_id}"))),
                };
            }

            let ranges = session_chunk_ranges(&mut tx, session_id).await?;
            sqlx::query("DELETE FROM upload_chunks WHERE session_id = ?")
                .bind(session_id)
                .execute(&mut *tx)
                .await?;

            tx.commit().await?;
            Ok(ranges)
        }

        async fn expire_sessions(
            &self,
            now: OffsetDateTime,
            stale_before: OffsetDateTime,
            limit: u32,
        ) -> MetadataResult<Vec<ExpiredSession>> {
            let mut tx = self.pool.begin().await?;

            let candidates: Vec<(Uuid, String)> = sqlx::query_as(
                r#"
                SELECT session_id, state FROM upload_sessions
                WHERE expires_at < ? AND (state != 'finishing' OR updated_at < ?)
                ORDER BY expires_at
                LIMIT ?
                "#,
            )
            .bind(now)
            .bind(stale_before)
            .bind(i64::from(limit))
            .fetch_all(&mut *tx)
            .await?;

            let mut expired = Vec::with_capacity(candidates.len());
            for (session_id, state) in candidates {
                let ranges = session_chunk_ranges(&mut tx, session_id).await?;
                // Chunk rows go with the session (ON DELETE CASCADE).
                sqlx::query("DELETE FROM upload_sessions WHERE session_id = ?")
                    .bind(session_id)
                    .execute(&mut *tx)
                    .await?;
                expired.push(ExpiredSession {
                    session_id,
                    state,
                    ranges,
                });
            }

            tx.commit().await?;
            Ok(expired)
        }

        async fn reopen_stale_finishing(
            &self,
            stale_before: OffsetDateTime,
            now: OffsetDateTime,
            limit: u32,
        ) -> MetadataResult<u64> {
            let result = sqlx::query(
                r#"
                UPDATE upload_sessions SET state = 'open', updated_at = ?
                WHERE session_id IN (
                    SELECT session_id FROM upload_sessions
                    WHERE state = 'finishing' AND updated_at < ?
                    LIMIT ?
                )
                "#,
            )
            .bind(now)
            .bind(stale_before)
            .bind(i64::from(limit))
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        }

        async fn live_chunk_ranges(&self) -> MetadataResult<Vec<StoredRange>> {
            let rows = sqlx::query_as::<_, UploadChunkRow>("SELECT * FROM upload_chunks")
                .fetch_all(&self.pool)
                .await?;
            rows.iter().map(UploadChunkRow::range).collect()
        }
    }

    #[async_trait]
    impl CapsuleRepo for SqliteStore {
        async fn create_capsule(&self, capsule: &CapsuleRow) -> MetadataResult<()> {
            let result =
                sqlx::query("INSERT INTO capsules (capsule_id, owner, created_at) VALUES (?, ?, ?)")
                    .bind(capsule.capsule_id)
                    .bind(&capsule.owner)
                    .bind(capsule.created_at)
                    .execute(&self.pool)
                    .await;
            match result {
                Ok(_) => Ok(()),
                Err(e) if is_unique_violation(&e, "capsules") => Err(MetadataError::AlreadyExists(
                    format!("capsule {} already exists", capsule.capsule_id),
                )),
                Err(e) => Err(e.into()),
            }
        }

        async fn get_capsule(&self, capsule_id: Uuid) -> MetadataResult<Option<CapsuleRow>> {
            let row = sqlx::query_as::<_, CapsuleRow>("SELECT * FROM capsules WHERE capsule_id = ?")
                .bind(capsule_id)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }

        async fn add_writer(&self, writer: &CapsuleWriterRow) -> MetadataResult<()> {
            sqlx::query(
                r#"
                INSERT INTO capsule_writers (capsule_id, principal, granted_at)
                VALUES (?, ?, ?)
                ON CONFLICT (capsule_id, principal) DO NOTHING
                "#,
            )
            .bind(writer.capsule_id)
            .bind(&writer.principal)
            .bind(writer.granted_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        }

        async fn is_writer(&self, capsule_id: Uuid, principal: &str) -> MetadataResult<bool> {
            let row: Option<(i64,)> = sqlx::query_as(
                "SELECT 1 FROM capsule_writers WHERE capsule_id = ? AND principal = ?",
            )
            .bind(capsule_id)
            .bind(principal)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row.is_some())
        }
    }

    #[async_trait]
    impl MemoryRepo for SqliteStore {
        async fn create_memory(&self, memory: &MemoryRow) -> MetadataResult<()> {
            let mut conn = self.pool.acquire().await?;
            insert_memory_row(&mut conn, memory).await
        }

        async fn get_memory(&self, memory_id: Uuid) -> MetadataResult<Option<MemoryRow>> {
            let row = sqlx::query_as::<_, MemoryRow>("SELECT * FROM memories WHERE memory_id = ?")
                .bind(memory_id)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }

        async fn delete_memory(&self, memory_id: Uuid) -> MetadataResult<Vec<AssetRow>> {
            let mut tx = self.pool.begin().await?;

            let assets =
                sqlx::query_as::<_, AssetRow>("SELECT * FROM assets WHERE memory_id = ?")
                    .bind(memory_id)
                    .fetch_all(&mut *tx)
                    .await?;
            sqlx::query("DELETE FROM assets WHERE memory_id = ?")
                .bind(memory_id)
                .execute(&mut *tx)
                .await?;
            let result = sqlx::query("DELETE FROM memories WHERE memory_id = ?")
                .bind(memory_id)
                .execute(&mut *tx)
                .await?;
            if result.rows_affected() == 0 {
                return Err(MetadataError::NotFound(format!("memory {memory_id}")));
            }

            tx.commit().await?;
            Ok(assets)
        }
    }

    #[async_trait]
    impl AssetRepo for SqliteStore {
        async fn insert_asset(&self, asset: &AssetRow) -> MetadataResult<()> {
            let mut conn = self.pool.acquire().await?;
            insert_asset_row(&mut conn, asset).await
        }

        async fn list_assets(&self, memory_id: Uuid) -> MetadataResult<Vec<AssetRow>> {
            let rows = sqlx::query_as::<_, AssetRow>(
                "SELECT * FROM assets WHERE memory_id = ? ORDER BY created_at, asset_id",
            )
            .bind(memory_id)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn list_variant(
            &self,
            memory_id: Uuid,
            variant: &str,
        ) -> MetadataResult<Vec<AssetRow>> {
            let rows = sqlx::query_as::<_, AssetRow>(
                "SELECT * FROM assets WHERE memory_id = ? AND variant = ? ORDER BY created_at DESC",
            )
            .bind(memory_id)
            .bind(variant)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn delete_other_variants(
            &self,
            memory_id: Uuid,
            variant: &str,
            keep: Uuid,
        ) -> MetadataResult<Vec<AssetRow>> {
            let mut tx = self.pool.begin().await?;

            let doomed = sqlx::query_as::<_, AssetRow>(
                "SELECT * FROM assets WHERE memory_id = ? AND variant = ? AND asset_id != ?",
            )
            .bind(memory_id)
            .bind(variant)
            .bind(keep)
            .fetch_all(&mut *tx)
            .await?;
            sqlx::query("DELETE FROM assets WHERE memory_id = ? AND variant = ? AND asset_id != ?")
                .bind(memory_id)
                .bind(variant)
                .bind(keep)
                .execute(&mut *tx)
                .await?;

            tx.commit().await?;
            Ok(doomed)
        }

        async fn live_internal_ranges(&self) -> MetadataResult<Vec<StoredRange>> {
            let rows = sqlx::query_as::<_, AssetRow>("SELECT * FROM assets WHERE tier = 'internal'")
                .fetch_all(&self.pool)
                .await?;
            let mut ranges = Vec::with_capacity(rows.len());
            for row in &rows {
                if let Some(range) = internal_range(row)? {
                    ranges.push(range);
                }
            }
            Ok(ranges)
        }
    }

    #[async_trait]
    impl TokenRepo for SqliteStore {
        async fn create_token(&self, token: &TokenRow) -> MetadataResult<()> {
            let result = sqlx::query(
                r#"
                INSERT INTO tokens (token_id, principal, token_hash, created_at, last_used_at, revoked_at)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(token.token_id)
            .bind(&token.principal)
            .bind(&token.token_hash)
            .bind(token.created_at)
            .bind(token.last_used_at)
            .bind(token.revoked_at)
            .execute(&self.pool)
            .await;
            match result {
                Ok(_) => Ok(()),
                Err(e) if is_unique_violation(&e, "tokens") => Err(MetadataError::AlreadyExists(
                    format!("token for {} already on file", token.principal),
                )),
                Err(e) => Err(e.into()),
            }
        }

        async fn get_token_by_hash(&self, token_hash: &str) -> MetadataResult<Option<TokenRow>> {
            let row = sqlx::query_as::<_, TokenRow>("SELECT * FROM tokens WHERE token_hash = ?")
                .bind(token_hash)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }

        async fn touch_token(&self, token_id: Uuid, used_at: OffsetDateTime) -> MetadataResult<()> {
            sqlx::query("UPDATE tokens SET last_used_at = ? WHERE token_id = ?")
                .bind(used_at)
                .bind(token_id)
                .execute(&self.pool)
                .await?;
            Ok(())
        }

        async fn revoke_token(&self, token_id: Uuid, revoked_at: OffsetDateTime) -> MetadataResult<()> {
            sqlx::query("UPDATE tokens SET revoked_at = ? WHERE token_id = ? AND revoked_at IS NULL")
                .bind(revoked_at)
                .bind(token_id)
                .execute(&self.pool)
                .await?;
            Ok(())
        }

        async fn list_active_tokens(&self) -> MetadataResult<Vec<TokenRow>> {
            let rows = sqlx::query_as::<_, TokenRow>(
                "SELECT * FROM tokens WHERE revoked_at IS NULL ORDER BY created_at",
            )
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }
    }
}

const SCHEMA_SQL: &str = r#"
-- Capsules: namespaces that own memories
CREATE TABLE IF NOT EXISTS capsules (
    capsule_id BLOB PRIMARY KEY,
    owner TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_capsules_owner ON capsules(owner);

CREATE TABLE IF NOT EXISTS capsule_writers (
    capsule_id BLOB NOT NULL,
    principal TEXT NOT NULL,
    granted_at TEXT NOT NULL,
    PRIMARY KEY (capsule_id, principal),
    FOREIGN KEY (capsule_id) REFERENCES capsules(capsule_id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS memories (
    memory_id BLOB PRIMARY KEY,
    capsule_id BLOB NOT NULL,
    created_at TEXT NOT NULL,
    FOREIGN KEY (capsule_id) REFERENCES capsules(capsule_id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_memories_capsule ON memories(capsule_id);

-- Finished assets. Exactly one of inline_data, (arena_offset, arena_len)
-- or external_key is set, matching tier.
CREATE TABLE IF NOT EXISTS assets (
    asset_id BLOB PRIMARY KEY,
    memory_id BLOB NOT NULL,
    variant TEXT NOT NULL,
    tier TEXT NOT NULL CHECK (tier IN ('inline', 'internal', 'external')),
    byte_size INTEGER NOT NULL,
    mime_type TEXT NOT NULL,
    sha256 TEXT NOT NULL,
    tags TEXT NOT NULL DEFAULT '[]',
    width INTEGER,
    height INTEGER,
    inline_data BLOB,
    arena_offset INTEGER,
    arena_len INTEGER,
    external_key TEXT,
    created_at TEXT NOT NULL,
    FOREIGN KEY (memory_id) REFERENCES memories(memory_id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_assets_memory_variant ON assets(memory_id, variant, created_at);
CREATE INDEX IF NOT EXISTS idx_assets_tier ON assets(tier);

-- Upload sessions. Completed and aborted rows stay as tombstones until expiry.
CREATE TABLE IF NOT EXISTS upload_sessions (
    session_id BLOB PRIMARY KEY,
    owner TEXT NOT NULL,
    capsule_id BLOB NOT NULL,
    declared_chunk_count INTEGER NOT NULL CHECK (declared_chunk_count >= 1),
    received_chunk_count INTEGER NOT NULL DEFAULT 0,
    received_bytes INTEGER NOT NULL DEFAULT 0,
    idempotency_key TEXT NOT NULL,
    pending_asset TEXT NOT NULL,
    state TEXT NOT NULL DEFAULT 'open',
    result_asset_id BLOB,
    result_memory_id BLOB,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    expires_at TEXT NOT NULL,
    FOREIGN KEY (capsule_id) REFERENCES capsules(capsule_id) ON DELETE CASCADE
);
-- One live session per (owner, idempotency_key)
CREATE UNIQUE INDEX IF NOT EXISTS idx_upload_sessions_idempotency
    ON upload_sessions(owner, idempotency_key)
    WHERE state IN ('open', 'finishing');
CREATE INDEX IF NOT EXISTS idx_upload_sessions_expiry ON upload_sessions(expires_at);
CREATE INDEX IF NOT EXISTS idx_upload_sessions_state ON upload_sessions(state, updated_at);

-- Chunk index: (session, chunk index) -> arena range
CREATE TABLE IF NOT EXISTS upload_chunks (
    session_id BLOB NOT NULL,
    chunk_index INTEGER NOT NULL,
    arena_offset INTEGER NOT NULL,
    arena_len INTEGER NOT NULL,
    written_at TEXT NOT NULL,
    PRIMARY KEY (session_id, chunk_index),
    FOREIGN KEY (session_id) REFERENCES upload_sessions(session_id) ON DELETE CASCADE
);

-- Tokens
CREATE TABLE IF NOT EXISTS tokens (
    token_id BLOB PRIMARY KEY,
    principal TEXT NOT NULL,
    token_hash TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL,
    last_used_at TEXT,
    revoked_at TEXT
);
"#;

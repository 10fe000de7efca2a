//! Expiry sweep for abandoned upload sessions.

use super::arena_range;
use crate::error::ApiResult;
use crate::metrics;
use keepsake_core::config::ServerConfig;
use keepsake_core::{Clock, SessionState};
use keepsake_metadata::MetadataStore;
use keepsake_storage::ChunkSink;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::instrument;

/// What one sweep did.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepStats {
    /// Unfinished sessions removed after their TTL.
    pub expired_sessions: u64,
    /// Completed and aborted session records removed after their TTL.
    pub removed_tombstones: u64,
    /// Abandoned finishes returned to `open`.
    pub reopened_sessions: u64,
    pub released_ranges: u64,
    pub released_bytes: u64,
}

/// Removes expired sessions and releases their chunk storage.
pub struct ExpirySweeper {
    metadata: Arc<dyn MetadataStore>,
    sink: ChunkSink,
    clock: Arc<dyn Clock>,
    config: ServerConfig,
}

impl ExpirySweeper {
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

    /// Run one full sweep, batch by batch, until nothing expired is left.
    #[instrument(skip(self))]
    pub async fn run_once(&self) -> ApiResult<SweepStats> {
        let now = self.clock.now();
        let stale_before = now - self.config.finish_stale_after();
        let batch = self.config.sweep_batch_size;
        let mut stats = SweepStats::default();

        loop {
            let expired = self
                .metadata
                .expire_sessions(now, stale_before, batch)
                .await?;
            let done = (expired.len() as u64) < u64::from(batch);

            for session in expired {
                match SessionState::parse(&session.state) {
                    Ok(state) if state.is_terminal() => stats.removed_tombstones += 1,
                    _ => stats.expired_sessions += 1,
                }
                for range in session.ranges {
                    stats.released_ranges += 1;
                    stats.released_bytes += range.len;
                    self.sink.release_all([arena_range(range)]);
                }
            }
            if done {
                break;
            }
        }

        loop {
            let reopened = self
                .metadata
                .reopen_stale_finishing(stale_before, now, batch)
                .await?;
            stats.reopened_sessions += reopened;
            if reopened < u64::from(batch) {
                break;
            }
        }

        metrics::UPLOAD_SESSIONS_EXPIRED.inc_by(stats.expired_sessions);
        metrics::set_arena_bytes_in_use(self.sink.arena().bytes_in_use());
        if stats != SweepStats::default() {
            tracing::info!(
                expired = stats.expired_sessions,
                tombstones = stats.removed_tombstones,
                reopened = stats.reopened_sessions,
                released_bytes = stats.released_bytes,
                "Expiry sweep finished"
            );
        }
        Ok(stats)
    }

    /// Sweep every `server.sweep_interval_secs` in the background.
    ///
    /// Returns None when the interval is zero (background sweeping disabled).
    pub fn spawn(self: Arc<Self>) -> Option<JoinHandle<()>> {
        let interval = self.config.sweep_interval();
        if interval.is_zero() {
            tracing::info!("Background expiry sweep disabled");
            return None;
        }

        Some(tokio::spawn(async move {
            tracing::info!(
                interval_secs = interval.as_secs(),
                "Background expiry sweep enabled"
            );
            loop {
                tokio::time::sleep(interval).await;
                if let Err(e) = self.run_once().await {
                    tracing::error!(error = %e, "Expiry sweep failed, retrying next interval");
                }
            }
        }))
    }
}

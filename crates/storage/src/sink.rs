//! Chunk sink: durable random-write destination for upload chunks.
//!
//! Each chunk goes straight into its own arena range; nothing is buffered
//! per session. The (session, index) to range mapping is owned by the
//! metadata index, so the sink only deals in ranges.
//!
//! A re-sent chunk always lands in a fresh range. The range it displaces
//! is released by the caller once the index no longer points at it, so a
//! range is never written while another session may own it.

use crate::arena::{ArenaRange, ByteArena};
use crate::error::StorageResult;
use crate::traits::ByteStream;
use bytes::Bytes;
use futures::StreamExt;
use std::sync::Arc;
use tracing::instrument;

/// Writes chunk bytes into the arena and streams them back.
#[derive(Clone)]
pub struct ChunkSink {
    arena: Arc<ByteArena>,
}

impl ChunkSink {
    pub fn new(arena: Arc<ByteArena>) -> Self {
        Self { arena }
    }

    pub fn arena(&self) -> &Arc<ByteArena> {
        &self.arena
    }

    /// Write a chunk into a newly allocated range.
    ///
    /// The range is flushed before it is returned, so the index never
    /// records a chunk whose bytes could be lost to a crash.
    #[instrument(skip(self, data), fields(len = data.len()))]
    pub async fn write(&self, data: Bytes) -> StorageResult<ArenaRange> {
        let range = self.arena.allocate(data.len() as u64)?;
        let written = match self.arena.write(range, 0, data).await {
            Ok(()) => self.arena.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            self.arena.release(range);
            return Err(e);
        }
        Ok(range)
    }

    /// Stream the given ranges back to back, in the order given.
    pub fn assemble(&self, ranges: Vec<ArenaRange>) -> ByteStream {
        let arena = self.arena.clone();
        Box::pin(async_stream::try_stream! {
            for range in ranges {
                let mut pieces = arena.stream(range);
                while let Some(piece) = pieces.next().await {
                    yield piece?;
                }
            }
        })
    }

    /// Release chunk ranges that nothing references any more.
    pub fn release_all(&self, ranges: impl IntoIterator<Item = ArenaRange>) {
        for range in ranges {
            self.arena.release(range);
        }
    }
}

// Persistence and concurrency tests for the byte arena and chunk sink
// Ensures chunk bytes survive a reopen and concurrent writers never share a range

mod common;

use bytes::Bytes;
use common::{seeded_bytes, sha256_hash};
use futures::StreamExt;
use keepsake_storage::error::StorageError;
use keepsake_storage::{ArenaRange, ByteArena, ChunkSink, FileMemory, PAGE_SIZE, PagedMemory};
use std::collections::HashSet;
use std::sync::Arc;
use tempfile::TempDir;

fn open_file_arena(dir: &TempDir, live: Vec<ArenaRange>) -> Arc<ByteArena> {
    let memory = FileMemory::open(dir.path().join("arena.pages")).unwrap();
    Arc::new(ByteArena::restore(Arc::new(memory), live).unwrap())
}

async fn collect(sink: &ChunkSink, ranges: Vec<ArenaRange>) -> Vec<u8> {
    let mut stream = sink.assemble(ranges);
    let mut out = Vec::new();
    while let Some(piece) = stream.next().await {
        out.extend_from_slice(&piece.unwrap());
    }
    out
}

#[tokio::test]
async fn test_chunks_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let chunks: Vec<Bytes> = (0..5).map(|i| seeded_bytes(i, 70_000)).collect();

    let ranges = {
        let arena = open_file_arena(&dir, Vec::new());
        let sink = ChunkSink::new(arena.clone());
        let mut ranges = Vec::new();
        for chunk in &chunks {
            ranges.push(sink.write(chunk.clone()).await.unwrap());
        }
        // No explicit sync: each write flushed its range.
        ranges
    };

    let arena = open_file_arena(&dir, ranges.clone());
    let sink = ChunkSink::new(arena.clone());
    for (range, chunk) in ranges.iter().zip(&chunks) {
        assert_eq!(collect(&sink, vec![*range]).await, *chunk);
    }

    let expected: Vec<u8> = chunks.iter().flat_map(|c| c.iter().copied()).collect();
    let assembled = collect(&sink, ranges.clone()).await;
    assert_eq!(sha256_hash(&assembled), sha256_hash(&expected));

    // New allocations land after the restored ranges, never on top of them.
    let fresh = sink.write(seeded_bytes(99, 1000)).await.unwrap();
    for range in &ranges {
        assert!(fresh.offset >= range.offset + range.len || fresh.offset + fresh.len <= range.offset);
    }
    for (range, chunk) in ranges.iter().zip(&chunks) {
        assert_eq!(collect(&sink, vec![*range]).await, *chunk);
    }
}

#[tokio::test]
async fn test_restore_reuses_gaps_between_live_ranges() {
    let dir = TempDir::new().unwrap();
    let (kept, dropped) = {
        let arena = open_file_arena(&dir, Vec::new());
        let a = arena.allocate(4096).unwrap();
        let b = arena.allocate(4096).unwrap();
        let c = arena.allocate(4096).unwrap();
        arena.sync().unwrap();
        (vec![a, c], b)
    };

    // Only `a` and `c` are still referenced after the restart.
    let arena = open_file_arena(&dir, kept);
    assert_eq!(arena.bytes_in_use(), 2 * 4096);
    let reused = arena.allocate(4096).unwrap();
    assert_eq!(reused.offset, dropped.offset);
}

#[test]
fn test_restore_rejects_overlapping_ranges() {
    let dir = TempDir::new().unwrap();
    let memory = FileMemory::open(dir.path().join("arena.pages")).unwrap();
    memory.grow(1).unwrap();

    let result = ByteArena::restore(
        Arc::new(memory),
        [ArenaRange::new(0, 1000), ArenaRange::new(512, 1000)],
    );
    assert!(matches!(result, Err(StorageError::ArenaCorrupt(_))));
}

#[test]
fn test_restore_rejects_ranges_past_the_end_of_memory() {
    let dir = TempDir::new().unwrap();
    let memory = FileMemory::open(dir.path().join("arena.pages")).unwrap();

    let result = ByteArena::restore(Arc::new(memory), [ArenaRange::new(0, PAGE_SIZE + 1)]);
    assert!(matches!(result, Err(StorageError::ArenaCorrupt(_))));
}

#[tokio::test]
async fn test_concurrent_writes_get_disjoint_ranges() {
    let dir = TempDir::new().unwrap();
    let sink = ChunkSink::new(open_file_arena(&dir, Vec::new()));

    let mut handles = Vec::new();
    for i in 0..32u64 {
        let sink = sink.clone();
        handles.push(tokio::spawn(async move {
            let data = seeded_bytes(i, 1000 + (i as usize) * 37);
            let range = sink.write(data.clone()).await.unwrap();
            (range, data)
        }));
    }

    let mut written = Vec::new();
    for handle in handles {
        written.push(handle.await.unwrap());
    }

    let offsets: HashSet<u64> = written.iter().map(|(r, _)| r.offset).collect();
    assert_eq!(offsets.len(), written.len());
    for (range, data) in &written {
        assert_eq!(collect(&sink, vec![*range]).await, *data);
    }
}

#[tokio::test]
async fn test_release_while_writing_keeps_other_ranges_intact() {
    let dir = TempDir::new().unwrap();
    let sink = ChunkSink::new(open_file_arena(&dir, Vec::new()));

    let keep = sink.write(seeded_bytes(1, 10_000)).await.unwrap();
    let mut handles = Vec::new();
    for i in 0..16u64 {
        let sink = sink.clone();
        handles.push(tokio::spawn(async move {
            let range = sink.write(seeded_bytes(100 + i, 3_000)).await.unwrap();
            sink.release_all([range]);
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(collect(&sink, vec![keep]).await, seeded_bytes(1, 10_000));
    assert_eq!(sink.arena().bytes_in_use(), 10_048);
}

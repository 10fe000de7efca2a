//! The external blob store seam.

use crate::error::StorageResult;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;

/// Chunked read of a stored blob.
pub type ByteStream = Pin<Box<dyn Stream<Item = StorageResult<Bytes>> + Send>>;

/// Keyed store for External-tier asset bytes.
///
/// Keys are opaque `assets/<memory>/<asset>` strings minted by the server.
/// A blob is written once through [`put_stream`](Self::put_stream) and is
/// never modified afterwards, only read or deleted.
#[async_trait]
pub trait BlobStore: Send + Sync + 'static {
    /// Stream a blob. Missing keys report [`StorageError::NotFound`](crate::error::StorageError::NotFound).
    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream>;

    /// Open a write under `key`. Readers see nothing until `finish` returns.
    async fn put_stream(&self, key: &str) -> StorageResult<Box<dyn StreamingUpload>>;

    /// Remove a blob. Missing keys report [`StorageError::NotFound`](crate::error::StorageError::NotFound).
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// Short label for logs and metrics.
    fn backend_name(&self) -> &'static str;

    /// Probe the store once at startup.
    async fn health_check(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// An in-flight blob write.
#[async_trait]
pub trait StreamingUpload: Send {
    async fn write(&mut self, data: Bytes) -> StorageResult<()>;

    /// Publish the blob and return its length.
    async fn finish(self: Box<Self>) -> StorageResult<u64>;

    /// Drop everything written so far.
    async fn abort(self: Box<Self>) -> StorageResult<()>;
}

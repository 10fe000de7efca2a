//! Byte storage for keepsake.
//!
//! This crate provides:
//! - Persistent paged memory and a byte arena allocator over it
//! - The chunk sink that in-flight upload chunks are written to
//! - External blob stores for the External tier: local filesystem and S3-compatible

pub mod arena;
pub mod backends;
pub mod error;
pub mod memory;
pub mod sink;
pub mod traits;

pub use arena::{ArenaRange, ByteArena};
pub use backends::{filesystem::FilesystemBackend, s3::S3Backend};
pub use error::{StorageError, StorageResult};
pub use memory::{FileMemory, PAGE_SIZE, PagedMemory, VecMemory};
pub use sink::ChunkSink;
pub use traits::{BlobStore, ByteStream, StreamingUpload};

use keepsake_core::config::{ArenaConfig, StorageConfig};
use std::sync::Arc;

/// Create an external blob store from configuration.
pub async fn from_config(config: &StorageConfig) -> StorageResult<Arc<dyn BlobStore>> {
    config.validate().map_err(StorageError::Config)?;

    match config {
        StorageConfig::Filesystem { path } => {
            let backend = FilesystemBackend::new(path).await?;
            Ok(Arc::new(backend))
        }
        StorageConfig::S3 {
            bucket,
            endpoint,
            region,
            prefix,
            access_key_id,
            secret_access_key,
            force_path_style,
        } => {
            let backend = S3Backend::new(
                bucket,
                endpoint.clone(),
                region.clone(),
                prefix.clone(),
                access_key_id.clone(),
                secret_access_key.clone(),
                *force_path_style,
            )
            .await?;
            Ok(Arc::new(backend))
        }
    }
}

/// Open the paged memory backing the arena.
pub fn open_memory(config: &ArenaConfig) -> StorageResult<Arc<dyn PagedMemory>> {
    match config {
        ArenaConfig::Memory => Ok(Arc::new(VecMemory::new())),
        ArenaConfig::File { path } => Ok(Arc::new(FileMemory::open(path)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures::StreamExt;
    use tempfile::tempdir;

    #[tokio::test]
    async fn from_config_filesystem_ok() {
        let temp = tempdir().unwrap();
        let config = StorageConfig::Filesystem {
            path: temp.path().join("store"),
        };

        let store = from_config(&config).await.unwrap();
        let mut upload = store.put_stream("hello.txt").await.unwrap();
        upload.write(Bytes::from_static(b"hi")).await.unwrap();
        assert_eq!(upload.finish().await.unwrap(), 2);
        let mut stream = store.get_stream("hello.txt").await.unwrap();
        let mut read = Vec::new();
        while let Some(piece) = stream.next().await {
            read.extend_from_slice(&piece.unwrap());
        }
        assert_eq!(read, b"hi");
        assert_eq!(store.backend_name(), "filesystem");
    }

    #[tokio::test]
    async fn from_config_rejects_partial_credentials() {
        let config = StorageConfig::S3 {
            bucket: "bucket".to_string(),
            endpoint: None,
            region: None,
            prefix: None,
            access_key_id: Some("access".to_string()),
            secret_access_key: None,
            force_path_style: false,
        };

        match from_config(&config).await {
            Ok(_) => panic!("expected error"),
            Err(StorageError::Config(_)) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn open_memory_file_creates_page_file() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("arena").join("pages");
        let memory = open_memory(&ArenaConfig::File { path: path.clone() }).unwrap();
        assert_eq!(memory.backend_name(), "file");
        assert!(path.exists());

        let memory = open_memory(&ArenaConfig::Memory).unwrap();
        assert_eq!(memory.backend_name(), "memory");
    }
}

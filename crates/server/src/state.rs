//! Application state.

use crate::service::{
    AssetResolver, AssetStore, CapsuleService, ExpirySweeper, SessionManager, UploadOrchestrator,
};
use keepsake_core::Clock;
use keepsake_core::config::AppConfig;
use keepsake_metadata::MetadataStore;
use keepsake_storage::{BlobStore, ByteArena, ChunkSink};
use std::sync::Arc;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<AppConfig>,
    /// Metadata index.
    pub metadata: Arc<dyn MetadataStore>,
    /// Arena holding chunks and Internal-tier assets.
    pub arena: Arc<ByteArena>,
    pub clock: Arc<dyn Clock>,
    pub capsules: Arc<CapsuleService>,
    pub uploads: Arc<UploadOrchestrator>,
    pub assets: Arc<AssetStore>,
    pub resolver: Arc<AssetResolver>,
    pub sweeper: Arc<ExpirySweeper>,
}

impl AppState {
    /// Wire the services over already-opened stores.
    pub fn new(
        config: AppConfig,
        metadata: Arc<dyn MetadataStore>,
        arena: Arc<ByteArena>,
        external: Option<Arc<dyn BlobStore>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let sink = ChunkSink::new(arena.clone());

        let sessions = Arc::new(SessionManager::new(
            metadata.clone(),
            sink.clone(),
            clock.clone(),
            config.server.clone(),
        ));
        let assets = Arc::new(AssetStore::new(
            metadata.clone(),
            arena.clone(),
            external.clone(),
            config.tiering.clone(),
            clock.clone(),
        ));
        let uploads = Arc::new(UploadOrchestrator::new(
            metadata.clone(),
            sessions,
            assets.clone(),
            clock.clone(),
        ));
        let resolver = Arc::new(AssetResolver::new(metadata.clone(), arena.clone(), external));
        let capsules = Arc::new(CapsuleService::new(metadata.clone(), clock.clone()));
        let sweeper = Arc::new(ExpirySweeper::new(
            metadata.clone(),
            sink,
            clock.clone(),
            config.server.clone(),
        ));

        Self {
            config: Arc::new(config),
            metadata,
            arena,
            clock,
            capsules,
            uploads,
            assets,
            resolver,
            sweeper,
        }
    }
}

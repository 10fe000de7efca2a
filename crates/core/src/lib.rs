//! Core domain types and shared logic for keepsake.
//!
//! This crate defines the canonical data model used across all other crates:
//! - Identifiers for sessions, capsules, memories and assets
//! - Caller principals
//! - Capsules, asset variants and storage tiers
//! - Content hashing and stream verification
//! - Upload session lifecycle
//! - Configuration

pub mod asset;
pub mod capsule;
pub mod clock;
pub mod config;
pub mod error;
pub mod hash;
pub mod ids;
pub mod principal;
pub mod upload;

pub use asset::{
    Asset, AssetDescriptor, AssetLocation, AssetVariant, DeleteMemoryResponse,
    ListAssetsResponse, LocationTier, RESOLVE_ORDER,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, Result};
pub use hash::{ContentHash, ContentHasher, HashVerifier};
pub use ids::{AssetId, CapsuleId, MemoryId, SessionId};
pub use principal::Principal;
pub use upload::{PendingAssetMetadata, SessionState, UploadSession};

/// Default chunk size used by clients: 1 MiB
pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;

/// Maximum accepted chunk size: 4 MiB
pub const MAX_CHUNK_SIZE: u64 = 4 * 1024 * 1024;

/// Maximum number of chunks a single session may declare.
pub const MAX_CHUNK_COUNT: u32 = 65_536;

//! Upload and serving logic.
//!
//! Every operation takes the calling [`Principal`](keepsake_core::Principal)
//! as an explicit argument. The HTTP layer resolves the bearer token once and
//! forwards the identity; nothing in here looks it up on its own.

pub mod access;
pub mod orchestrator;
pub mod resolver;
pub mod sessions;
pub mod sweep;
pub mod variants;

pub use access::CapsuleService;
pub use orchestrator::UploadOrchestrator;
pub use resolver::AssetResolver;
pub use sessions::{BegunSession, SessionManager};
pub use sweep::{ExpirySweeper, SweepStats};
pub use variants::{AssetStore, DerivativeOptions, FinishedAsset};

use keepsake_metadata::models::StoredRange;
use keepsake_storage::ArenaRange;

pub(crate) fn arena_range(range: StoredRange) -> ArenaRange {
    ArenaRange::new(range.offset, range.len)
}

pub(crate) fn stored_range(range: ArenaRange) -> StoredRange {
    StoredRange::new(range.offset, range.len)
}

//! Repository traits for metadata operations.

pub mod assets;
pub mod capsules;
pub mod sessions;
pub mod tokens;

pub use assets::{AssetRepo, MemoryRepo};
pub use capsules::CapsuleRepo;
pub use sessions::SessionRepo;
pub use tokens::TokenRepo;

//! Resumable chunked uploads and tiered asset storage for keepsake.
//!
//! This crate provides:
//! - The upload session manager and orchestrator (begin, chunk, finish, abort)
//! - The asset variant store that places finished bytes in a storage tier
//! - The asset resolver that serves a (memory, variant) request
//! - The background expiry sweep
//! - A thin HTTP adapter over all of the above

pub mod auth;
pub mod bootstrap;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod routes;
pub mod service;
pub mod state;

pub use auth::{Caller, TraceId};
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;

//! HTTP request handlers.
//!
//! Handlers decode the wire format, call one service operation with the
//! authenticated caller, and encode the result.

pub mod admin;
pub mod assets;
pub mod capsules;
pub mod common;
pub mod uploads;

pub use admin::*;
pub use assets::*;
pub use capsules::*;
pub use uploads::*;

//! Shared harness for the server integration tests.

pub mod fixtures;
pub mod server;

#[allow(unused_imports)]
pub use fixtures::*;
#[allow(unused_imports)]
pub use server::*;

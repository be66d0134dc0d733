//! twinrun Common Library
//!
//! Shared error taxonomy, naming and enums for the twinrun harness.

pub mod error;
pub mod naming;
pub mod types;

pub use error::{Error, Result};
pub use naming::{random_hex, unique_name};
pub use types::*;

/// twinrun version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

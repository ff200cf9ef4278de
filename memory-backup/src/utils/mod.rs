//! Utility modules for the backup coordinator.

pub mod checksum;
pub mod errors;
pub mod logger;

pub use errors::{CoordinatorError, EngineError, EngineErrorKind, Result};

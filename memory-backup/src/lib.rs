//! Memory Backup Library
//!
//! Backup and recovery coordinator for the four stores behind agent memory:
//! the relational store, the vector index, the graph store and the cache.

pub mod codec;
pub mod config;
pub mod coordinator;
pub mod engines;
pub mod manifest;
pub mod models;
pub mod scheduler;
pub mod tool;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use config::Config;
pub use coordinator::{BackupCoordinator, BackupRequest, RecoveryCoordinator};
pub use engines::{AdapterRegistry, Engine, EngineAdapter};
pub use utils::errors::CoordinatorError;
pub type Result<T> = std::result::Result<T, CoordinatorError>;

//! Backup and restore orchestration over the engine adapters.

pub mod backup;
pub mod pool;
pub mod recovery;

pub use backup::{BackupCoordinator, BackupRequest, IdGenerator};
pub use pool::{TaskOutcome, WorkerPool};
pub use recovery::RecoveryCoordinator;

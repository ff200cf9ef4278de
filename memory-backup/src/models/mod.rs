//! Records produced by backup and restore operations.

pub mod backup_set;
pub mod restore;

pub use backup_set::{
    generate_backup_id, is_valid_backup_id, BackupKind, BackupSet, BackupStatus, BackupSummary,
    EngineResult, EngineStatus,
};
pub use restore::{RestoreResult, RestoreStatus, RestoreWarning, WarningKind};

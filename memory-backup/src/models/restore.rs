use super::backup_set::BackupStatus;
use crate::engines::Engine;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreStatus {
    Completed,
    PartialFailure,
    Failed,
}

impl RestoreStatus {
    pub fn from_outcomes(succeeded: usize, total: usize) -> Self {
        match BackupStatus::from_outcomes(succeeded, total) {
            BackupStatus::Completed => RestoreStatus::Completed,
            BackupStatus::PartialFailure => RestoreStatus::PartialFailure,
            _ => RestoreStatus::Failed,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RestoreStatus::Completed => "completed",
            RestoreStatus::PartialFailure => "partial_failure",
            RestoreStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RestoreStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    /// Requested engine has no successful artifact in the backup.
    SkippedNoBackup,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestoreWarning {
    pub engine: Engine,
    pub kind: WarningKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestoreResult {
    pub backup_id: String,
    pub status: RestoreStatus,
    pub databases_restored: Vec<Engine>,
    pub errors: BTreeMap<Engine, String>,
    pub warnings: Vec<RestoreWarning>,
}

impl RestoreResult {
    pub fn is_failed(&self) -> bool {
        self.status == RestoreStatus::Failed
    }
}

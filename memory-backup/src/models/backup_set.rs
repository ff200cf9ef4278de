use crate::codec::Algorithm;
use crate::engines::Engine;
use crate::utils::errors::{CoordinatorError, EngineError, EngineErrorKind, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupKind {
    Manual,
    Scheduled,
}

impl BackupKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackupKind::Manual => "manual",
            BackupKind::Scheduled => "scheduled",
        }
    }
}

impl fmt::Display for BackupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupKind {
    type Err = CoordinatorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "manual" => Ok(BackupKind::Manual),
            "scheduled" => Ok(BackupKind::Scheduled),
            other => Err(CoordinatorError::InvalidRequest(format!(
                "unknown backup type '{}', expected manual or scheduled",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    InProgress,
    Completed,
    PartialFailure,
    Failed,
}

impl BackupStatus {
    /// Three-way outcome shared by backups and restores.
    pub fn from_outcomes(succeeded: usize, total: usize) -> Self {
        if total > 0 && succeeded == total {
            BackupStatus::Completed
        } else if succeeded > 0 {
            BackupStatus::PartialFailure
        } else {
            BackupStatus::Failed
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BackupStatus::InProgress => "in_progress",
            BackupStatus::Completed => "completed",
            BackupStatus::PartialFailure => "partial_failure",
            BackupStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupStatus {
    type Err = CoordinatorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "in_progress" => Ok(BackupStatus::InProgress),
            "completed" => Ok(BackupStatus::Completed),
            "partial_failure" => Ok(BackupStatus::PartialFailure),
            "failed" => Ok(BackupStatus::Failed),
            other => Err(CoordinatorError::InvalidRequest(format!(
                "unknown backup status '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineStatus {
    Success,
    Failed,
    Skipped,
    TimedOut,
}

impl EngineStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EngineStatus::Success => "success",
            EngineStatus::Failed => "failed",
            EngineStatus::Skipped => "skipped",
            EngineStatus::TimedOut => "timed_out",
        }
    }
}

impl fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-engine outcome inside a backup set. The engine is the key it is stored under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineResult {
    pub status: EngineStatus,
    /// Artifact file name, relative to the backup directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<EngineErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl EngineResult {
    pub fn success(path: String, size_bytes: u64, checksum: String, duration_ms: u64) -> Self {
        Self {
            status: EngineStatus::Success,
            path: Some(path),
            size_bytes: Some(size_bytes),
            checksum: Some(checksum),
            duration_ms: Some(duration_ms),
            error_kind: None,
            error_message: None,
        }
    }

    pub fn failed(error: &EngineError) -> Self {
        Self::errored(EngineStatus::Failed, error)
    }

    pub fn timed_out(message: impl Into<String>) -> Self {
        Self::errored(
            EngineStatus::TimedOut,
            &EngineError::new(EngineErrorKind::Timeout, message),
        )
    }

    /// Never attempted, e.g. dropped after the disk filled up.
    pub fn skipped() -> Self {
        Self {
            status: EngineStatus::Skipped,
            path: None,
            size_bytes: None,
            checksum: None,
            duration_ms: None,
            error_kind: None,
            error_message: None,
        }
    }

    fn errored(status: EngineStatus, error: &EngineError) -> Self {
        Self {
            status,
            path: None,
            size_bytes: None,
            checksum: None,
            duration_ms: None,
            error_kind: Some(error.kind),
            error_message: Some(error.message.clone()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == EngineStatus::Success
    }

    /// Artifact fields only on success, error fields only on failed or timed_out.
    pub fn check_fields(&self) -> std::result::Result<(), String> {
        let has_artifact = self.path.is_some()
            || self.size_bytes.is_some()
            || self.checksum.is_some()
            || self.duration_ms.is_some();
        let full_artifact = self.path.is_some()
            && self.size_bytes.is_some()
            && self.checksum.is_some()
            && self.duration_ms.is_some();
        let has_error = self.error_kind.is_some() || self.error_message.is_some();
        let full_error = self.error_kind.is_some() && self.error_message.is_some();

        match self.status {
            EngineStatus::Success if !full_artifact => {
                Err("success entry is missing artifact fields".to_string())
            }
            EngineStatus::Success if has_error => {
                Err("success entry carries error fields".to_string())
            }
            EngineStatus::Failed | EngineStatus::TimedOut if !full_error => {
                Err(format!("{} entry is missing error fields", self.status))
            }
            EngineStatus::Failed | EngineStatus::TimedOut | EngineStatus::Skipped
                if has_artifact =>
            {
                Err(format!("{} entry carries artifact fields", self.status))
            }
            EngineStatus::Skipped if has_error => {
                Err("skipped entry carries error fields".to_string())
            }
            _ => Ok(()),
        }
    }
}

/// Durable record of one backup operation.
///
/// The engine keys are fixed to the requested set when the record is created,
/// and the status is always derived from the recorded results.
#[derive(Debug, Clone, PartialEq)]
pub struct BackupSet {
    id: String,
    kind: BackupKind,
    created_at: DateTime<Utc>,
    description: Option<String>,
    compress: bool,
    compression: Option<Algorithm>,
    requested: BTreeSet<Engine>,
    engines: BTreeMap<Engine, EngineResult>,
}

impl BackupSet {
    pub fn new(
        id: String,
        kind: BackupKind,
        requested: BTreeSet<Engine>,
        compression: Option<Algorithm>,
        description: Option<String>,
    ) -> Self {
        Self {
            id,
            kind,
            created_at: Utc::now(),
            description,
            compress: compression.is_some(),
            compression,
            requested,
            engines: BTreeMap::new(),
        }
    }

    /// Rebuild a finalized set from its stored parts.
    pub(crate) fn from_parts(
        id: String,
        kind: BackupKind,
        created_at: DateTime<Utc>,
        description: Option<String>,
        compress: bool,
        compression: Option<Algorithm>,
        engines: BTreeMap<Engine, EngineResult>,
    ) -> Self {
        Self {
            id,
            kind,
            created_at,
            description,
            compress,
            compression,
            requested: engines.keys().copied().collect(),
            engines,
        }
    }

    /// Record the outcome of one requested engine. Each engine settles exactly once.
    pub fn record(&mut self, engine: Engine, result: EngineResult) -> Result<()> {
        if !self.requested.contains(&engine) {
            return Err(CoordinatorError::InvalidRequest(format!(
                "engine {} was not requested for backup {}",
                engine, self.id
            )));
        }
        if self.engines.contains_key(&engine) {
            return Err(CoordinatorError::InvalidRequest(format!(
                "engine {} already settled for backup {}",
                engine, self.id
            )));
        }
        self.engines.insert(engine, result);
        Ok(())
    }

    pub fn status(&self) -> BackupStatus {
        if self.engines.len() < self.requested.len() {
            return BackupStatus::InProgress;
        }
        let succeeded = self.engines.values().filter(|r| r.is_success()).count();
        BackupStatus::from_outcomes(succeeded, self.engines.len())
    }

    pub fn is_settled(&self) -> bool {
        self.status() != BackupStatus::InProgress
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> BackupKind {
        self.kind
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn compress(&self) -> bool {
        self.compress
    }

    pub fn compression(&self) -> Option<Algorithm> {
        self.compression
    }

    pub fn requested(&self) -> &BTreeSet<Engine> {
        &self.requested
    }

    pub fn engines(&self) -> &BTreeMap<Engine, EngineResult> {
        &self.engines
    }

    pub fn engine_result(&self, engine: Engine) -> Option<&EngineResult> {
        self.engines.get(&engine)
    }

    /// Engines with a restorable artifact.
    pub fn successful_engines(&self) -> Vec<Engine> {
        self.engines
            .iter()
            .filter(|(_, result)| result.is_success())
            .map(|(engine, _)| *engine)
            .collect()
    }

    pub fn total_size_bytes(&self) -> u64 {
        self.engines.values().filter_map(|r| r.size_bytes).sum()
    }

    pub fn summary(&self) -> BackupSummary {
        BackupSummary {
            id: self.id.clone(),
            kind: self.kind,
            created_at: self.created_at,
            description: self.description.clone(),
            compress: self.compress,
            status: self.status(),
            total_size_bytes: self.total_size_bytes(),
            engines: self
                .engines
                .iter()
                .map(|(engine, result)| (*engine, result.status))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackupSummary {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: BackupKind,
    pub created_at: DateTime<Utc>,
    pub description: Option<String>,
    pub compress: bool,
    pub status: BackupStatus,
    pub total_size_bytes: u64,
    pub engines: BTreeMap<Engine, EngineStatus>,
}

/// `backup_<YYYYMMDD>_<HHMMSS>_<8 hex>`
pub fn generate_backup_id(now: DateTime<Utc>) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("backup_{}_{}", now.format("%Y%m%d_%H%M%S"), &suffix[..8])
}

/// Ids double as directory names, so anything that could escape the backup root is rejected.
pub fn is_valid_backup_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

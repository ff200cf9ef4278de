//! Error types for the backup coordinator.
//!
//! Two layers: [`CoordinatorError`] for faults that end a whole operation, and
//! [`EngineError`] for per-engine faults that are recorded in the manifest
//! instead of being propagated.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Unknown engine: {0}")]
    UnknownEngine(String),

    #[error("Backup already exists: {0}")]
    AlreadyExists(String),

    #[error("Backup not found: {0}")]
    NotFound(String),

    #[error("Corrupt manifest for backup {id}: {reason}")]
    CorruptManifest { id: String, reason: String },

    #[error("Disk exhausted: {0}")]
    DiskExhausted(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoordinatorError {
    pub fn corrupt(id: &str, reason: impl Into<String>) -> Self {
        CoordinatorError::CorruptManifest {
            id: id.to_string(),
            reason: reason.into(),
        }
    }

    /// Maps an I/O error, promoting `ENOSPC` to [`CoordinatorError::DiskExhausted`].
    pub fn from_io(err: std::io::Error) -> Self {
        if is_disk_full(&err) {
            CoordinatorError::DiskExhausted(err.to_string())
        } else {
            CoordinatorError::Io(err)
        }
    }
}

pub type Result<T> = std::result::Result<T, CoordinatorError>;

/// Shared failure taxonomy every engine adapter maps into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineErrorKind {
    ToolMissing,
    ConnectionRefused,
    PermissionDenied,
    Timeout,
    DiskExhausted,
    Unknown,
}

impl EngineErrorKind {
    /// Transient kinds are retried with backoff; the rest fail immediately.
    pub fn is_transient(self) -> bool {
        matches!(self, EngineErrorKind::ConnectionRefused | EngineErrorKind::Timeout)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EngineErrorKind::ToolMissing => "tool_missing",
            EngineErrorKind::ConnectionRefused => "connection_refused",
            EngineErrorKind::PermissionDenied => "permission_denied",
            EngineErrorKind::Timeout => "timeout",
            EngineErrorKind::DiskExhausted => "disk_exhausted",
            EngineErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for EngineErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct EngineError {
    pub kind: EngineErrorKind,
    pub message: String,
}

impl EngineError {
    pub fn new(kind: EngineErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::Unknown, message)
    }

    /// Classifies a local filesystem error raised while handling an artifact.
    pub fn from_io(err: &std::io::Error, context: &str) -> Self {
        let kind = if is_disk_full(err) {
            EngineErrorKind::DiskExhausted
        } else if err.kind() == std::io::ErrorKind::PermissionDenied {
            EngineErrorKind::PermissionDenied
        } else {
            EngineErrorKind::Unknown
        };
        Self::new(kind, format!("{}: {}", context, err))
    }
}

/// True when the error is `ENOSPC`.
pub fn is_disk_full(err: &std::io::Error) -> bool {
    err.raw_os_error() == Some(nix::errno::Errno::ENOSPC as i32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_kinds() {
        assert!(EngineErrorKind::ConnectionRefused.is_transient());
        assert!(EngineErrorKind::Timeout.is_transient());
        assert!(!EngineErrorKind::ToolMissing.is_transient());
        assert!(!EngineErrorKind::PermissionDenied.is_transient());
        assert!(!EngineErrorKind::DiskExhausted.is_transient());
        assert!(!EngineErrorKind::Unknown.is_transient());
    }

    #[test]
    fn test_enospc_maps_to_disk_exhausted() {
        let err = std::io::Error::from_raw_os_error(nix::errno::Errno::ENOSPC as i32);
        assert_eq!(EngineError::from_io(&err, "write").kind, EngineErrorKind::DiskExhausted);
        assert!(matches!(
            CoordinatorError::from_io(err),
            CoordinatorError::DiskExhausted(_)
        ));
    }

    #[test]
    fn test_error_kind_serializes_snake_case() {
        let json = serde_json::to_string(&EngineErrorKind::ConnectionRefused).unwrap();
        assert_eq!(json, "\"connection_refused\"");
    }
}

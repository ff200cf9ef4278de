//! On-disk manifests, the source of truth for every backup set.
//!
//! Each backup lives in `<root>/<id>/` with a `manifest.json` next to its
//! artifacts. Manifests are published with write-to-temp, fsync, rename, so a
//! reader sees either no manifest or a complete one.

use crate::codec::Algorithm;
use crate::engines::Engine;
use crate::models::{is_valid_backup_id, BackupKind, BackupSet, BackupStatus, BackupSummary, EngineResult};
use crate::utils::checksum::sha256_bytes;
use crate::utils::errors::{CoordinatorError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

pub const MANIFEST_FILE: &str = "manifest.json";
const MANIFEST_TMP_FILE: &str = ".manifest.json.tmp";
const CHECKSUM_FIELD: &str = "manifest_checksum";

/// Serialized form of a backup set, minus `manifest_checksum`.
#[derive(Debug, Serialize, Deserialize)]
struct ManifestBody {
    id: String,
    #[serde(rename = "type")]
    kind: BackupKind,
    created_at: DateTime<Utc>,
    description: Option<String>,
    compress: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    compression: Option<Algorithm>,
    status: BackupStatus,
    engines: BTreeMap<Engine, EngineResult>,
}

#[derive(Debug, Clone, Default)]
pub struct BackupFilter {
    pub kind: Option<BackupKind>,
    pub status: Option<BackupStatus>,
    /// Only backups created strictly before this instant; pass the last seen
    /// `created_at` to fetch the next page.
    pub before: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl BackupFilter {
    fn matches(&self, set: &BackupSet) -> bool {
        self.kind.map_or(true, |kind| set.kind() == kind)
            && self.status.map_or(true, |status| set.status() == status)
            && self.before.map_or(true, |before| set.created_at() < before)
    }
}

/// A manifest that could not be read during a listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestWarning {
    pub id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BackupListing {
    pub backups: Vec<BackupSummary>,
    pub warnings: Vec<ManifestWarning>,
}

#[derive(Debug, Clone)]
pub struct ManifestStore {
    root: PathBuf,
}

impl ManifestStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory for `id`. Ids that are not plain names cannot exist.
    pub fn backup_dir(&self, id: &str) -> Result<PathBuf> {
        if !is_valid_backup_id(id) {
            return Err(CoordinatorError::NotFound(id.to_string()));
        }
        Ok(self.root.join(id))
    }

    /// Create the directory for a new backup. Fails if it already exists.
    pub async fn create_backup_dir(&self, id: &str) -> Result<PathBuf> {
        if !is_valid_backup_id(id) {
            return Err(CoordinatorError::InvalidRequest(format!(
                "invalid backup id: {}",
                id
            )));
        }
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(CoordinatorError::from_io)?;

        let dir = self.root.join(id);
        match tokio::fs::create_dir(&dir).await {
            Ok(()) => Ok(dir),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(CoordinatorError::AlreadyExists(id.to_string()))
            }
            Err(e) => Err(CoordinatorError::from_io(e)),
        }
    }

    /// Publish a settled backup set. A published manifest is never replaced.
    pub async fn write(&self, set: &BackupSet) -> Result<()> {
        if !set.is_settled() {
            return Err(CoordinatorError::InvalidRequest(format!(
                "backup {} still has unsettled engines",
                set.id()
            )));
        }

        let dir = self.backup_dir(set.id())?;
        let final_path = dir.join(MANIFEST_FILE);
        if tokio::fs::try_exists(&final_path).await.unwrap_or(false) {
            return Err(CoordinatorError::AlreadyExists(set.id().to_string()));
        }

        let bytes = encode(set)?;
        let temp_path = dir.join(MANIFEST_TMP_FILE);
        {
            let mut file = tokio::fs::File::create(&temp_path)
                .await
                .map_err(CoordinatorError::from_io)?;
            file.write_all(&bytes).await.map_err(CoordinatorError::from_io)?;
            file.sync_all().await.map_err(CoordinatorError::from_io)?;
        }

        // rename is atomic on POSIX
        tokio::fs::rename(&temp_path, &final_path)
            .await
            .map_err(CoordinatorError::from_io)?;
        sync_dir(&dir).await;

        info!(backup_id = %set.id(), status = %set.status(), "Manifest published");
        Ok(())
    }

    pub async fn read(&self, id: &str) -> Result<BackupSet> {
        let path = self.backup_dir(id)?.join(MANIFEST_FILE);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CoordinatorError::NotFound(id.to_string()))
            }
            Err(e) => return Err(CoordinatorError::from_io(e)),
        };
        decode(id, &bytes)
    }

    /// Scan the backup root. Unreadable manifests become warnings.
    pub async fn list(&self, filter: &BackupFilter) -> Result<BackupListing> {
        let mut listing = BackupListing::default();
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(listing),
            Err(e) => return Err(CoordinatorError::from_io(e)),
        };

        let mut sets = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || !entry.file_type().await?.is_dir() {
                continue;
            }
            if !tokio::fs::try_exists(entry.path().join(MANIFEST_FILE))
                .await
                .unwrap_or(false)
            {
                debug!("Skipping {}: no published manifest", name);
                continue;
            }

            match self.read(&name).await {
                Ok(set) => sets.push(set),
                Err(e) => {
                    warn!(backup_id = %name, "Unreadable manifest: {}", e);
                    listing.warnings.push(ManifestWarning {
                        id: name,
                        reason: e.to_string(),
                    });
                }
            }
        }

        sets.sort_by(|a, b| {
            b.created_at()
                .cmp(&a.created_at())
                .then_with(|| b.id().cmp(a.id()))
        });
        listing.backups = sets
            .iter()
            .filter(|set| filter.matches(set))
            .take(filter.limit.unwrap_or(usize::MAX))
            .map(BackupSet::summary)
            .collect();
        Ok(listing)
    }

    /// Delete a backup directory after confirming it holds a readable manifest.
    pub async fn remove(&self, id: &str) -> Result<()> {
        self.read(id).await?;
        let dir = self.backup_dir(id)?;
        tokio::fs::remove_dir_all(&dir)
            .await
            .map_err(CoordinatorError::from_io)?;
        info!(backup_id = %id, "Backup removed");
        Ok(())
    }
}

async fn sync_dir(dir: &Path) {
    match tokio::fs::File::open(dir).await {
        Ok(handle) => {
            if let Err(e) = handle.sync_all().await {
                debug!("Could not fsync {}: {}", dir.display(), e);
            }
        }
        Err(e) => debug!("Could not open {} for fsync: {}", dir.display(), e),
    }
}

fn checksum_of(body: &Value) -> Result<String> {
    Ok(sha256_bytes(&serde_json::to_vec(body)?))
}

/// Pretty JSON with `manifest_checksum` over the canonical (sorted-key) body.
pub fn encode(set: &BackupSet) -> Result<Vec<u8>> {
    let body = ManifestBody {
        id: set.id().to_string(),
        kind: set.kind(),
        created_at: set.created_at(),
        description: set.description().map(str::to_string),
        compress: set.compress(),
        compression: set.compression(),
        status: set.status(),
        engines: set.engines().clone(),
    };
    let mut value = serde_json::to_value(&body)?;
    let checksum = checksum_of(&value)?;
    if let Value::Object(map) = &mut value {
        map.insert(CHECKSUM_FIELD.to_string(), Value::String(checksum));
    }
    Ok(serde_json::to_vec_pretty(&value)?)
}

/// Parse and validate a manifest stored under `id`.
pub fn decode(id: &str, bytes: &[u8]) -> Result<BackupSet> {
    let mut value: Value = serde_json::from_slice(bytes)
        .map_err(|e| CoordinatorError::corrupt(id, format!("malformed JSON: {}", e)))?;

    let stored = match value.as_object_mut().and_then(|map| map.remove(CHECKSUM_FIELD)) {
        Some(Value::String(checksum)) => checksum,
        _ => return Err(CoordinatorError::corrupt(id, "missing manifest_checksum")),
    };
    if checksum_of(&value)? != stored {
        return Err(CoordinatorError::corrupt(id, "checksum mismatch"));
    }

    let body: ManifestBody = serde_json::from_value(value)
        .map_err(|e| CoordinatorError::corrupt(id, format!("invalid document: {}", e)))?;

    if body.id != id {
        return Err(CoordinatorError::corrupt(
            id,
            format!("manifest id {} does not match its directory", body.id),
        ));
    }
    if body.engines.is_empty() {
        return Err(CoordinatorError::corrupt(id, "no engine entries"));
    }
    for (engine, result) in &body.engines {
        result
            .check_fields()
            .map_err(|reason| CoordinatorError::corrupt(id, format!("{}: {}", engine, reason)))?;
    }

    let compression = if body.compress {
        Some(body.compression.unwrap_or(Algorithm::Gzip))
    } else {
        None
    };
    let set = BackupSet::from_parts(
        body.id,
        body.kind,
        body.created_at,
        body.description,
        body.compress,
        compression,
        body.engines,
    );
    if set.status() != body.status {
        return Err(CoordinatorError::corrupt(
            id,
            format!(
                "stored status {} disagrees with engine results ({})",
                body.status,
                set.status()
            ),
        ));
    }
    Ok(set)
}

//! Restore fan-out from a published backup set.

use super::pool::{TaskOutcome, WorkerPool};
use crate::codec::{Algorithm, CompressionCodec};
use crate::engines::{AdapterRegistry, Engine, EngineAdapter, RestoreOutcome};
use crate::manifest::ManifestStore;
use crate::models::{EngineResult, RestoreResult, RestoreStatus, RestoreWarning, WarningKind};
use crate::utils::checksum::sha256_file;
use crate::utils::errors::{CoordinatorError, EngineError, EngineErrorKind, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Clone)]
pub struct RecoveryCoordinator {
    registry: AdapterRegistry,
    store: ManifestStore,
    pool: Arc<WorkerPool>,
    staging_dir: PathBuf,
}

/// Everything one restore task needs, resolved before dispatch.
struct RestoreJob {
    adapter: Arc<dyn EngineAdapter>,
    artifact: PathBuf,
    checksum: Option<String>,
    compression: Option<Algorithm>,
    stage_dir: PathBuf,
}

impl RecoveryCoordinator {
    pub fn new(
        registry: AdapterRegistry,
        store: ManifestStore,
        pool: Arc<WorkerPool>,
        staging_dir: PathBuf,
    ) -> Self {
        Self {
            registry,
            store,
            pool,
            staging_dir,
        }
    }

    /// Restore `engines` (or every successfully backed-up engine) from backup `id`.
    ///
    /// A missing or corrupt manifest fails the call before any engine is touched.
    /// Requested engines without a successful artifact are reported as warnings.
    pub async fn restore_from_backup(
        &self,
        id: &str,
        engines: Option<&[String]>,
    ) -> Result<RestoreResult> {
        let set = self.store.read(id).await?;
        let successful: BTreeSet<Engine> = set.successful_engines().into_iter().collect();

        let requested: BTreeSet<Engine> = match engines {
            Some(names) if names.is_empty() => {
                return Err(CoordinatorError::InvalidRequest(
                    "at least one engine must be requested".to_string(),
                ))
            }
            Some(names) => names
                .iter()
                .map(|name| name.parse::<Engine>())
                .collect::<Result<_>>()?,
            None => successful.clone(),
        };

        let mut warnings = Vec::new();
        let mut effective = Vec::new();
        for engine in requested {
            if successful.contains(&engine) {
                effective.push(engine);
                continue;
            }
            let message = match set.engine_result(engine) {
                Some(result) => format!("engine {} has status {} in backup {}", engine, result.status, id),
                None => format!("engine {} is not part of backup {}", engine, id),
            };
            warn!(backup_id = %id, engine = %engine, "Skipping restore: {}", message);
            warnings.push(RestoreWarning {
                engine,
                kind: WarningKind::SkippedNoBackup,
                message,
            });
        }

        if effective.is_empty() {
            warn!(backup_id = %id, "Nothing to restore");
            return Ok(RestoreResult {
                backup_id: id.to_string(),
                status: RestoreStatus::Failed,
                databases_restored: Vec::new(),
                errors: BTreeMap::new(),
                warnings,
            });
        }

        info!(backup_id = %id, engines = ?effective, "Starting restore");
        let backup_dir = self.store.backup_dir(id)?;
        let stage_root = self.staging_dir.join(format!(
            "restore-{}-{}",
            id,
            uuid::Uuid::new_v4().simple()
        ));
        tokio::fs::create_dir_all(&stage_root)
            .await
            .map_err(CoordinatorError::from_io)?;

        let mut errors = BTreeMap::new();
        let abort = CancellationToken::new();
        let mut jobs = Vec::with_capacity(effective.len());
        for engine in &effective {
            let Some(adapter) = self.registry.get(*engine) else {
                errors.insert(*engine, format!("no adapter configured for engine {}", engine));
                continue;
            };
            // Checked by manifest validation: success entries always carry these.
            let Some(entry) = set.engine_result(*engine) else {
                continue;
            };
            let artifact = match artifact_path(&backup_dir, entry) {
                Ok(path) => path,
                Err(e) => {
                    errors.insert(*engine, e.to_string());
                    continue;
                }
            };

            let job = RestoreJob {
                adapter,
                artifact,
                checksum: entry.checksum.clone(),
                compression: set.compression(),
                stage_dir: stage_root.join(engine.as_str()),
            };
            let abort = abort.clone();
            jobs.push((*engine, move |cancel: CancellationToken| async move {
                let result = restore_engine(&job, &cancel).await;
                if let Err(e) = &result {
                    if e.kind == EngineErrorKind::DiskExhausted {
                        error!(engine = %job.adapter.engine(), "Disk exhausted, not starting remaining restores");
                        abort.cancel();
                    }
                }
                result
            }));
        }

        let mut restored = Vec::new();
        for (engine, outcome) in self.pool.run_all(jobs, &abort).await {
            match outcome {
                TaskOutcome::Finished(Ok(outcome)) => {
                    info!(backup_id = %id, engine = %engine, "Restored: {}", outcome.detail);
                    restored.push(engine);
                }
                TaskOutcome::Finished(Err(e)) => {
                    warn!(backup_id = %id, engine = %engine, kind = %e.kind, "Restore failed: {}", e.message);
                    errors.insert(engine, e.to_string());
                }
                TaskOutcome::TimedOut(reason) => {
                    warn!(backup_id = %id, engine = %engine, "Restore timed out: {}", reason);
                    errors.insert(engine, format!("timeout: {}", reason));
                }
                TaskOutcome::Skipped => {
                    errors.insert(engine, "not attempted: restore aborted".to_string());
                }
                TaskOutcome::Crashed(reason) => {
                    error!(backup_id = %id, engine = %engine, "Restore task crashed: {}", reason);
                    errors.insert(engine, format!("restore task crashed: {}", reason));
                }
            }
        }

        if let Err(e) = tokio::fs::remove_dir_all(&stage_root).await {
            debug!("Could not remove staging directory {}: {}", stage_root.display(), e);
        }

        restored.sort();
        let status = RestoreStatus::from_outcomes(restored.len(), effective.len());
        info!(backup_id = %id, status = %status, restored = ?restored, "Restore finished");
        Ok(RestoreResult {
            backup_id: id.to_string(),
            status,
            databases_restored: restored,
            errors,
            warnings,
        })
    }

    /// Single-engine restore through the same path as a full restore.
    pub async fn restore_engine(&self, id: &str, engine: Engine) -> Result<RestoreResult> {
        let names = [engine.to_string()];
        self.restore_from_backup(id, Some(&names[..])).await
    }

    pub async fn restore_relational(&self, id: &str) -> Result<RestoreResult> {
        self.restore_engine(id, Engine::Relational).await
    }

    pub async fn restore_vector_index(&self, id: &str) -> Result<RestoreResult> {
        self.restore_engine(id, Engine::VectorIndex).await
    }

    pub async fn restore_graph(&self, id: &str) -> Result<RestoreResult> {
        self.restore_engine(id, Engine::Graph).await
    }

    pub async fn restore_cache(&self, id: &str) -> Result<RestoreResult> {
        self.restore_engine(id, Engine::Cache).await
    }
}

/// Artifact paths are stored as bare file names inside the backup directory.
fn artifact_path(backup_dir: &Path, entry: &EngineResult) -> std::result::Result<PathBuf, EngineError> {
    let name = entry
        .path
        .as_deref()
        .ok_or_else(|| EngineError::unknown("manifest entry has no artifact path"))?;
    if Path::new(name).file_name() != Some(OsStr::new(name)) {
        return Err(EngineError::unknown(format!("artifact path {} escapes the backup directory", name)));
    }
    Ok(backup_dir.join(name))
}

async fn restore_engine(
    job: &RestoreJob,
    cancel: &CancellationToken,
) -> std::result::Result<RestoreOutcome, EngineError> {
    let actual = sha256_file(&job.artifact)
        .await
        .map_err(|e| EngineError::from_io(&e, "read artifact"))?;
    if job.checksum.as_deref() != Some(actual.as_str()) {
        return Err(EngineError::unknown(format!(
            "artifact {} does not match its manifest checksum",
            job.artifact.display()
        )));
    }

    let Some(algorithm) = job.compression else {
        return job.adapter.restore(&job.artifact, cancel).await;
    };

    tokio::fs::create_dir_all(&job.stage_dir)
        .await
        .map_err(|e| EngineError::from_io(&e, "create staging directory"))?;
    let staged = job.stage_dir.join(job.adapter.engine().artifact_name());
    let result = match CompressionCodec::new(algorithm, None)
        .decompress_file(&job.artifact, &staged)
        .await
    {
        Ok(_) => job.adapter.restore(&staged, cancel).await,
        Err(e) => Err(EngineError::from_io(&e, "decompress artifact")),
    };

    if let Err(e) = tokio::fs::remove_dir_all(&job.stage_dir).await {
        debug!("Could not remove {}: {}", job.stage_dir.display(), e);
    }
    result
}

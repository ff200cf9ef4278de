//! Backup fan-out: one dump task per requested engine, then one manifest.

use super::pool::{TaskOutcome, WorkerPool};
use super::recovery::RecoveryCoordinator;
use crate::codec::CompressionCodec;
use crate::config::Config;
use crate::engines::{AdapterRegistry, Engine, EngineAdapter};
use crate::manifest::{BackupFilter, BackupListing, ManifestStore};
use crate::models::{generate_backup_id, BackupKind, BackupSet, EngineResult};
use crate::utils::checksum::sha256_file;
use crate::utils::errors::{CoordinatorError, EngineError, EngineErrorKind, Result};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Produces backup ids from the capture start time.
pub type IdGenerator = Arc<dyn Fn(DateTime<Utc>) -> String + Send + Sync>;

#[derive(Debug, Clone)]
pub struct BackupRequest {
    pub kind: BackupKind,
    /// Engine names; unknown names fail the request before anything runs.
    pub engines: Vec<String>,
    pub compress: bool,
    pub description: Option<String>,
}

impl BackupRequest {
    /// Every engine, compressed.
    pub fn all_engines(kind: BackupKind) -> Self {
        Self {
            kind,
            engines: Engine::ALL.iter().map(|e| e.to_string()).collect(),
            compress: true,
            description: None,
        }
    }
}

#[derive(Clone)]
pub struct BackupCoordinator {
    registry: AdapterRegistry,
    store: ManifestStore,
    pool: Arc<WorkerPool>,
    codec: CompressionCodec,
    staging_dir: PathBuf,
    id_generator: IdGenerator,
}

impl BackupCoordinator {
    pub fn new(
        registry: AdapterRegistry,
        store: ManifestStore,
        pool: Arc<WorkerPool>,
        codec: CompressionCodec,
        staging_dir: PathBuf,
    ) -> Self {
        Self {
            registry,
            store,
            pool,
            codec,
            staging_dir,
            id_generator: Arc::new(generate_backup_id),
        }
    }

    pub fn from_config(config: &Config, registry: AdapterRegistry) -> Result<Self> {
        Ok(Self::new(
            registry,
            ManifestStore::new(&config.backup.root),
            Arc::new(WorkerPool::from_config(config)),
            config.codec()?,
            config.staging_dir(),
        ))
    }

    pub fn with_id_generator<F>(mut self, generator: F) -> Self
    where
        F: Fn(DateTime<Utc>) -> String + Send + Sync + 'static,
    {
        self.id_generator = Arc::new(generator);
        self
    }

    pub fn store(&self) -> &ManifestStore {
        &self.store
    }

    pub fn registry(&self) -> &AdapterRegistry {
        &self.registry
    }

    /// Restore side sharing this coordinator's adapters, store and worker pool.
    pub fn recovery(&self) -> RecoveryCoordinator {
        RecoveryCoordinator::new(
            self.registry.clone(),
            self.store.clone(),
            self.pool.clone(),
            self.staging_dir.clone(),
        )
    }

    /// Run one backup and publish its manifest.
    ///
    /// Individual engine failures do not fail the call; the returned id's
    /// manifest carries the per-engine outcome and overall status.
    pub async fn create_backup(&self, request: BackupRequest) -> Result<String> {
        let requested = self.resolve_engines(&request.engines)?;
        let id = (self.id_generator)(Utc::now());
        let dir = self.store.create_backup_dir(&id).await?;

        let codec = request.compress.then_some(self.codec);
        let mut set = BackupSet::new(
            id.clone(),
            request.kind,
            requested.clone(),
            codec.map(|c| c.algorithm()),
            request.description,
        );
        info!(
            backup_id = %id,
            kind = %request.kind,
            engines = ?requested,
            compress = request.compress,
            "Starting backup"
        );

        let abort = CancellationToken::new();
        let mut jobs = Vec::with_capacity(requested.len());
        for engine in &requested {
            let adapter = self.adapter(*engine)?;
            let dir = dir.clone();
            let abort = abort.clone();
            jobs.push((*engine, move |cancel: CancellationToken| async move {
                let result = dump_engine(adapter.as_ref(), &dir, codec, &cancel).await;
                if let Err(e) = &result {
                    if e.kind == EngineErrorKind::DiskExhausted {
                        error!(engine = %adapter.engine(), "Disk exhausted, not starting remaining engines");
                        abort.cancel();
                    }
                }
                result
            }));
        }

        for (engine, outcome) in self.pool.run_all(jobs, &abort).await {
            let result = match outcome {
                TaskOutcome::Finished(Ok(result)) => {
                    info!(backup_id = %id, engine = %engine, size_bytes = ?result.size_bytes, "Engine dump succeeded");
                    result
                }
                TaskOutcome::Finished(Err(e)) => {
                    warn!(backup_id = %id, engine = %engine, kind = %e.kind, "Engine dump failed: {}", e.message);
                    EngineResult::failed(&e)
                }
                TaskOutcome::TimedOut(reason) => {
                    warn!(backup_id = %id, engine = %engine, "Engine dump timed out: {}", reason);
                    EngineResult::timed_out(reason)
                }
                TaskOutcome::Skipped => {
                    warn!(backup_id = %id, engine = %engine, "Engine dump skipped");
                    EngineResult::skipped()
                }
                TaskOutcome::Crashed(reason) => {
                    error!(backup_id = %id, engine = %engine, "Engine dump task crashed: {}", reason);
                    EngineResult::failed(&EngineError::unknown(format!("dump task crashed: {}", reason)))
                }
            };
            set.record(engine, result)?;
        }

        self.store.write(&set).await?;
        info!(backup_id = %id, status = %set.status(), "Backup finished");
        Ok(id)
    }

    pub async fn list_backups(&self, filter: &BackupFilter) -> Result<BackupListing> {
        self.store.list(filter).await
    }

    pub async fn show_backup(&self, id: &str) -> Result<BackupSet> {
        self.store.read(id).await
    }

    /// Caller-driven retention; nothing is ever pruned automatically.
    pub async fn delete_backup(&self, id: &str) -> Result<()> {
        self.store.remove(id).await
    }

    /// Probe every registered engine through the worker pool.
    pub async fn health_check(&self) -> BTreeMap<Engine, bool> {
        let jobs: Vec<_> = self
            .registry
            .engines()
            .into_iter()
            .filter_map(|engine| self.registry.get(engine).map(|adapter| (engine, adapter)))
            .map(|(engine, adapter)| {
                (engine, move |_cancel: CancellationToken| async move {
                    adapter.health_check().await
                })
            })
            .collect();

        self.pool
            .run_all(jobs, &CancellationToken::new())
            .await
            .into_iter()
            .map(|(engine, outcome)| (engine, matches!(outcome, TaskOutcome::Finished(true))))
            .collect()
    }

    fn resolve_engines(&self, names: &[String]) -> Result<BTreeSet<Engine>> {
        if names.is_empty() {
            return Err(CoordinatorError::InvalidRequest(
                "at least one engine must be requested".to_string(),
            ));
        }
        let engines = names
            .iter()
            .map(|name| name.parse::<Engine>())
            .collect::<Result<BTreeSet<_>>>()?;
        for engine in &engines {
            self.adapter(*engine)?;
        }
        Ok(engines)
    }

    fn adapter(&self, engine: Engine) -> Result<Arc<dyn EngineAdapter>> {
        self.registry.get(engine).ok_or_else(|| {
            CoordinatorError::InvalidRequest(format!("no adapter configured for engine {}", engine))
        })
    }
}

/// `<name>.archive` becomes `<name>.archive.gz`.
fn compressed_path(raw: &Path, extension: &str) -> PathBuf {
    let mut name = raw.as_os_str().to_owned();
    name.push(".");
    name.push(extension);
    PathBuf::from(name)
}

async fn dump_engine(
    adapter: &dyn EngineAdapter,
    dir: &Path,
    codec: Option<CompressionCodec>,
    cancel: &CancellationToken,
) -> std::result::Result<EngineResult, EngineError> {
    let started = Instant::now();
    let raw = adapter.dump(dir, cancel).await?;

    let artifact = match codec {
        Some(codec) => {
            let packed = compressed_path(&raw, codec.algorithm().extension());
            codec
                .compress_file(&raw, &packed)
                .await
                .map_err(|e| EngineError::from_io(&e, "compress artifact"))?;
            if let Err(e) = tokio::fs::remove_file(&raw).await {
                debug!("Could not remove uncompressed artifact {}: {}", raw.display(), e);
            }
            packed
        }
        None => raw,
    };

    let size_bytes = tokio::fs::metadata(&artifact)
        .await
        .map_err(|e| EngineError::from_io(&e, "stat artifact"))?
        .len();
    let checksum = sha256_file(&artifact)
        .await
        .map_err(|e| EngineError::from_io(&e, "checksum artifact"))?;
    let name = artifact
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| EngineError::unknown(format!("artifact path {} has no file name", artifact.display())))?;

    Ok(EngineResult::success(
        name,
        size_bytes,
        checksum,
        started.elapsed().as_millis() as u64,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Algorithm;
    use crate::models::{is_valid_backup_id, BackupStatus, EngineStatus};
    use crate::config::RelationalConfig;
    use crate::engines::{RelationalAdapter, RetryPolicy};
    use crate::testing::{fake_registry, FakeAdapter, Reply, ScriptedRunner};
    use crate::utils::checksum::sha256_bytes;
    use std::collections::HashMap;
    use std::time::Duration;
    use tempfile::TempDir;

    fn coordinator(
        root: &Path,
        concurrency: usize,
    ) -> (BackupCoordinator, HashMap<Engine, Arc<FakeAdapter>>) {
        let (registry, fakes) = fake_registry();
        let pool = WorkerPool::new(concurrency, Duration::from_secs(30))
            .with_kill_grace(Duration::ZERO);
        let coordinator = BackupCoordinator::new(
            registry,
            ManifestStore::new(root),
            Arc::new(pool),
            CompressionCodec::new(Algorithm::Gzip, None),
            root.join(".staging"),
        );
        (coordinator, fakes)
    }

    fn request(engines: &[Engine], compress: bool) -> BackupRequest {
        BackupRequest {
            kind: BackupKind::Manual,
            engines: engines.iter().map(|e| e.to_string()).collect(),
            compress,
            description: Some("test".to_string()),
        }
    }

    #[tokio::test]
    async fn test_manifest_keys_equal_requested_engines() {
        let dir = TempDir::new().unwrap();
        let (coordinator, _) = coordinator(dir.path(), 4);

        for mask in 1u8..16 {
            let engines: Vec<Engine> = Engine::ALL
                .into_iter()
                .enumerate()
                .filter(|(i, _)| mask & (1 << i) != 0)
                .map(|(_, e)| e)
                .collect();
            let id = coordinator.create_backup(request(&engines, false)).await.unwrap();
            let set = coordinator.show_backup(&id).await.unwrap();

            let keys: Vec<Engine> = set.engines().keys().copied().collect();
            assert_eq!(keys, engines);
            assert_eq!(set.status(), BackupStatus::Completed);
        }
    }

    #[tokio::test]
    async fn test_compressed_backup_of_two_engines() {
        let dir = TempDir::new().unwrap();
        let (coordinator, fakes) = coordinator(dir.path(), 4);

        let id = coordinator
            .create_backup(request(&[Engine::Relational, Engine::Cache], true))
            .await
            .unwrap();
        assert!(id.starts_with("backup_"));
        assert!(is_valid_backup_id(&id));

        let set = coordinator.show_backup(&id).await.unwrap();
        assert_eq!(set.status(), BackupStatus::Completed);
        assert!(set.compress());
        for engine in [Engine::Relational, Engine::Cache] {
            let result = set.engine_result(engine).unwrap();
            assert_eq!(result.status, EngineStatus::Success);
            assert!(result.size_bytes.unwrap() > 0);

            let path = dir.path().join(&id).join(result.path.as_ref().unwrap());
            assert_eq!(path, dir.path().join(&id).join(format!("{}.archive.gz", engine)));
            let bytes = std::fs::read(&path).unwrap();
            assert_eq!(result.checksum.as_deref(), Some(sha256_bytes(&bytes).as_str()));
            assert_eq!(result.size_bytes, Some(bytes.len() as u64));
            assert!(!dir.path().join(&id).join(engine.artifact_name()).exists());
        }
        assert_eq!(fakes[&Engine::Graph].dump_calls(), 0);
    }

    #[tokio::test]
    async fn test_uncompressed_artifact_checksum_covers_raw_bytes() {
        let dir = TempDir::new().unwrap();
        let (coordinator, fakes) = coordinator(dir.path(), 4);

        let id = coordinator
            .create_backup(request(&[Engine::Graph], false))
            .await
            .unwrap();
        let set = coordinator.show_backup(&id).await.unwrap();
        let result = set.engine_result(Engine::Graph).unwrap();

        assert_eq!(result.path.as_deref(), Some("graph.archive"));
        assert_eq!(
            result.checksum.as_deref(),
            Some(sha256_bytes(&fakes[&Engine::Graph].contents()).as_str())
        );
        assert_eq!(set.compression(), None);
    }

    #[tokio::test]
    async fn test_one_failing_engine_is_isolated() {
        let dir = TempDir::new().unwrap();
        let (coordinator, fakes) = coordinator(dir.path(), 4);
        fakes[&Engine::Graph].fail_dump(EngineErrorKind::ToolMissing, "neo4j-admin: not found");

        let id = coordinator
            .create_backup(BackupRequest::all_engines(BackupKind::Scheduled))
            .await
            .unwrap();
        let set = coordinator.show_backup(&id).await.unwrap();

        assert_eq!(set.status(), BackupStatus::PartialFailure);
        let graph = set.engine_result(Engine::Graph).unwrap();
        assert_eq!(graph.status, EngineStatus::Failed);
        assert_eq!(graph.error_kind, Some(EngineErrorKind::ToolMissing));
        assert!(graph.path.is_none());

        for engine in [Engine::Relational, Engine::VectorIndex, Engine::Cache] {
            let result = set.engine_result(engine).unwrap();
            assert_eq!(result.status, EngineStatus::Success);
            assert!(dir.path().join(&id).join(result.path.as_ref().unwrap()).exists());
            assert_eq!(fakes[&engine].dump_calls(), 1);
        }
    }

    #[tokio::test]
    async fn test_all_engines_failing_still_publishes_manifest() {
        let dir = TempDir::new().unwrap();
        let (coordinator, fakes) = coordinator(dir.path(), 4);
        for fake in fakes.values() {
            fake.fail_dump(EngineErrorKind::PermissionDenied, "denied");
        }

        let id = coordinator
            .create_backup(request(&[Engine::Relational, Engine::VectorIndex], false))
            .await
            .unwrap();
        assert_eq!(
            coordinator.show_backup(&id).await.unwrap().status(),
            BackupStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_unknown_engine_fails_before_dispatch() {
        let dir = TempDir::new().unwrap();
        let (coordinator, fakes) = coordinator(dir.path(), 4);

        let err = coordinator
            .create_backup(BackupRequest {
                engines: vec!["relational".to_string(), "elasticsearch".to_string()],
                ..request(&[], false)
            })
            .await
            .unwrap_err();

        assert!(matches!(err, CoordinatorError::UnknownEngine(name) if name == "elasticsearch"));
        assert_eq!(fakes[&Engine::Relational].dump_calls(), 0);
        assert!(!dir.path().exists() || std::fs::read_dir(dir.path()).unwrap().count() == 0);
    }

    #[tokio::test]
    async fn test_empty_engine_set_is_rejected() {
        let dir = TempDir::new().unwrap();
        let (coordinator, _) = coordinator(dir.path(), 4);
        let err = coordinator.create_backup(request(&[], true)).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_forced_id_collision_is_already_exists() {
        let dir = TempDir::new().unwrap();
        let (coordinator, fakes) = coordinator(dir.path(), 4);
        let coordinator = coordinator.with_id_generator(|_| "backup_fixed".to_string());

        let first = coordinator
            .create_backup(request(&[Engine::Cache], false))
            .await
            .unwrap();
        let before = std::fs::read(dir.path().join(&first).join("manifest.json")).unwrap();

        let err = coordinator
            .create_backup(request(&[Engine::Relational], false))
            .await
            .unwrap_err();

        assert!(matches!(err, CoordinatorError::AlreadyExists(id) if id == "backup_fixed"));
        assert_eq!(fakes[&Engine::Relational].dump_calls(), 0);
        let after = std::fs::read(dir.path().join(&first).join("manifest.json")).unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_concurrent_backups_get_distinct_directories() {
        let dir = TempDir::new().unwrap();
        let (coordinator, _) = coordinator(dir.path(), 4);

        let a = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.create_backup(request(&Engine::ALL, false)).await }
        });
        let b = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.create_backup(request(&Engine::ALL, true)).await }
        });
        let a = a.await.unwrap().unwrap();
        let b = b.await.unwrap().unwrap();

        assert_ne!(a, b);
        assert!(!coordinator.show_backup(&a).await.unwrap().compress());
        assert!(coordinator.show_backup(&b).await.unwrap().compress());
    }

    #[tokio::test]
    async fn test_slow_engine_is_timed_out() {
        let dir = TempDir::new().unwrap();
        let (registry, fakes) = fake_registry();
        let pool = WorkerPool::new(4, Duration::from_millis(100)).with_kill_grace(Duration::ZERO);
        let coordinator = BackupCoordinator::new(
            registry,
            ManifestStore::new(dir.path()),
            Arc::new(pool),
            CompressionCodec::new(Algorithm::Gzip, None),
            dir.path().join(".staging"),
        );
        fakes[&Engine::VectorIndex].delay_dump(Duration::from_secs(30));

        let id = coordinator
            .create_backup(request(&[Engine::Relational, Engine::VectorIndex], true))
            .await
            .unwrap();
        let set = coordinator.show_backup(&id).await.unwrap();

        assert_eq!(set.status(), BackupStatus::PartialFailure);
        let slow = set.engine_result(Engine::VectorIndex).unwrap();
        assert_eq!(slow.status, EngineStatus::TimedOut);
        assert_eq!(slow.error_kind, Some(EngineErrorKind::Timeout));
        assert_eq!(
            set.engine_result(Engine::Relational).unwrap().status,
            EngineStatus::Success
        );
    }

    #[tokio::test]
    async fn test_hung_dump_tool_is_cancelled_and_timed_out() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("pg_dump", |_| Reply::Hang);
        let (registry, _) = fake_registry();
        let registry = registry.with_adapter(Arc::new(RelationalAdapter::new(
            RelationalConfig::default(),
            runner.clone(),
            RetryPolicy::no_retry(),
        )));
        let pool = WorkerPool::new(4, Duration::from_millis(100)).with_kill_grace(Duration::ZERO);
        let coordinator = BackupCoordinator::new(
            registry,
            ManifestStore::new(dir.path()),
            Arc::new(pool),
            CompressionCodec::new(Algorithm::Gzip, None),
            dir.path().join(".staging"),
        );

        let id = coordinator
            .create_backup(request(&[Engine::Relational, Engine::Cache], false))
            .await
            .unwrap();
        let set = coordinator.show_backup(&id).await.unwrap();

        let hung = set.engine_result(Engine::Relational).unwrap();
        assert_eq!(hung.status, EngineStatus::TimedOut);
        assert_eq!(hung.error_kind, Some(EngineErrorKind::Timeout));
        assert_eq!(set.engine_result(Engine::Cache).unwrap().status, EngineStatus::Success);
        assert_eq!(set.status(), BackupStatus::PartialFailure);
        assert_eq!(runner.calls_to("pg_dump").len(), 1);
    }

    #[tokio::test]
    async fn test_disk_exhaustion_skips_undispatched_engines() {
        let dir = TempDir::new().unwrap();
        let (coordinator, fakes) = coordinator(dir.path(), 1);
        fakes[&Engine::Relational].fail_dump(EngineErrorKind::DiskExhausted, "No space left on device");

        let id = coordinator
            .create_backup(BackupRequest::all_engines(BackupKind::Manual))
            .await
            .unwrap();
        let set = coordinator.show_backup(&id).await.unwrap();

        assert_eq!(set.status(), BackupStatus::Failed);
        assert_eq!(
            set.engine_result(Engine::Relational).unwrap().error_kind,
            Some(EngineErrorKind::DiskExhausted)
        );
        for engine in [Engine::VectorIndex, Engine::Graph, Engine::Cache] {
            assert_eq!(set.engine_result(engine).unwrap().status, EngineStatus::Skipped);
            assert_eq!(fakes[&engine].dump_calls(), 0);
        }
    }

    #[tokio::test]
    async fn test_list_backups_newest_first() {
        let dir = TempDir::new().unwrap();
        let (coordinator, _) = coordinator(dir.path(), 4);

        let first = coordinator.create_backup(request(&[Engine::Cache], false)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = coordinator.create_backup(request(&[Engine::Graph], false)).await.unwrap();

        let listing = coordinator.list_backups(&BackupFilter::default()).await.unwrap();
        let ids: Vec<&str> = listing.backups.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec![second.as_str(), first.as_str()]);
        assert!(listing.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_delete_backup_removes_directory() {
        let dir = TempDir::new().unwrap();
        let (coordinator, _) = coordinator(dir.path(), 4);
        let id = coordinator.create_backup(request(&[Engine::Cache], true)).await.unwrap();

        coordinator.delete_backup(&id).await.unwrap();
        assert!(!dir.path().join(&id).exists());
        assert!(matches!(
            coordinator.show_backup(&id).await.unwrap_err(),
            CoordinatorError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_health_check_reports_each_engine() {
        let dir = TempDir::new().unwrap();
        let (coordinator, fakes) = coordinator(dir.path(), 4);
        fakes[&Engine::Graph].set_healthy(false);

        let health = coordinator.health_check().await;
        assert_eq!(health.len(), 4);
        assert!(!health[&Engine::Graph]);
        assert!(health[&Engine::Relational]);
        assert!(health[&Engine::Cache]);
    }
}

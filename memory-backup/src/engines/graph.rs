//! Neo4j via `neo4j-admin database dump|load`.

use super::{classify_output, run_tool, Engine, EngineAdapter, RestoreOutcome, RetryPolicy};
use crate::config::GraphConfig;
use crate::tool::{ToolInvocation, ToolRunner};
use crate::utils::errors::EngineError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct GraphAdapter {
    config: GraphConfig,
    /// Scratch space for laying out `<database>.dump` the way `load` expects it
    staging_dir: PathBuf,
    runner: Arc<dyn ToolRunner>,
    retry: RetryPolicy,
}

impl GraphAdapter {
    pub fn new(
        config: GraphConfig,
        staging_dir: PathBuf,
        runner: Arc<dyn ToolRunner>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            config,
            staging_dir,
            runner,
            retry,
        }
    }

    fn dump_file_name(&self) -> String {
        format!("{}.dump", self.config.database)
    }

    fn admin(&self) -> ToolInvocation {
        ToolInvocation::new(&self.config.admin_tool)
    }
}

/// Hard link when possible, copy across filesystems.
async fn link_or_copy(src: &Path, dst: &Path) -> std::io::Result<()> {
    match tokio::fs::hard_link(src, dst).await {
        Ok(()) => Ok(()),
        Err(_) => tokio::fs::copy(src, dst).await.map(|_| ()),
    }
}

#[async_trait]
impl EngineAdapter for GraphAdapter {
    fn engine(&self) -> Engine {
        Engine::Graph
    }

    async fn dump(
        &self,
        target_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, EngineError> {
        let artifact = target_dir.join(Engine::Graph.artifact_name());
        let dump_dir = target_dir.join(".graph-dump");
        tokio::fs::create_dir_all(&dump_dir)
            .await
            .map_err(|e| EngineError::from_io(&e, "create graph dump directory"))?;

        info!(database = %self.config.database, "Dumping graph store");
        let invocation = self
            .admin()
            .args(["database", "dump"])
            .arg(self.config.database.clone())
            .arg(format!("--to-path={}", dump_dir.display()))
            .arg("--overwrite-destination=true");

        let result = self
            .retry
            .run(Engine::Graph, cancel, || {
                run_tool(self.runner.as_ref(), &invocation, cancel, classify_output)
            })
            .await;

        let moved = match result {
            Ok(_) => tokio::fs::rename(dump_dir.join(self.dump_file_name()), &artifact)
                .await
                .map_err(|e| EngineError::from_io(&e, "collect neo4j dump file")),
            Err(e) => Err(e),
        };

        if let Err(e) = tokio::fs::remove_dir_all(&dump_dir).await {
            debug!("Could not remove {}: {}", dump_dir.display(), e);
        }

        moved.map(|_| artifact)
    }

    async fn restore(
        &self,
        artifact: &Path,
        cancel: &CancellationToken,
    ) -> Result<RestoreOutcome, EngineError> {
        let load_dir = self
            .staging_dir
            .join(format!("graph-load-{}", uuid::Uuid::new_v4().simple()));
        tokio::fs::create_dir_all(&load_dir)
            .await
            .map_err(|e| EngineError::from_io(&e, "create graph load directory"))?;

        let staged = load_dir.join(self.dump_file_name());
        let result = match link_or_copy(artifact, &staged).await {
            Ok(()) => {
                info!(database = %self.config.database, "Loading graph store");
                let invocation = self
                    .admin()
                    .args(["database", "load"])
                    .arg(self.config.database.clone())
                    .arg(format!("--from-path={}", load_dir.display()))
                    .arg("--overwrite-destination=true");

                self.retry
                    .run(Engine::Graph, cancel, || {
                        run_tool(self.runner.as_ref(), &invocation, cancel, classify_output)
                    })
                    .await
                    .map(|_| ())
            }
            Err(e) => Err(EngineError::from_io(&e, "stage neo4j dump file")),
        };

        if let Err(e) = tokio::fs::remove_dir_all(&load_dir).await {
            warn!("Could not remove graph load directory {}: {}", load_dir.display(), e);
        }

        result.map(|_| RestoreOutcome {
            engine: Engine::Graph,
            detail: format!("database {} loaded", self.config.database),
        })
    }

    async fn health_check(&self) -> bool {
        let invocation = self.admin().args(["server", "status"]);
        match self.runner.run(&invocation, &CancellationToken::new()).await {
            Ok(output) => {
                output.success() && output.stdout.to_ascii_lowercase().contains("is running")
            }
            Err(e) => {
                debug!("Graph health check failed: {}", e);
                false
            }
        }
    }
}

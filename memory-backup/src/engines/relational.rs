//! PostgreSQL (with pgvector embeddings) via `pg_dump` / `pg_restore`.
//!
//! Dumps use the custom archive format, which is taken from a consistent MVCC
//! snapshot and is safe against a live database. Restores run inside a single
//! transaction so a failed restore leaves the database untouched.

use super::{classify_output, run_tool, Engine, EngineAdapter, RestoreOutcome, RetryPolicy};
use crate::config::RelationalConfig;
use crate::tool::{ToolInvocation, ToolRunner};
use crate::utils::errors::{EngineError, EngineErrorKind};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub struct RelationalAdapter {
    config: RelationalConfig,
    runner: Arc<dyn ToolRunner>,
    retry: RetryPolicy,
}

impl RelationalAdapter {
    pub fn new(config: RelationalConfig, runner: Arc<dyn ToolRunner>, retry: RetryPolicy) -> Self {
        Self {
            config,
            runner,
            retry,
        }
    }

    fn command(&self, program: &str) -> ToolInvocation {
        let invocation = ToolInvocation::new(program).args([
            "--host".to_string(),
            self.config.host.clone(),
            "--port".to_string(),
            self.config.port.to_string(),
            "--username".to_string(),
            self.config.user.clone(),
        ]);
        match &self.config.password {
            Some(password) => invocation.env("PGPASSWORD", password.clone()),
            None => invocation,
        }
    }

    fn dump_invocation(&self, artifact: &Path) -> ToolInvocation {
        self.command(&self.config.dump_tool)
            .args(["--format=custom", "--no-password", "--file"])
            .arg(artifact.to_string_lossy())
            .arg("--dbname")
            .arg(self.config.database.clone())
    }

    fn restore_invocation(&self, artifact: &Path) -> ToolInvocation {
        self.command(&self.config.restore_tool)
            .args([
                "--no-password",
                "--clean",
                "--if-exists",
                "--no-owner",
                "--single-transaction",
                "--exit-on-error",
                "--dbname",
            ])
            .arg(self.config.database.clone())
            .arg(artifact.to_string_lossy())
    }
}

#[async_trait]
impl EngineAdapter for RelationalAdapter {
    fn engine(&self) -> Engine {
        Engine::Relational
    }

    async fn dump(
        &self,
        target_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, EngineError> {
        let artifact = target_dir.join(Engine::Relational.artifact_name());
        let invocation = self.dump_invocation(&artifact);
        info!(database = %self.config.database, "Dumping relational store");

        self.retry
            .run(Engine::Relational, cancel, || {
                run_tool(self.runner.as_ref(), &invocation, cancel, classify_output)
            })
            .await?;

        if tokio::fs::metadata(&artifact).await.is_err() {
            return Err(EngineError::new(
                EngineErrorKind::Unknown,
                format!("{} reported success but wrote no archive", self.config.dump_tool),
            ));
        }

        Ok(artifact)
    }

    async fn restore(
        &self,
        artifact: &Path,
        cancel: &CancellationToken,
    ) -> Result<RestoreOutcome, EngineError> {
        let invocation = self.restore_invocation(artifact);
        info!(database = %self.config.database, "Restoring relational store");

        // Nothing is committed unless pg_restore finishes, so retrying is safe.
        self.retry
            .run(Engine::Relational, cancel, || {
                run_tool(self.runner.as_ref(), &invocation, cancel, classify_output)
            })
            .await?;

        Ok(RestoreOutcome {
            engine: Engine::Relational,
            detail: format!("database {} restored", self.config.database),
        })
    }

    async fn health_check(&self) -> bool {
        let invocation = self
            .command(&self.config.ready_tool)
            .arg("--dbname")
            .arg(self.config.database.clone());
        match self.runner.run(&invocation, &CancellationToken::new()).await {
            Ok(output) => output.success(),
            Err(e) => {
                debug!("Relational health check failed: {}", e);
                false
            }
        }
    }
}

//! Redis via `redis-cli`.
//!
//! `redis-cli --rdb` makes the server fork a point-in-time RDB snapshot and
//! streams it back, so dumping never blocks clients. Restoring swaps the RDB
//! file in the data directory and reloads it; if the reload fails the previous
//! file is put back and reloaded.

use super::{classify_message, run_tool, Engine, EngineAdapter, RestoreOutcome, RetryPolicy};
use crate::config::CacheConfig;
use crate::tool::{ToolInvocation, ToolOutput, ToolRunner};
use crate::utils::errors::{EngineError, EngineErrorKind};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct CacheAdapter {
    config: CacheConfig,
    runner: Arc<dyn ToolRunner>,
    retry: RetryPolicy,
}

impl CacheAdapter {
    pub fn new(config: CacheConfig, runner: Arc<dyn ToolRunner>, retry: RetryPolicy) -> Self {
        Self {
            config,
            runner,
            retry,
        }
    }

    fn cli(&self) -> ToolInvocation {
        let invocation = ToolInvocation::new(&self.config.cli_tool).args([
            "-h".to_string(),
            self.config.host.clone(),
            "-p".to_string(),
            self.config.port.to_string(),
        ]);
        // REDISCLI_AUTH keeps the password off the command line
        match &self.config.password {
            Some(password) => invocation.env("REDISCLI_AUTH", password.clone()),
            None => invocation,
        }
    }

    fn live_rdb(&self) -> PathBuf {
        self.config.data_dir.join(&self.config.db_filename)
    }

    fn previous_rdb(&self) -> PathBuf {
        self.config
            .data_dir
            .join(format!("{}.pre-restore", self.config.db_filename))
    }

    fn incoming_rdb(&self) -> PathBuf {
        self.config
            .data_dir
            .join(format!(".{}.incoming", self.config.db_filename))
    }

    async fn reload(&self, cancel: &CancellationToken) -> Result<(), EngineError> {
        let invocation = self.cli().args(["DEBUG", "RELOAD", "NOSAVE"]);
        let invocation = &invocation;
        let runner = self.runner.as_ref();
        self.retry
            .run(Engine::Cache, cancel, || async move {
                let output = run_tool(runner, invocation, cancel, classify_redis).await?;
                expect_reply(&output, "OK")
            })
            .await
    }

    /// Copy the artifact next to the live RDB so the final rename stays on one filesystem.
    async fn stage_incoming(&self, artifact: &Path) -> std::io::Result<()> {
        let incoming = self.incoming_rdb();
        let mut output = tokio::fs::File::create(&incoming).await?;
        let mut input = tokio::fs::File::open(artifact).await?;
        tokio::io::copy(&mut input, &mut output).await?;
        output.flush().await?;
        output.sync_all().await?;
        Ok(())
    }

    async fn swap_in(&self, artifact: &Path) -> Result<bool, EngineError> {
        let live = self.live_rdb();
        let previous = self.previous_rdb();

        self.stage_incoming(artifact)
            .await
            .map_err(|e| EngineError::from_io(&e, "stage RDB file"))?;

        let had_previous = tokio::fs::metadata(&live).await.is_ok();
        if had_previous {
            tokio::fs::copy(&live, &previous)
                .await
                .map_err(|e| EngineError::from_io(&e, "preserve current RDB file"))?;
        }

        tokio::fs::rename(self.incoming_rdb(), &live)
            .await
            .map_err(|e| EngineError::from_io(&e, "install RDB file"))?;
        Ok(had_previous)
    }

    /// Put the previous RDB file back and load it again, since the failed
    /// reload already flushed the server's memory.
    async fn roll_back(&self, had_previous: bool) -> Result<(), String> {
        let live = self.live_rdb();
        if !had_previous {
            return tokio::fs::remove_file(&live)
                .await
                .map_err(|e| format!("remove {}: {}", live.display(), e));
        }

        tokio::fs::rename(self.previous_rdb(), &live)
            .await
            .map_err(|e| format!("put back {}: {}", live.display(), e))?;
        // The restore's own token may already be cancelled.
        self.reload(&CancellationToken::new())
            .await
            .map_err(|e| format!("reload previous RDB: {}", e))?;
        warn!("Cache restore rolled back to the previous RDB file");
        Ok(())
    }
}

fn classify_redis(output: &ToolOutput) -> EngineErrorKind {
    let text = format!("{}\n{}", output.stderr, output.stdout).to_ascii_lowercase();
    if text.contains("wrongpass") || text.contains("not allowed") {
        EngineErrorKind::PermissionDenied
    } else if output.exit_code == Some(127) {
        EngineErrorKind::ToolMissing
    } else {
        classify_message(&text)
    }
}

/// redis-cli exits 0 on error replies, so the reply text is checked too.
fn expect_reply(output: &ToolOutput, expected: &str) -> Result<(), EngineError> {
    let reply = output.stdout.trim();
    if reply == expected {
        Ok(())
    } else {
        Err(EngineError::new(
            classify_redis(output),
            format!("unexpected reply from redis: {}", reply),
        ))
    }
}

#[async_trait]
impl EngineAdapter for CacheAdapter {
    fn engine(&self) -> Engine {
        Engine::Cache
    }

    async fn dump(
        &self,
        target_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, EngineError> {
        let artifact = target_dir.join(Engine::Cache.artifact_name());
        let invocation = self.cli().arg("--rdb").arg(artifact.to_string_lossy());
        info!(host = %self.config.host, port = self.config.port, "Saving cache snapshot");

        self.retry
            .run(Engine::Cache, cancel, || {
                run_tool(self.runner.as_ref(), &invocation, cancel, classify_redis)
            })
            .await?;

        Ok(artifact)
    }

    async fn restore(
        &self,
        artifact: &Path,
        cancel: &CancellationToken,
    ) -> Result<RestoreOutcome, EngineError> {
        info!(data_dir = %self.config.data_dir.display(), "Restoring cache from RDB");
        let had_previous = match self.swap_in(artifact).await {
            Ok(had_previous) => had_previous,
            Err(e) => {
                let _ = tokio::fs::remove_file(self.incoming_rdb()).await;
                return Err(e);
            }
        };

        match self.reload(cancel).await {
            Ok(()) => {
                if had_previous {
                    if let Err(e) = tokio::fs::remove_file(self.previous_rdb()).await {
                        debug!("Could not remove previous RDB copy: {}", e);
                    }
                }
                Ok(RestoreOutcome {
                    engine: Engine::Cache,
                    detail: format!("{} reloaded", self.config.db_filename),
                })
            }
            Err(e) => match self.roll_back(had_previous).await {
                Ok(()) => Err(e),
                Err(rollback) => {
                    error!("Cache restore rollback failed: {}", rollback);
                    Err(EngineError::new(
                        e.kind,
                        format!("{}; rollback failed: {}", e.message, rollback),
                    ))
                }
            },
        }
    }

    async fn health_check(&self) -> bool {
        let invocation = self.cli().arg("PING");
        match self.runner.run(&invocation, &CancellationToken::new()).await {
            Ok(output) => output.success() && output.stdout.trim() == "PONG",
            Err(e) => {
                debug!("Cache health check failed: {}", e);
                false
            }
        }
    }
}

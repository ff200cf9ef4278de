//! Qdrant collection snapshots over the HTTP API, driven through `curl`.
//!
//! Dump asks the server for a fresh collection snapshot, downloads it and then
//! deletes the server-side copy. Restore uploads the snapshot with
//! `priority=snapshot`; Qdrant only swaps the collection once recovery succeeds.

use super::{classify_message, run_tool, Engine, EngineAdapter, RestoreOutcome, RetryPolicy};
use crate::config::VectorIndexConfig;
use crate::tool::{ToolInvocation, ToolOutput, ToolRunner};
use crate::utils::errors::{EngineError, EngineErrorKind};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Deserialize)]
struct SnapshotReply {
    result: SnapshotDescription,
}

#[derive(Debug, Deserialize)]
struct SnapshotDescription {
    name: String,
    #[serde(default)]
    size: Option<u64>,
}

pub struct VectorIndexAdapter {
    config: VectorIndexConfig,
    runner: Arc<dyn ToolRunner>,
    retry: RetryPolicy,
}

impl VectorIndexAdapter {
    pub fn new(config: VectorIndexConfig, runner: Arc<dyn ToolRunner>, retry: RetryPolicy) -> Self {
        Self {
            config,
            runner,
            retry,
        }
    }

    fn collection_url(&self) -> String {
        format!(
            "{}/collections/{}",
            self.config.url.trim_end_matches('/'),
            self.config.collection
        )
    }

    fn request(&self, method: &str) -> ToolInvocation {
        let invocation = ToolInvocation::new(&self.config.http_tool)
            .args(["--silent", "--show-error", "--fail-with-body", "-X", method]);
        match &self.config.api_key {
            Some(key) => invocation.arg("-H").secret_arg(format!("api-key: {}", key)),
            None => invocation,
        }
    }

    async fn create_snapshot(&self, cancel: &CancellationToken) -> Result<SnapshotDescription, EngineError> {
        let invocation = self
            .request("POST")
            .arg(format!("{}/snapshots?wait=true", self.collection_url()));

        let output = self
            .retry
            .run(Engine::VectorIndex, cancel, || {
                run_tool(self.runner.as_ref(), &invocation, cancel, classify_curl)
            })
            .await?;

        let reply: SnapshotReply = serde_json::from_str(&output.stdout).map_err(|e| {
            EngineError::unknown(format!("unexpected snapshot reply from Qdrant: {}", e))
        })?;
        Ok(reply.result)
    }

    async fn delete_snapshot(&self, name: &str) {
        let invocation = self
            .request("DELETE")
            .arg(format!("{}/snapshots/{}", self.collection_url(), name));
        if let Err(e) = run_tool(
            self.runner.as_ref(),
            &invocation,
            &CancellationToken::new(),
            classify_curl,
        )
        .await
        {
            warn!(snapshot = %name, "Failed to delete server-side snapshot: {}", e);
        }
    }
}

/// curl exit codes first, then the shared stderr patterns.
fn classify_curl(output: &ToolOutput) -> EngineErrorKind {
    match output.exit_code {
        Some(6) | Some(7) => EngineErrorKind::ConnectionRefused,
        Some(28) => EngineErrorKind::Timeout,
        Some(127) => EngineErrorKind::ToolMissing,
        Some(22) if output.stderr.contains("401") || output.stderr.contains("403") => {
            EngineErrorKind::PermissionDenied
        }
        _ => classify_message(&output.stderr),
    }
}

#[async_trait]
impl EngineAdapter for VectorIndexAdapter {
    fn engine(&self) -> Engine {
        Engine::VectorIndex
    }

    async fn dump(
        &self,
        target_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, EngineError> {
        let artifact = target_dir.join(Engine::VectorIndex.artifact_name());
        info!(collection = %self.config.collection, "Creating vector index snapshot");

        let snapshot = self.create_snapshot(cancel).await?;
        debug!(snapshot = %snapshot.name, size = ?snapshot.size, "Snapshot created");

        let download = self
            .request("GET")
            .arg("--output")
            .arg(artifact.to_string_lossy())
            .arg(format!("{}/snapshots/{}", self.collection_url(), snapshot.name));

        let result = self
            .retry
            .run(Engine::VectorIndex, cancel, || {
                run_tool(self.runner.as_ref(), &download, cancel, classify_curl)
            })
            .await;

        self.delete_snapshot(&snapshot.name).await;
        result?;

        Ok(artifact)
    }

    async fn restore(
        &self,
        artifact: &Path,
        cancel: &CancellationToken,
    ) -> Result<RestoreOutcome, EngineError> {
        info!(collection = %self.config.collection, "Uploading vector index snapshot");
        let invocation = self
            .request("POST")
            .arg("-F")
            .arg(format!("snapshot=@{}", artifact.display()))
            .arg(format!(
                "{}/snapshots/upload?priority=snapshot&wait=true",
                self.collection_url()
            ));

        self.retry
            .run(Engine::VectorIndex, cancel, || {
                run_tool(self.runner.as_ref(), &invocation, cancel, classify_curl)
            })
            .await?;

        Ok(RestoreOutcome {
            engine: Engine::VectorIndex,
            detail: format!("collection {} recovered from snapshot", self.config.collection),
        })
    }

    async fn health_check(&self) -> bool {
        let invocation = self
            .request("GET")
            .arg(format!("{}/readyz", self.config.url.trim_end_matches('/')));
        match self.runner.run(&invocation, &CancellationToken::new()).await {
            Ok(output) => output.success(),
            Err(e) => {
                debug!("Vector index health check failed: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{arg_value, failed_output, ok_output, Reply, ScriptedRunner};
    use tempfile::TempDir;

    const SNAPSHOT_REPLY: &str =
        r#"{"result":{"name":"memories-2026.snapshot","creation_time":null,"size":42},"status":"ok","time":0.1}"#;

    fn adapter(runner: Arc<ScriptedRunner>, api_key: Option<&str>) -> VectorIndexAdapter {
        let config = VectorIndexConfig {
            api_key: api_key.map(str::to_string),
            ..VectorIndexConfig::default()
        };
        VectorIndexAdapter::new(config, runner, RetryPolicy::no_retry())
    }

    fn fake_qdrant(invocation: &ToolInvocation) -> Reply {
        let url = invocation.args.last().cloned().unwrap_or_default();
        if url.ends_with("/snapshots?wait=true") {
            ok_output(SNAPSHOT_REPLY)
        } else if let Some(path) = arg_value(invocation, "--output") {
            std::fs::write(path, b"qdrant snapshot bytes").unwrap();
            ok_output("")
        } else {
            ok_output(r#"{"result":true,"status":"ok"}"#)
        }
    }

    #[tokio::test]
    async fn test_dump_creates_downloads_and_deletes_snapshot() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("curl", fake_qdrant);

        let artifact = adapter(runner.clone(), Some("k3y"))
            .dump(dir.path(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(std::fs::read(&artifact).unwrap(), b"qdrant snapshot bytes");

        let calls = runner.calls_to("curl");
        assert_eq!(calls.len(), 3);
        assert!(calls[0].has_arg("POST"));
        assert!(calls[1]
            .args
            .last()
            .unwrap()
            .ends_with("/collections/memories/snapshots/memories-2026.snapshot"));
        assert!(calls[1].has_arg("api-key: k3y"));
        assert!(calls[2].has_arg("DELETE"));
        assert!(!calls[0].to_string().contains("k3y"));
    }

    #[tokio::test]
    async fn test_unparseable_snapshot_reply() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond("curl", 0, "<html>proxy error</html>", "");

        let err = adapter(runner, None)
            .dump(dir.path(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, EngineErrorKind::Unknown);
    }

    #[tokio::test]
    async fn test_curl_exit_codes_classified() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("curl", |_| failed_output(7, "curl: (7) Failed to connect to localhost port 6333"));

        let err = adapter(runner, None)
            .dump(dir.path(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, EngineErrorKind::ConnectionRefused);

        let denied = ToolOutput {
            exit_code: Some(22),
            stdout: String::new(),
            stderr: "curl: (22) The requested URL returned error: 403".to_string(),
        };
        assert_eq!(classify_curl(&denied), EngineErrorKind::PermissionDenied);
    }

    #[tokio::test]
    async fn test_restore_uploads_with_snapshot_priority() {
        let runner = Arc::new(ScriptedRunner::new());
        adapter(runner.clone(), None)
            .restore(Path::new("/staging/vector_index.archive"), &CancellationToken::new())
            .await
            .unwrap();

        let call = &runner.calls_to("curl")[0];
        assert!(call.has_arg("snapshot=@/staging/vector_index.archive"));
        assert!(call
            .args
            .last()
            .unwrap()
            .ends_with("/collections/memories/snapshots/upload?priority=snapshot&wait=true"));
    }
}

//! Engine adapters.
//!
//! Every store sits behind the same [`EngineAdapter`] contract and is looked up
//! by [`Engine`] name in an [`AdapterRegistry`], so the coordinators never
//! branch on which engine they are driving.

pub mod cache;
pub mod graph;
pub mod relational;
pub mod retry;
pub mod vector_index;

use crate::config::Config;
use crate::tool::{ToolError, ToolInvocation, ToolOutput, ToolRunner};
use crate::utils::errors::{CoordinatorError, EngineError, EngineErrorKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub use cache::CacheAdapter;
pub use graph::GraphAdapter;
pub use relational::RelationalAdapter;
pub use retry::RetryPolicy;
pub use vector_index::VectorIndexAdapter;

/// The four stores a backup set can cover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Engine {
    Relational,
    VectorIndex,
    Graph,
    Cache,
}

impl Engine {
    pub const ALL: [Engine; 4] = [
        Engine::Relational,
        Engine::VectorIndex,
        Engine::Graph,
        Engine::Cache,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Engine::Relational => "relational",
            Engine::VectorIndex => "vector_index",
            Engine::Graph => "graph",
            Engine::Cache => "cache",
        }
    }

    /// Uncompressed artifact file name inside a backup directory.
    pub fn artifact_name(self) -> String {
        format!("{}.archive", self.as_str())
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Engine {
    type Err = CoordinatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Engine::ALL
            .into_iter()
            .find(|engine| engine.as_str() == s.trim())
            .ok_or_else(|| CoordinatorError::UnknownEngine(s.to_string()))
    }
}

/// Result of a successful engine restore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreOutcome {
    pub engine: Engine,
    pub detail: String,
}

/// Capability set shared by all engines.
#[async_trait]
pub trait EngineAdapter: Send + Sync {
    fn engine(&self) -> Engine;

    /// Write one artifact for the live engine into `target_dir` and return its path.
    async fn dump(
        &self,
        target_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, EngineError>;

    /// Load `artifact` into the engine. Either the engine ends fully restored,
    /// or it is left in its prior state and an error is returned.
    async fn restore(
        &self,
        artifact: &Path,
        cancel: &CancellationToken,
    ) -> Result<RestoreOutcome, EngineError>;

    async fn health_check(&self) -> bool;
}

/// Engine name → adapter lookup.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<Engine, Arc<dyn EngineAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the four production adapters on top of one tool runner.
    pub fn from_config(config: &Config, runner: Arc<dyn ToolRunner>) -> Self {
        let retry = RetryPolicy::from_config(&config.retry);
        Self::new()
            .with_adapter(Arc::new(RelationalAdapter::new(
                config.relational.clone(),
                runner.clone(),
                retry.clone(),
            )))
            .with_adapter(Arc::new(VectorIndexAdapter::new(
                config.vector_index.clone(),
                runner.clone(),
                retry.clone(),
            )))
            .with_adapter(Arc::new(GraphAdapter::new(
                config.graph.clone(),
                config.staging_dir(),
                runner.clone(),
                retry.clone(),
            )))
            .with_adapter(Arc::new(CacheAdapter::new(
                config.cache.clone(),
                runner,
                retry,
            )))
    }

    pub fn with_adapter(mut self, adapter: Arc<dyn EngineAdapter>) -> Self {
        self.adapters.insert(adapter.engine(), adapter);
        self
    }

    pub fn get(&self, engine: Engine) -> Option<Arc<dyn EngineAdapter>> {
        self.adapters.get(&engine).cloned()
    }

    pub fn engines(&self) -> Vec<Engine> {
        let mut engines: Vec<Engine> = self.adapters.keys().copied().collect();
        engines.sort();
        engines
    }
}

/// Default mapping of a failed tool run onto the shared taxonomy.
pub fn classify_output(output: &ToolOutput) -> EngineErrorKind {
    match output.exit_code {
        Some(127) => return EngineErrorKind::ToolMissing,
        Some(126) => return EngineErrorKind::PermissionDenied,
        _ => {}
    }
    classify_message(&output.stderr)
}

/// Stderr pattern matching shared by all adapters.
pub fn classify_message(message: &str) -> EngineErrorKind {
    let message = message.to_ascii_lowercase();
    if message.contains("no space left on device") {
        EngineErrorKind::DiskExhausted
    } else if message.contains("connection refused")
        || message.contains("could not connect")
        || message.contains("failed to connect")
        || message.contains("unable to connect")
    {
        EngineErrorKind::ConnectionRefused
    } else if message.contains("timed out") || message.contains("timeout") {
        EngineErrorKind::Timeout
    } else if message.contains("permission denied")
        || message.contains("authentication failed")
        || message.contains("noauth")
        || message.contains("access denied")
        || message.contains("unauthorized")
    {
        EngineErrorKind::PermissionDenied
    } else if message.contains("command not found") {
        EngineErrorKind::ToolMissing
    } else {
        EngineErrorKind::Unknown
    }
}

/// Run one invocation and turn every non-success into an [`EngineError`].
pub(crate) async fn run_tool(
    runner: &dyn ToolRunner,
    invocation: &ToolInvocation,
    cancel: &CancellationToken,
    classify: fn(&ToolOutput) -> EngineErrorKind,
) -> Result<ToolOutput, EngineError> {
    match runner.run(invocation, cancel).await {
        Ok(output) if output.success() => Ok(output),
        Ok(output) => {
            let kind = classify(&output);
            let detail = output.stderr.trim();
            let detail = if detail.is_empty() {
                output.stdout.trim()
            } else {
                detail
            };
            Err(EngineError::new(
                kind,
                format!(
                    "{} exited with {}: {}",
                    invocation.program,
                    exit_label(output.exit_code),
                    last_line(detail)
                ),
            ))
        }
        Err(ToolError::Spawn { program, source }) => {
            let kind = match source.kind() {
                std::io::ErrorKind::NotFound => EngineErrorKind::ToolMissing,
                std::io::ErrorKind::PermissionDenied => EngineErrorKind::PermissionDenied,
                _ => EngineErrorKind::Unknown,
            };
            Err(EngineError::new(kind, format!("cannot run {}: {}", program, source)))
        }
        Err(e @ ToolError::Io { .. }) => Err(EngineError::unknown(e.to_string())),
        Err(e @ ToolError::Cancelled { .. }) => {
            Err(EngineError::new(EngineErrorKind::Timeout, e.to_string()))
        }
    }
}

fn exit_label(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("status {}", code),
        None => "a signal".to_string(),
    }
}

fn last_line(text: &str) -> &str {
    text.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("").trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedRunner;

    #[test]
    fn test_engine_names_round_trip() {
        for engine in Engine::ALL {
            assert_eq!(engine.as_str().parse::<Engine>().unwrap(), engine);
        }
        assert_eq!(Engine::VectorIndex.artifact_name(), "vector_index.archive");
    }

    #[test]
    fn test_unknown_engine_name() {
        let err = "elasticsearch".parse::<Engine>().unwrap_err();
        assert!(matches!(err, CoordinatorError::UnknownEngine(name) if name == "elasticsearch"));
    }

    #[test]
    fn test_classify_message() {
        assert_eq!(
            classify_message("pg_dump: error: connection to server failed: Connection refused"),
            EngineErrorKind::ConnectionRefused
        );
        assert_eq!(
            classify_message("FATAL: password authentication failed for user"),
            EngineErrorKind::PermissionDenied
        );
        assert_eq!(classify_message("operation timed out"), EngineErrorKind::Timeout);
        assert_eq!(
            classify_message("write failed: No space left on device"),
            EngineErrorKind::DiskExhausted
        );
        assert_eq!(classify_message("segfault"), EngineErrorKind::Unknown);
    }

    #[test]
    fn test_classify_exit_codes() {
        let missing = ToolOutput {
            exit_code: Some(127),
            ..Default::default()
        };
        assert_eq!(classify_output(&missing), EngineErrorKind::ToolMissing);

        let denied = ToolOutput {
            exit_code: Some(126),
            ..Default::default()
        };
        assert_eq!(classify_output(&denied), EngineErrorKind::PermissionDenied);
    }

    #[tokio::test]
    async fn test_run_tool_maps_spawn_not_found() {
        let runner = ScriptedRunner::new();
        runner.fail_spawn("pg_dump", std::io::ErrorKind::NotFound);

        let err = run_tool(
            &runner,
            &ToolInvocation::new("pg_dump"),
            &CancellationToken::new(),
            classify_output,
        )
        .await
        .unwrap_err();

        assert_eq!(err.kind, EngineErrorKind::ToolMissing);
    }

    #[tokio::test]
    async fn test_run_tool_reports_last_stderr_line() {
        let runner = ScriptedRunner::new();
        runner.respond("pg_restore", 1, "", "warning: ignored\nerror: could not connect to server\n");

        let err = run_tool(
            &runner,
            &ToolInvocation::new("pg_restore"),
            &CancellationToken::new(),
            classify_output,
        )
        .await
        .unwrap_err();

        assert_eq!(err.kind, EngineErrorKind::ConnectionRefused);
        assert!(err.message.ends_with("error: could not connect to server"));
    }

    #[test]
    fn test_registry_from_config_covers_all_engines() {
        let registry = AdapterRegistry::from_config(&Config::default(), Arc::new(ScriptedRunner::new()));
        assert_eq!(registry.engines(), Engine::ALL.to_vec());
        for engine in Engine::ALL {
            assert_eq!(registry.get(engine).unwrap().engine(), engine);
        }
    }
}

//! Narrow interface for running vendor dump/restore tools.
//!
//! Adapters only ever describe a [`ToolInvocation`]; the [`ToolRunner`] decides
//! how it is executed. Production uses [`process::ProcessRunner`], tests swap in
//! a scripted runner.

pub mod process;

use async_trait::async_trait;
use std::fmt;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub use process::ProcessRunner;

/// A single external tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    pub program: String,
    pub args: Vec<String>,
    /// Extra environment, typically credentials. Never logged.
    pub env: Vec<(String, String)>,
    /// Positions in `args` masked when the invocation is displayed
    redacted: Vec<usize>,
}

impl ToolInvocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            redacted: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Argument that carries a secret (e.g. an auth header).
    pub fn secret_arg(mut self, arg: impl Into<String>) -> Self {
        self.redacted.push(self.args.len());
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn has_arg(&self, needle: &str) -> bool {
        self.args.iter().any(|a| a == needle)
    }
}

impl fmt::Display for ToolInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for (i, arg) in self.args.iter().enumerate() {
            if self.redacted.contains(&i) {
                write!(f, " ***")?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

/// Captured result of a tool that ran to completion.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    /// `None` when the process was terminated by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error while running {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} was cancelled")]
    Cancelled { program: String },
}

#[async_trait]
pub trait ToolRunner: Send + Sync {
    /// Run the tool to completion. When `cancel` fires the process must be
    /// terminated before this returns [`ToolError::Cancelled`].
    async fn run(
        &self,
        invocation: &ToolInvocation,
        cancel: &CancellationToken,
    ) -> Result<ToolOutput, ToolError>;
}

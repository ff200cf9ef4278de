//! Test doubles shared by the unit tests.

use crate::engines::{AdapterRegistry, Engine, EngineAdapter, RestoreOutcome};
use crate::tool::{ToolError, ToolInvocation, ToolOutput, ToolRunner};
use crate::utils::errors::{EngineError, EngineErrorKind};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub enum Reply {
    Done(Result<ToolOutput, ToolError>),
    /// Block until cancelled.
    Hang,
}

type Handler = Arc<dyn Fn(&ToolInvocation) -> Reply + Send + Sync>;

/// Tool runner answering from per-program scripts and recording every call.
///
/// One-shot handlers queued with [`ScriptedRunner::once`] are consumed first,
/// then the persistent handler set with [`ScriptedRunner::on`]. Unscripted
/// programs succeed with empty output.
#[derive(Default)]
pub struct ScriptedRunner {
    queued: Mutex<HashMap<String, VecDeque<Handler>>>,
    persistent: Mutex<HashMap<String, Handler>>,
    calls: Mutex<Vec<ToolInvocation>>,
}

pub fn ok_output(stdout: &str) -> Reply {
    Reply::Done(Ok(ToolOutput {
        exit_code: Some(0),
        stdout: stdout.to_string(),
        stderr: String::new(),
    }))
}

pub fn failed_output(exit_code: i32, stderr: &str) -> Reply {
    Reply::Done(Ok(ToolOutput {
        exit_code: Some(exit_code),
        stdout: String::new(),
        stderr: stderr.to_string(),
    }))
}

/// Value following `flag` in the argument list, or the `flag=value` form.
pub fn arg_value(invocation: &ToolInvocation, flag: &str) -> Option<String> {
    let prefix = format!("{}=", flag);
    let mut args = invocation.args.iter();
    while let Some(arg) = args.next() {
        if arg == flag {
            return args.next().cloned();
        }
        if let Some(value) = arg.strip_prefix(&prefix) {
            return Some(value.to_string());
        }
    }
    None
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(&self, program: &str, handler: F)
    where
        F: Fn(&ToolInvocation) -> Reply + Send + Sync + 'static,
    {
        self.persistent
            .lock()
            .unwrap()
            .insert(program.to_string(), Arc::new(handler));
    }

    pub fn once<F>(&self, program: &str, handler: F)
    where
        F: Fn(&ToolInvocation) -> Reply + Send + Sync + 'static,
    {
        self.queued
            .lock()
            .unwrap()
            .entry(program.to_string())
            .or_default()
            .push_back(Arc::new(handler));
    }

    pub fn respond(&self, program: &str, exit_code: i32, stdout: &str, stderr: &str) {
        let stdout = stdout.to_string();
        let stderr = stderr.to_string();
        self.on(program, move |_| {
            Reply::Done(Ok(ToolOutput {
                exit_code: Some(exit_code),
                stdout: stdout.clone(),
                stderr: stderr.clone(),
            }))
        });
    }

    pub fn fail_spawn(&self, program: &str, kind: std::io::ErrorKind) {
        let name = program.to_string();
        self.on(program, move |_| {
            Reply::Done(Err(ToolError::Spawn {
                program: name.clone(),
                source: std::io::Error::from(kind),
            }))
        });
    }

    pub fn calls(&self) -> Vec<ToolInvocation> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, program: &str) -> Vec<ToolInvocation> {
        self.calls()
            .into_iter()
            .filter(|c| c.program == program)
            .collect()
    }

    fn handler_for(&self, program: &str) -> Option<Handler> {
        if let Some(handler) = self
            .queued
            .lock()
            .unwrap()
            .get_mut(program)
            .and_then(|q| q.pop_front())
        {
            return Some(handler);
        }
        self.persistent.lock().unwrap().get(program).cloned()
    }
}

#[async_trait]
impl ToolRunner for ScriptedRunner {
    async fn run(
        &self,
        invocation: &ToolInvocation,
        cancel: &CancellationToken,
    ) -> Result<ToolOutput, ToolError> {
        self.calls.lock().unwrap().push(invocation.clone());

        let reply = match self.handler_for(&invocation.program) {
            Some(handler) => handler(invocation),
            None => ok_output(""),
        };

        match reply {
            Reply::Done(result) => result,
            Reply::Hang => {
                cancel.cancelled().await;
                Err(ToolError::Cancelled {
                    program: invocation.program.clone(),
                })
            }
        }
    }
}

/// In-memory engine: its "live state" is a byte buffer that dump copies out
/// and restore replaces.
pub struct FakeAdapter {
    engine: Engine,
    state: Mutex<Vec<u8>>,
    dump_failure: Mutex<Option<EngineError>>,
    restore_failure: Mutex<Option<EngineError>>,
    dump_delay: Mutex<Duration>,
    healthy: AtomicBool,
    dump_calls: AtomicUsize,
    restore_calls: AtomicUsize,
}

impl FakeAdapter {
    pub fn new(engine: Engine, contents: &[u8]) -> Arc<Self> {
        Arc::new(Self {
            engine,
            state: Mutex::new(contents.to_vec()),
            dump_failure: Mutex::new(None),
            restore_failure: Mutex::new(None),
            dump_delay: Mutex::new(Duration::ZERO),
            healthy: AtomicBool::new(true),
            dump_calls: AtomicUsize::new(0),
            restore_calls: AtomicUsize::new(0),
        })
    }

    pub fn fail_dump(&self, kind: EngineErrorKind, message: &str) {
        *self.dump_failure.lock().unwrap() = Some(EngineError::new(kind, message));
    }

    pub fn fail_restore(&self, kind: EngineErrorKind, message: &str) {
        *self.restore_failure.lock().unwrap() = Some(EngineError::new(kind, message));
    }

    pub fn delay_dump(&self, delay: Duration) {
        *self.dump_delay.lock().unwrap() = delay;
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn contents(&self) -> Vec<u8> {
        self.state.lock().unwrap().clone()
    }

    pub fn set_contents(&self, contents: &[u8]) {
        *self.state.lock().unwrap() = contents.to_vec();
    }

    pub fn dump_calls(&self) -> usize {
        self.dump_calls.load(Ordering::SeqCst)
    }

    pub fn restore_calls(&self) -> usize {
        self.restore_calls.load(Ordering::SeqCst)
    }
}

async fn pause(delay: Duration, cancel: &CancellationToken) -> Result<(), EngineError> {
    if delay.is_zero() {
        return Ok(());
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => Ok(()),
        _ = cancel.cancelled() => Err(EngineError::new(EngineErrorKind::Timeout, "cancelled")),
    }
}

#[async_trait]
impl EngineAdapter for FakeAdapter {
    fn engine(&self) -> Engine {
        self.engine
    }

    async fn dump(
        &self,
        target_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, EngineError> {
        self.dump_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.dump_delay.lock().unwrap();
        pause(delay, cancel).await?;

        let failure = self.dump_failure.lock().unwrap().clone();
        if let Some(err) = failure {
            return Err(err);
        }

        let path = target_dir.join(self.engine.artifact_name());
        let contents = self.contents();
        tokio::fs::write(&path, &contents)
            .await
            .map_err(|e| EngineError::from_io(&e, "write artifact"))?;
        Ok(path)
    }

    async fn restore(
        &self,
        artifact: &Path,
        cancel: &CancellationToken,
    ) -> Result<RestoreOutcome, EngineError> {
        self.restore_calls.fetch_add(1, Ordering::SeqCst);
        if cancel.is_cancelled() {
            return Err(EngineError::new(EngineErrorKind::Timeout, "cancelled"));
        }

        let failure = self.restore_failure.lock().unwrap().clone();
        if let Some(err) = failure {
            return Err(err);
        }

        let contents = tokio::fs::read(artifact)
            .await
            .map_err(|e| EngineError::from_io(&e, "read artifact"))?;
        self.set_contents(&contents);
        Ok(RestoreOutcome {
            engine: self.engine,
            detail: format!("loaded {} bytes", contents.len()),
        })
    }

    async fn health_check(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}

/// One fake adapter per engine, each seeded with distinct contents.
pub fn fake_registry() -> (AdapterRegistry, HashMap<Engine, Arc<FakeAdapter>>) {
    let mut registry = AdapterRegistry::new();
    let mut fakes = HashMap::new();
    for engine in Engine::ALL {
        let contents = format!("{} live state: {}", engine, "memory ".repeat(64));
        let fake = FakeAdapter::new(engine, contents.as_bytes());
        registry = registry.with_adapter(fake.clone());
        fakes.insert(engine, fake);
    }
    (registry, fakes)
}

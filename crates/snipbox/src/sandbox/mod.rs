//! Isolation contexts
//!
//! An isolation context is the boundary a compiled snippet runs inside. Each
//! request gets a fresh one from a [`ContextFactory`], and the supervisor
//! destroys it when the request ends, whichever way it ends.
//!
//! [`IsolationContext::destroy`] is the only way a running snippet is ever
//! stopped. It has to work while the program is still running, from a thread
//! other than the one waiting on the program, and it has to be safe to call
//! more than once.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use thiserror::Error;
use tokio::io::AsyncReadExt;

use crate::config::{Backend, Config};
use crate::isolate::{IsolateContext, IsolateError, IsolateFactory};
use crate::types::CompiledArtifact;

pub use crate::sandbox::process::{ProcessContext, ProcessFactory};

mod process;
pub(crate) mod slot;

/// File name the artifact is loaded under inside a context
pub const PROGRAM_NAME: &str = "program";

/// File name of the result slot the entry point writes its value to
pub const RESULT_NAME: &str = "result.txt";

/// File name the program's stderr is captured in
pub const STDERR_NAME: &str = "stderr.txt";

/// Upper bound on how much of a program's stderr is kept
pub const MAX_STDERR_BYTES: usize = 64 * 1024;

/// Upper bound on how much of the result slot is kept
pub const MAX_RESULT_BYTES: usize = 1024 * 1024;

/// Errors raised by isolation contexts
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("failed to create isolation context: {0}")]
    CreateFailed(String),

    #[error("isolation context has been destroyed")]
    Destroyed,

    #[error("no artifact has been loaded")]
    NotLoaded,

    #[error("failed to start program: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error("failed to tear down isolation context: {0}")]
    TeardownFailed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("isolate error: {0}")]
    Isolate(#[from] IsolateError),
}

/// How a program inside a context ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitKind {
    /// Exited with a status code
    Code(i32),
    /// Killed by a signal
    Signal(i32),
    /// Stopped by the sandbox itself, with its explanation
    Killed(String),
}

/// Raw result of invoking a loaded program
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub exit: ExitKind,

    /// Contents of the result slot, if the program wrote one
    pub result: Option<Vec<u8>>,

    /// Captured stderr, truncated to [`MAX_STDERR_BYTES`]
    pub stderr: Vec<u8>,
}

/// An execution boundary for a single request
pub trait IsolationContext: Send + Sync + 'static {
    /// Place the artifact inside the context
    fn load(
        &self,
        artifact: CompiledArtifact,
    ) -> impl Future<Output = Result<(), SandboxError>> + Send;

    /// Run the loaded artifact's entry point and wait for it to exit
    ///
    /// Returns [`SandboxError::Destroyed`] if the context is destroyed while
    /// the program is running.
    fn invoke(&self) -> impl Future<Output = Result<Invocation, SandboxError>> + Send;

    /// Forcibly destroy the context, terminating anything running inside
    ///
    /// Idempotent: only the first successful call does any work. A failed
    /// call leaves the context live so it can be retried.
    fn destroy(&self) -> impl Future<Output = Result<(), SandboxError>> + Send;

    /// Whether [`destroy`](Self::destroy) has completed
    fn is_destroyed(&self) -> bool;
}

/// Creates one fresh [`IsolationContext`] per request
pub trait ContextFactory: Send + Sync {
    type Context: IsolationContext;

    fn create(&self) -> impl Future<Output = Result<Self::Context, SandboxError>> + Send;

    /// Number of contexts created and not yet destroyed
    fn live_contexts(&self) -> usize;
}

/// Counter of contexts that have been created and not yet destroyed
#[derive(Debug, Clone, Default)]
pub struct LiveContexts {
    count: Arc<AtomicUsize>,
}

impl LiveContexts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Register a new live context; dropping the token releases it
    pub fn track(&self) -> LiveToken {
        self.count.fetch_add(1, Ordering::SeqCst);
        LiveToken {
            count: Arc::clone(&self.count),
        }
    }
}

/// Held by a context for as long as it is live
#[derive(Debug)]
pub struct LiveToken {
    count: Arc<AtomicUsize>,
}

impl Drop for LiveToken {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Factory for whichever backend the configuration selects
#[derive(Debug)]
pub enum SandboxFactory {
    Process(ProcessFactory),
    Isolate(IsolateFactory),
}

impl SandboxFactory {
    pub fn from_config(config: &Config) -> Self {
        match config.sandbox.backend {
            Backend::Process => {
                SandboxFactory::Process(ProcessFactory::new(config.sandbox.scratch_dir.clone()))
            }
            Backend::Isolate => SandboxFactory::Isolate(IsolateFactory::from_config(config)),
        }
    }
}

/// Context created by a [`SandboxFactory`]
#[derive(Debug)]
pub enum SandboxContext {
    Process(ProcessContext),
    Isolate(IsolateContext),
}

impl ContextFactory for SandboxFactory {
    type Context = SandboxContext;

    async fn create(&self) -> Result<SandboxContext, SandboxError> {
        match self {
            SandboxFactory::Process(factory) => factory.create().await.map(SandboxContext::Process),
            SandboxFactory::Isolate(factory) => factory.create().await.map(SandboxContext::Isolate),
        }
    }

    fn live_contexts(&self) -> usize {
        match self {
            SandboxFactory::Process(factory) => factory.live_contexts(),
            SandboxFactory::Isolate(factory) => factory.live_contexts(),
        }
    }
}

impl IsolationContext for SandboxContext {
    async fn load(&self, artifact: CompiledArtifact) -> Result<(), SandboxError> {
        match self {
            SandboxContext::Process(context) => context.load(artifact).await,
            SandboxContext::Isolate(context) => context.load(artifact).await,
        }
    }

    async fn invoke(&self) -> Result<Invocation, SandboxError> {
        match self {
            SandboxContext::Process(context) => context.invoke().await,
            SandboxContext::Isolate(context) => context.invoke().await,
        }
    }

    async fn destroy(&self) -> Result<(), SandboxError> {
        match self {
            SandboxContext::Process(context) => context.destroy().await,
            SandboxContext::Isolate(context) => context.destroy().await,
        }
    }

    fn is_destroyed(&self) -> bool {
        match self {
            SandboxContext::Process(context) => context.is_destroyed(),
            SandboxContext::Isolate(context) => context.is_destroyed(),
        }
    }
}

/// Read the first `limit` bytes of the file at `path`, `None` if it does not exist
///
/// The rest of the file is never read, however much the program wrote.
pub(crate) async fn read_capped(path: &Path, limit: usize) -> std::io::Result<Option<Vec<u8>>> {
    let file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };

    let mut content = Vec::new();
    file.take(limit as u64).read_to_end(&mut content).await?;
    Ok(Some(content))
}

//! The compile-and-execute pipeline
//!
//! [`Executor`] ties the stages together: validate, synthesize, compile,
//! create a context, run under supervision, normalize. Each stage
//! short-circuits to the normalizer on failure, so the public entry points
//! always produce a displayable string.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, instrument};

pub use crate::runner::compile::Compiler;
pub use crate::runner::load::{RunOutcome, load_and_run};
pub use crate::runner::normalize::normalize;
pub use crate::runner::supervise::{Supervised, Supervisor, SupervisorState};
pub use crate::runner::synthesize::{SNIPPET_BINDING, SNIPPET_PLACEHOLDER, synthesize};

mod compile;
mod load;
mod normalize;
mod supervise;
mod synthesize;

use crate::config::Config;
use crate::sandbox::{ContextFactory, SandboxFactory};
use crate::types::{Diagnostic, ExecutionResult};
use crate::validate::{SourcePolicy, Validator};

/// Errors that occur during compilation
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("compilation failed with {} error(s)", .0.len())]
    Diagnostics(Vec<Diagnostic>),

    #[error("compiler reported success but produced an empty executable")]
    EmitEmpty,

    #[error("compilation timed out after {0:?}")]
    Timeout(Duration),

    #[error("failed to run compiler: {0}")]
    Toolchain(#[source] std::io::Error),
}

/// Runs snippets end to end
///
/// Cheap to share: wrap it in an `Arc` and call it from as many tasks as
/// needed. Every request gets its own compile directory, context and worker
/// thread.
#[derive(Debug)]
pub struct Executor<F = SandboxFactory, V = SourcePolicy> {
    config: Arc<Config>,
    factory: F,
    validator: V,
    compiler: Compiler,
    supervisor: Supervisor,
}

impl Executor {
    /// Executor with the configured backend and the default [`SourcePolicy`]
    pub fn new(config: impl Into<Arc<Config>>) -> Self {
        let config = config.into();
        let factory = SandboxFactory::from_config(&config);
        let validator = SourcePolicy::from_config(&config);
        Self::with_parts(config, factory, validator)
    }
}

impl<F: ContextFactory, V: Validator> Executor<F, V> {
    /// Executor with a caller-supplied context factory and validator
    pub fn with_parts(config: impl Into<Arc<Config>>, factory: F, validator: V) -> Self {
        let config = config.into();
        Self {
            compiler: Compiler::from_config(&config.compiler),
            supervisor: Supervisor::new(config.timeout()),
            config,
            factory,
            validator,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// Contexts created by this executor and not yet destroyed
    pub fn live_contexts(&self) -> usize {
        self.factory.live_contexts()
    }

    /// Run `snippet` and return the display text for its outcome
    pub async fn execute(&self, snippet: &str) -> String {
        normalize(&self.evaluate(snippet).await)
    }

    /// [`execute`](Self::execute) for synchronous callers
    ///
    /// Runs on a scoped thread with its own runtime, so it is safe to call
    /// from inside or outside an async context.
    pub fn execute_blocking(&self, snippet: &str) -> String {
        std::thread::scope(|scope| {
            let handle = scope.spawn(|| {
                tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .map(|runtime| runtime.block_on(self.execute(snippet)))
            });
            let result = match handle.join() {
                Ok(Ok(text)) => return text,
                Ok(Err(e)) => ExecutionResult::SupervisionFault(format!(
                    "failed to start runtime: {e}"
                )),
                Err(_) => {
                    ExecutionResult::SupervisionFault("executor thread panicked".to_string())
                }
            };
            normalize(&result)
        })
    }

    /// Run `snippet` and return the typed outcome
    #[instrument(skip_all, fields(len = snippet.len()))]
    pub async fn evaluate(&self, snippet: &str) -> ExecutionResult {
        let result = self.pipeline(snippet).await;
        debug!(
            kind = result.kind(),
            live = self.factory.live_contexts(),
            "execution finished"
        );
        result
    }

    async fn pipeline(&self, snippet: &str) -> ExecutionResult {
        if !self.validator.validate(snippet) {
            return ExecutionResult::Rejected;
        }

        let unit = synthesize(snippet, &self.config.namespaces);

        let artifact = match self.compiler.compile(&unit).await {
            Ok(artifact) => artifact,
            Err(CompileError::Diagnostics(diagnostics)) => {
                return ExecutionResult::CompileError(diagnostics);
            }
            Err(CompileError::EmitEmpty) => return ExecutionResult::EmitEmpty,
            Err(e @ (CompileError::Timeout(_) | CompileError::Toolchain(_))) => {
                return ExecutionResult::SupervisionFault(e.to_string());
            }
        };
        debug!(len = artifact.len(), "compiled");

        let context = match self.factory.create().await {
            Ok(context) => context,
            Err(e) => return ExecutionResult::SupervisionFault(e.to_string()),
        };

        match self.supervisor.run(context, artifact).await {
            Supervised::Completed(RunOutcome::Value(value)) => ExecutionResult::Value(value),
            Supervised::Completed(RunOutcome::Fault(message)) => {
                ExecutionResult::RuntimeFault(message)
            }
            Supervised::TimedOut => ExecutionResult::Timeout(self.supervisor.deadline()),
            Supervised::Faulted(message) => ExecutionResult::SupervisionFault(message),
        }
    }
}

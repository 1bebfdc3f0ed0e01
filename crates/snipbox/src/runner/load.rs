//! Artifact loading and invocation

use tracing::{debug, instrument};

use crate::sandbox::{ExitKind, Invocation, IsolationContext};
use crate::types::CompiledArtifact;

/// What running a snippet inside a context produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Clean exit; `None` when the result slot was empty or never written
    Value(Option<String>),
    Fault(String),
}

/// Load `artifact` into `context`, run it and collect the outcome
///
/// Infallible: anything that goes wrong, in the program or in the context,
/// becomes [`RunOutcome::Fault`].
#[instrument(skip_all, fields(len = artifact.len()))]
pub async fn load_and_run<C: IsolationContext>(
    context: &C,
    artifact: CompiledArtifact,
) -> RunOutcome {
    if let Err(e) = context.load(artifact).await {
        debug!(error = %e, "load failed");
        return RunOutcome::Fault(e.to_string());
    }

    match context.invoke().await {
        Ok(invocation) => outcome(invocation),
        Err(e) => {
            debug!(error = %e, "invoke failed");
            RunOutcome::Fault(e.to_string())
        }
    }
}

fn outcome(invocation: Invocation) -> RunOutcome {
    match invocation.exit {
        ExitKind::Code(0) => {
            let value = invocation
                .result
                .filter(|bytes| !bytes.is_empty())
                .map(|bytes| String::from_utf8_lossy(&bytes).into_owned());
            RunOutcome::Value(value)
        }
        ExitKind::Code(code) => {
            let stderr = String::from_utf8_lossy(&invocation.stderr);
            let stderr = stderr.trim();
            if stderr.is_empty() {
                RunOutcome::Fault(format!("process exited with status {code}"))
            } else {
                RunOutcome::Fault(stderr.to_string())
            }
        }
        ExitKind::Signal(signal) => RunOutcome::Fault(format!("terminated by signal {signal}")),
        ExitKind::Killed(message) => RunOutcome::Fault(message),
    }
}

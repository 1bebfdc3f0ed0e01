//! The running-program slot shared by the context backends
//!
//! A context's program is started into the slot by the worker and waited on
//! by polling, so the lock is never held across an await. Teardown takes the
//! child out of the slot and kills it; the waiting worker then finds the slot
//! empty and reports [`SandboxError::Destroyed`].

use std::process::ExitStatus;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::sandbox::SandboxError;

/// How often a running program is checked for exit
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// How long teardown waits for a killed program to be reaped
const REAP_GRACE: Duration = Duration::from_secs(1);

/// Attempts made to start a freshly written program
const SPAWN_ATTEMPTS: u32 = 5;

/// `ETXTBSY`: a concurrently forked process still holds the program open for writing
const TEXT_FILE_BUSY: i32 = 26;

#[derive(Debug, Default)]
struct SlotState {
    child: Option<Child>,
    /// Set by teardown; no program may start afterwards
    terminated: bool,
}

#[derive(Debug, Default)]
pub(crate) struct ProgramSlot {
    state: Mutex<SlotState>,
}

impl ProgramSlot {
    /// Start `command` unless the slot has been terminated
    ///
    /// `build` is called once per attempt; a program that was just written
    /// can briefly fail to start with `ETXTBSY`, which is retried.
    pub(crate) async fn start(
        &self,
        mut build: impl FnMut() -> Result<Command, SandboxError>,
    ) -> Result<(), SandboxError> {
        let mut attempt = 1;
        loop {
            match self.try_start(build()?) {
                Ok(()) => return Ok(()),
                Err(SandboxError::SpawnFailed(e))
                    if e.raw_os_error() == Some(TEXT_FILE_BUSY) && attempt < SPAWN_ATTEMPTS =>
                {
                    debug!(attempt, "program busy, retrying spawn");
                    attempt += 1;
                    tokio::time::sleep(POLL_INTERVAL * attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn try_start(&self, mut command: Command) -> Result<(), SandboxError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.terminated {
            return Err(SandboxError::Destroyed);
        }

        let child = command
            .kill_on_drop(true)
            .spawn()
            .map_err(SandboxError::SpawnFailed)?;
        debug!(pid = ?child.id(), "program started");
        state.child = Some(child);
        Ok(())
    }

    /// Wait for the running program to exit
    pub(crate) async fn wait(&self) -> Result<ExitStatus, SandboxError> {
        loop {
            {
                let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
                let Some(child) = state.child.as_mut() else {
                    return Err(SandboxError::Destroyed);
                };
                if let Some(status) = child.try_wait()? {
                    state.child = None;
                    return Ok(status);
                }
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Kill the running program, if any, and refuse to start new ones
    pub(crate) async fn terminate(&self) {
        let child = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.terminated = true;
            state.child.take()
        };
        let Some(mut child) = child else {
            return;
        };

        if let Err(e) = child.start_kill() {
            // InvalidInput means the child already exited
            if e.kind() != std::io::ErrorKind::InvalidInput {
                warn!(error = %e, "failed to kill program");
            }
        }
        match tokio::time::timeout(REAP_GRACE, child.wait()).await {
            Ok(Ok(status)) => debug!(?status, "program killed"),
            Ok(Err(e)) => warn!(error = %e, "failed to reap killed program"),
            Err(_) => warn!("killed program not reaped within grace period"),
        }
    }
}

//! Process-backed isolation contexts
//!
//! Each context is a throwaway directory plus, while the snippet runs, one
//! child process. The child starts with an empty environment and no stdin or
//! stdout. Destroying the context kills the child and removes the directory.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use tempfile::TempDir;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use crate::sandbox::slot::ProgramSlot;
use crate::sandbox::{
    ContextFactory, ExitKind, Invocation, IsolationContext, LiveContexts, LiveToken,
    MAX_RESULT_BYTES, MAX_STDERR_BYTES, PROGRAM_NAME, RESULT_NAME, STDERR_NAME, SandboxError,
    read_capped,
};
use crate::types::CompiledArtifact;

/// Creates [`ProcessContext`]s under a scratch directory
#[derive(Debug)]
pub struct ProcessFactory {
    /// Parent directory for context directories (system temp if `None`)
    root: Option<PathBuf>,
    live: LiveContexts,
    next_id: AtomicU64,
}

impl ProcessFactory {
    pub fn new(root: Option<PathBuf>) -> Self {
        Self {
            root,
            live: LiveContexts::new(),
            next_id: AtomicU64::new(0),
        }
    }
}

impl Default for ProcessFactory {
    fn default() -> Self {
        Self::new(None)
    }
}

impl ContextFactory for ProcessFactory {
    type Context = ProcessContext;

    #[instrument(skip(self))]
    async fn create(&self) -> Result<ProcessContext, SandboxError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut builder = tempfile::Builder::new();
        builder.prefix("snipbox-ctx-");
        let dir = match &self.root {
            Some(root) => builder.tempdir_in(root),
            None => builder.tempdir(),
        }
        .map_err(|e| SandboxError::CreateFailed(e.to_string()))?;

        debug!(id, path = %dir.path().display(), "created process context");

        Ok(ProcessContext {
            id,
            path: dir.path().to_path_buf(),
            dir: Mutex::new(Some(dir)),
            slot: ProgramSlot::default(),
            loaded: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            teardown: tokio::sync::Mutex::new(()),
            live: Mutex::new(Some(self.live.track())),
        })
    }

    fn live_contexts(&self) -> usize {
        self.live.count()
    }
}

/// A context backed by a child process in its own directory
#[derive(Debug)]
pub struct ProcessContext {
    id: u64,
    path: PathBuf,
    dir: Mutex<Option<TempDir>>,
    slot: ProgramSlot,
    loaded: AtomicBool,
    destroyed: AtomicBool,
    /// Serializes teardown so only one caller does the physical destroy
    teardown: tokio::sync::Mutex<()>,
    live: Mutex<Option<LiveToken>>,
}

impl ProcessContext {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Host path of the context directory
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn command(&self) -> Result<Command, SandboxError> {
        let stderr = std::fs::File::create(self.path.join(STDERR_NAME))?;
        let mut command = Command::new(self.path.join(PROGRAM_NAME));
        command
            .arg(self.path.join(RESULT_NAME))
            .current_dir(&self.path)
            .env_clear()
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(stderr));
        Ok(command)
    }

    async fn read_optional(
        &self,
        name: &str,
        limit: usize,
    ) -> Result<Option<Vec<u8>>, SandboxError> {
        Ok(read_capped(&self.path.join(name), limit).await?)
    }
}

impl IsolationContext for ProcessContext {
    #[instrument(skip(self, artifact), fields(id = self.id, len = artifact.len()))]
    async fn load(&self, artifact: CompiledArtifact) -> Result<(), SandboxError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(SandboxError::Destroyed);
        }

        let program = self.path.join(PROGRAM_NAME);
        tokio::fs::write(&program, artifact.as_bytes()).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&program, std::fs::Permissions::from_mode(0o755)).await?;
        }

        self.loaded.store(true, Ordering::SeqCst);
        debug!("artifact loaded");
        Ok(())
    }

    #[instrument(skip(self), fields(id = self.id))]
    async fn invoke(&self) -> Result<Invocation, SandboxError> {
        if !self.loaded.load(Ordering::SeqCst) {
            return Err(SandboxError::NotLoaded);
        }

        self.slot.start(|| self.command()).await?;
        let status = self.slot.wait().await?;

        let result = self.read_optional(RESULT_NAME, MAX_RESULT_BYTES).await?;
        let stderr = self
            .read_optional(STDERR_NAME, MAX_STDERR_BYTES)
            .await?
            .unwrap_or_default();

        debug!(?status, has_result = result.is_some(), "program exited");

        Ok(Invocation {
            exit: exit_kind(status),
            result,
            stderr,
        })
    }

    #[instrument(skip(self), fields(id = self.id))]
    async fn destroy(&self) -> Result<(), SandboxError> {
        let _teardown = self.teardown.lock().await;
        if self.destroyed.load(Ordering::SeqCst) {
            return Ok(());
        }

        self.slot.terminate().await;

        match tokio::fs::remove_dir_all(&self.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(SandboxError::TeardownFailed(format!(
                    "failed to remove {}: {e}",
                    self.path.display()
                )));
            }
        }

        // The directory is already gone; dropping the TempDir is a no-op
        self.dir
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.destroyed.store(true, Ordering::SeqCst);
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        debug!("process context destroyed");
        Ok(())
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

impl Drop for ProcessContext {
    fn drop(&mut self) {
        if !self.destroyed.load(Ordering::SeqCst) {
            // The child is killed by kill_on_drop and the directory by TempDir
            warn!(
                id = self.id,
                path = %self.path.display(),
                "ProcessContext dropped without explicit destroy"
            );
        }
    }
}

fn exit_kind(status: ExitStatus) -> ExitKind {
    if let Some(code) = status.code() {
        return ExitKind::Code(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return ExitKind::Signal(signal);
        }
    }
    ExitKind::Killed(format!("program ended with {status}"))
}

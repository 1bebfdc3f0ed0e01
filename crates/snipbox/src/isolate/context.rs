//! Isolate-backed isolation contexts
//!
//! A context owns one freshly initialized box. The program runs under
//! `isolate --run` with the box's wall-time limit set slightly past the
//! execution deadline, so isolate stops a runaway program even if nobody
//! destroys the context. Destroying it kills the `isolate --run` process and
//! runs `isolate --cleanup`.
//!
//! A box ID belongs to exactly one context from `create` until its box has
//! been cleaned up. IDs come from a free list, so a slow request never shares
//! its box with a later one. A context that is dropped without a successful
//! cleanup retires its ID for the rest of the factory's life.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::process::Command;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, instrument, warn};

use crate::config::Config;
use crate::isolate::command::IsolateCommand;
use crate::isolate::meta::MetaFile;
use crate::isolate::{IsolateBox, IsolateError, validate_mounts};
use crate::sandbox::slot::ProgramSlot;
use crate::sandbox::{
    ContextFactory, Invocation, IsolationContext, LiveContexts, LiveToken, MAX_RESULT_BYTES,
    MAX_STDERR_BYTES, PROGRAM_NAME, RESULT_NAME, STDERR_NAME, SandboxError,
};
use crate::types::{CompiledArtifact, MountConfig};

/// Seconds isolate's own wall-time limit runs past the execution deadline
const WALL_TIME_GRACE_SECS: f64 = 1.0;

/// Processes and threads a snippet may have
const MAX_PROCESSES: u32 = 16;

const META_NAME: &str = "meta.txt";

/// Where the `isolate --run` process's own stderr goes, next to the box
const ISOLATE_LOG_NAME: &str = "isolate.log";

/// The box IDs no live context holds
#[derive(Debug)]
struct BoxIds {
    free: Arc<Mutex<VecDeque<u32>>>,
    /// One permit per free ID, so `lease` waits instead of failing
    semaphore: Arc<Semaphore>,
}

impl BoxIds {
    fn new(first: u32, count: u32) -> Self {
        let free: VecDeque<u32> = (first..first.saturating_add(count.max(1))).collect();
        Self {
            semaphore: Arc::new(Semaphore::new(free.len())),
            free: Arc::new(Mutex::new(free)),
        }
    }

    async fn lease(&self) -> Result<BoxLease, SandboxError> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|e| SandboxError::CreateFailed(e.to_string()))?;
        let id = self
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .ok_or_else(|| SandboxError::CreateFailed("no free box ID".to_string()))?;

        Ok(BoxLease {
            id,
            free: Arc::clone(&self.free),
            permit: Some(permit),
            retired: false,
        })
    }

    fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

/// Sole use of one box ID, handed back to the free list on drop
#[derive(Debug)]
struct BoxLease {
    id: u32,
    free: Arc<Mutex<VecDeque<u32>>>,
    permit: Option<OwnedSemaphorePermit>,
    /// The box may still be in use; never hand the ID out again
    retired: bool,
}

impl Drop for BoxLease {
    fn drop(&mut self) {
        if self.retired {
            if let Some(permit) = self.permit.take() {
                permit.forget();
            }
            return;
        }
        // The ID is back before the permit is, so a waiter always finds one
        self.free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(self.id);
    }
}

/// Creates [`IsolateContext`]s, one box per request
#[derive(Debug)]
pub struct IsolateFactory {
    isolate_path: PathBuf,
    cgroup: bool,
    wall_time: f64,
    mounts: Arc<[MountConfig]>,
    ids: BoxIds,
    live: LiveContexts,
}

impl IsolateFactory {
    pub fn from_config(config: &Config) -> Self {
        Self {
            isolate_path: config.isolate_binary(),
            cgroup: config.sandbox.cgroup,
            wall_time: config.timeout_secs + WALL_TIME_GRACE_SECS,
            mounts: config.sandbox.mounts.clone().into(),
            ids: BoxIds::new(config.sandbox.first_box_id, config.sandbox.box_count),
            live: LiveContexts::new(),
        }
    }

    /// Box IDs not currently held by a context
    pub fn available(&self) -> usize {
        self.ids.available()
    }
}

impl ContextFactory for IsolateFactory {
    type Context = IsolateContext;

    #[instrument(skip(self))]
    async fn create(&self) -> Result<IsolateContext, SandboxError> {
        validate_mounts(&self.mounts).map_err(|e| SandboxError::CreateFailed(e.to_string()))?;

        let lease = self.ids.lease().await?;
        let id = lease.id;

        // On failure the lease drops here and the ID goes back to the free list
        let sandbox = IsolateBox::init(id, &self.isolate_path, self.cgroup)
            .await
            .map_err(|e| SandboxError::CreateFailed(e.to_string()))?;

        debug!(id, path = %sandbox.path().display(), "created isolate context");

        Ok(IsolateContext {
            sandbox,
            wall_time: self.wall_time,
            mounts: Arc::clone(&self.mounts),
            slot: ProgramSlot::default(),
            loaded: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            teardown: tokio::sync::Mutex::new(()),
            lease: Mutex::new(Some(lease)),
            live: Mutex::new(Some(self.live.track())),
        })
    }

    fn live_contexts(&self) -> usize {
        self.live.count()
    }
}

/// A context backed by one Isolate box
#[derive(Debug)]
pub struct IsolateContext {
    sandbox: IsolateBox,
    wall_time: f64,
    mounts: Arc<[MountConfig]>,
    slot: ProgramSlot,
    loaded: AtomicBool,
    destroyed: AtomicBool,
    teardown: tokio::sync::Mutex<()>,
    /// Given back once the box is cleaned up
    lease: Mutex<Option<BoxLease>>,
    live: Mutex<Option<LiveToken>>,
}

impl IsolateContext {
    pub fn box_id(&self) -> u32 {
        self.sandbox.id()
    }

    fn command(&self) -> Result<Command, SandboxError> {
        let program = self.sandbox.sandbox_path(PROGRAM_NAME)?;
        let result = self.sandbox.sandbox_path(RESULT_NAME)?;

        let args = IsolateCommand::new(self.sandbox.isolate_path(), self.sandbox.id())
            .cgroup(self.sandbox.cgroup())
            .wall_time(self.wall_time)
            .processes(MAX_PROCESSES)
            .mounts(self.mounts.iter().cloned())
            .meta_file(self.sandbox.file_path(META_NAME)?)
            .stderr(self.sandbox.sandbox_path(STDERR_NAME)?)
            .working_dir("/box")
            .command([
                program.to_string_lossy().into_owned(),
                result.to_string_lossy().into_owned(),
            ])
            .build();
        debug!(?args, "running isolate command");

        let (binary, rest) = args
            .split_first()
            .ok_or_else(|| IsolateError::CommandFailed("empty command arguments".to_string()))?;
        let log = std::fs::File::create(self.sandbox.path().join(ISOLATE_LOG_NAME))?;

        let mut command = Command::new(binary);
        command
            .args(rest)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(log));
        Ok(command)
    }

    async fn isolate_log(&self) -> String {
        tokio::fs::read_to_string(self.sandbox.path().join(ISOLATE_LOG_NAME))
            .await
            .map(|log| log.trim().to_string())
            .unwrap_or_default()
    }
}

impl IsolationContext for IsolateContext {
    #[instrument(skip(self, artifact), fields(id = self.sandbox.id(), len = artifact.len()))]
    async fn load(&self, artifact: CompiledArtifact) -> Result<(), SandboxError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(SandboxError::Destroyed);
        }

        self.sandbox
            .write_file(PROGRAM_NAME, artifact.as_bytes())
            .await?;
        let program = self.sandbox.file_path(PROGRAM_NAME)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&program, std::fs::Permissions::from_mode(0o755)).await?;
        }

        self.loaded.store(true, Ordering::SeqCst);
        debug!("artifact loaded");
        Ok(())
    }

    #[instrument(skip(self), fields(id = self.sandbox.id()))]
    async fn invoke(&self) -> Result<Invocation, SandboxError> {
        if !self.loaded.load(Ordering::SeqCst) {
            return Err(SandboxError::NotLoaded);
        }

        self.slot.start(|| self.command()).await?;
        // isolate reports how the program ended through the meta file
        let _ = self.slot.wait().await?;

        let meta_path = self.sandbox.file_path(META_NAME)?;
        if !tokio::fs::try_exists(&meta_path).await? {
            let log = self.isolate_log().await;
            return Err(IsolateError::CommandFailed(if log.is_empty() {
                "isolate produced no meta file".to_string()
            } else {
                log
            })
            .into());
        }
        let meta = MetaFile::load(&meta_path).await?;
        let exit = meta.exit_kind()?;

        let result = self
            .sandbox
            .read_optional(RESULT_NAME, MAX_RESULT_BYTES)
            .await?;
        let stderr = self
            .sandbox
            .read_optional(STDERR_NAME, MAX_STDERR_BYTES)
            .await?
            .unwrap_or_default();

        debug!(
            ?exit,
            wall_time = meta.wall_time(),
            has_result = result.is_some(),
            "program exited"
        );

        Ok(Invocation {
            exit,
            result,
            stderr,
        })
    }

    #[instrument(skip(self), fields(id = self.sandbox.id()))]
    async fn destroy(&self) -> Result<(), SandboxError> {
        let _teardown = self.teardown.lock().await;
        if self.destroyed.load(Ordering::SeqCst) {
            return Ok(());
        }

        self.slot.terminate().await;

        self.sandbox
            .cleanup()
            .await
            .map_err(|e| SandboxError::TeardownFailed(e.to_string()))?;

        self.destroyed.store(true, Ordering::SeqCst);
        self.lease
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        debug!("isolate context destroyed");
        Ok(())
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

impl Drop for IsolateContext {
    fn drop(&mut self) {
        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }
        warn!(
            id = self.sandbox.id(),
            "IsolateContext dropped without explicit destroy, retiring its box ID"
        );
        if let Some(lease) = self
            .lease
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
        {
            lease.retired = true;
        }
    }
}

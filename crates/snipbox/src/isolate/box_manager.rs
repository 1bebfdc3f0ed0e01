//! Box lifecycle management for isolate

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::process::Command;
use tracing::{debug, instrument, warn};

use crate::isolate::IsolateError;
use crate::isolate::command::{IsolateAction, IsolateCommand};
use crate::sandbox::read_capped;

/// An initialized Isolate box
///
/// # Cleanup
///
/// Always call [`cleanup()`](Self::cleanup) before dropping the box. The
/// `Drop` implementation falls back to a best-effort cleanup on a spawned
/// thread, which may not finish before the process exits.
#[derive(Debug)]
pub struct IsolateBox {
    id: u32,

    /// Path to the box directory as printed by `isolate --init`
    box_path: PathBuf,

    isolate_path: PathBuf,

    /// Cleared once `isolate --cleanup` has succeeded
    initialized: AtomicBool,

    cgroup: bool,
}

impl IsolateBox {
    /// Run `isolate --init` for box `id`
    #[instrument(skip(isolate_path))]
    pub async fn init(
        id: u32,
        isolate_path: impl Into<PathBuf>,
        cgroup: bool,
    ) -> Result<Self, IsolateError> {
        let isolate_path = isolate_path.into();

        let args = IsolateCommand::new(&isolate_path, id)
            .action(IsolateAction::Init)
            .cgroup(cgroup)
            .build();

        debug!(?args, "initializing isolate box");

        let output = run(&args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(IsolateError::InitFailed {
                id,
                message: stderr.trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let box_path = PathBuf::from(stdout.trim());

        if !box_path.exists() {
            return Err(IsolateError::InitFailed {
                id,
                message: format!("box path does not exist: {}", box_path.display()),
            });
        }

        debug!(?box_path, "box initialized");

        Ok(Self {
            id,
            box_path,
            isolate_path,
            initialized: AtomicBool::new(true),
            cgroup,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Path to the box directory
    pub fn path(&self) -> &Path {
        &self.box_path
    }

    pub fn isolate_path(&self) -> &Path {
        &self.isolate_path
    }

    pub fn cgroup(&self) -> bool {
        self.cgroup
    }

    /// Host path of a file inside the box
    ///
    /// Rejects names that would escape the box directory.
    pub fn file_path(&self, name: &str) -> Result<PathBuf, IsolateError> {
        check_name(name)?;
        Ok(self.box_path.join("box").join(name))
    }

    /// Path of a file as seen from inside the sandbox, where the box is mounted at `/box`
    pub fn sandbox_path(&self, name: &str) -> Result<PathBuf, IsolateError> {
        check_name(name)?;
        Ok(PathBuf::from("/box").join(name))
    }

    #[instrument(skip(self, content))]
    pub async fn write_file(&self, name: &str, content: &[u8]) -> Result<(), IsolateError> {
        let path = self.file_path(name)?;
        tokio::fs::write(&path, content).await?;
        debug!(?path, len = content.len(), "wrote file to box");
        Ok(())
    }

    /// Read up to `limit` bytes of a file in the box, `None` if it does not exist
    pub async fn read_optional(
        &self,
        name: &str,
        limit: usize,
    ) -> Result<Option<Vec<u8>>, IsolateError> {
        let path = self.file_path(name)?;
        Ok(read_capped(&path, limit).await?)
    }

    /// Run `isolate --cleanup`; a no-op once it has succeeded
    #[instrument(skip(self), fields(id = self.id))]
    pub async fn cleanup(&self) -> Result<(), IsolateError> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }

        let args = IsolateCommand::new(&self.isolate_path, self.id)
            .action(IsolateAction::Cleanup)
            .cgroup(self.cgroup)
            .build();

        debug!(?args, "cleaning up isolate box");

        let output = run(&args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(stderr = %stderr, "cleanup failed");
            return Err(IsolateError::CleanupFailed {
                id: self.id,
                message: stderr.trim().to_string(),
            });
        }

        self.initialized.store(false, Ordering::SeqCst);
        debug!("box cleaned up");
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }
}

impl Drop for IsolateBox {
    fn drop(&mut self) {
        if !self.initialized.load(Ordering::SeqCst) {
            return;
        }

        warn!(
            box_id = self.id,
            box_path = %self.box_path.display(),
            "IsolateBox dropped without explicit cleanup, attempting best-effort cleanup"
        );

        let args = IsolateCommand::new(&self.isolate_path, self.id)
            .action(IsolateAction::Cleanup)
            .cgroup(self.cgroup)
            .build();
        let id = self.id;

        std::thread::spawn(move || {
            let Some((program, rest)) = args.split_first() else {
                return;
            };
            match std::process::Command::new(program).args(rest).output() {
                Ok(output) if output.status.success() => {
                    debug!(box_id = id, "best-effort cleanup succeeded");
                }
                Ok(output) => {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    warn!(box_id = id, stderr = %stderr, "best-effort cleanup failed");
                }
                Err(e) => {
                    warn!(box_id = id, error = %e, "best-effort cleanup spawn failed");
                }
            }
        });
    }
}

fn check_name(name: &str) -> Result<(), IsolateError> {
    if name.contains("..") || name.starts_with('/') {
        return Err(IsolateError::InvalidPath(format!(
            "path traversal not allowed: {name}"
        )));
    }
    Ok(())
}

async fn run(args: &[String]) -> Result<std::process::Output, IsolateError> {
    let (program, rest) = args
        .split_first()
        .ok_or_else(|| IsolateError::CommandFailed("empty command arguments".to_string()))?;
    Command::new(program)
        .args(rest)
        .output()
        .await
        .map_err(IsolateError::SpawnFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uninitialized(box_path: &str) -> IsolateBox {
        IsolateBox {
            id: 0,
            box_path: PathBuf::from(box_path),
            isolate_path: PathBuf::from("isolate"),
            initialized: AtomicBool::new(false),
            cgroup: false,
        }
    }

    #[test]
    fn test_file_path_validation() {
        let sandbox = uninitialized("/tmp/box0");

        assert_eq!(
            sandbox.file_path("program").unwrap(),
            PathBuf::from("/tmp/box0/box/program")
        );
        assert!(sandbox.file_path("../escape").is_err());
        assert!(sandbox.file_path("foo/../bar").is_err());
        assert!(sandbox.file_path("/absolute/path").is_err());
    }

    #[test]
    fn test_sandbox_path() {
        let sandbox = uninitialized("/var/local/lib/isolate/0");

        assert_eq!(
            sandbox.sandbox_path("result.txt").unwrap(),
            PathBuf::from("/box/result.txt")
        );
        assert!(sandbox.sandbox_path("../escape").is_err());
        assert!(sandbox.sandbox_path("/absolute/path").is_err());
    }

    #[tokio::test]
    async fn test_cleanup_of_uninitialized_box_is_noop() {
        let sandbox = uninitialized("/tmp/box0");
        sandbox.cleanup().await.unwrap();
        assert!(!sandbox.is_initialized());
    }

    #[tokio::test]
    async fn test_read_optional_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("box")).unwrap();
        let sandbox = uninitialized(dir.path().to_str().unwrap());

        assert_eq!(sandbox.read_optional("result.txt", 16).await.unwrap(), None);
        sandbox.write_file("result.txt", b"7").await.unwrap();
        assert_eq!(
            sandbox.read_optional("result.txt", 16).await.unwrap(),
            Some(b"7".to_vec())
        );
        sandbox.write_file("stderr.txt", &[b'e'; 64]).await.unwrap();
        assert_eq!(
            sandbox.read_optional("stderr.txt", 16).await.unwrap(),
            Some(vec![b'e'; 16])
        );
    }

    #[tokio::test]
    async fn test_init_with_missing_binary_fails_to_spawn() {
        let result = IsolateBox::init(0, "/nonexistent/isolate", false).await;
        assert!(matches!(result, Err(IsolateError::SpawnFailed(_))));
    }

    // These require the isolate binary and root privileges.
    // Run with: cargo test --features integration-tests -- --include-ignored

    #[tokio::test]
    #[cfg(feature = "integration-tests")]
    #[ignore = "requires root"]
    async fn test_box_init_cleanup() {
        let sandbox = IsolateBox::init(99, "isolate", false).await.unwrap();
        assert!(sandbox.path().exists());
        sandbox.cleanup().await.unwrap();
        assert!(!sandbox.is_initialized());
    }
}

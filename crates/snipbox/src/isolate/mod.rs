//! IOI Isolate backend
//!
//! Runs snippets inside Isolate boxes. Each request initializes its own box,
//! runs the program once and cleans the box up again. Box IDs come from the
//! configured range and are never shared by two live contexts.
//!
//! References for Isolate's CLI arguments and meta-files:
//! - https://www.ucw.cz/isolate/isolate.1.html
//! - https://github.com/ioi/isolate

use std::fs;
use std::path::Path;

use thiserror::Error;

pub use crate::isolate::box_manager::IsolateBox;
pub use crate::isolate::command::{IsolateAction, IsolateCommand};
pub use crate::isolate::context::{IsolateContext, IsolateFactory};
pub use crate::isolate::meta::{MetaFile, MetaParseError, MetaStatus};
use crate::types::MountConfig;

mod box_manager;
mod command;
mod context;
mod meta;

/// Errors that occur during isolate sandbox operations
#[derive(Debug, Error)]
pub enum IsolateError {
    #[error("failed to initialize box {id}: {message}")]
    InitFailed { id: u32, message: String },

    #[error("failed to cleanup box {id}: {message}")]
    CleanupFailed { id: u32, message: String },

    #[error("isolate command failed: {0}")]
    CommandFailed(String),

    #[error("failed to spawn isolate process: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error("failed to parse meta file: {0}")]
    MetaParseFailed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("mount source path does not exist: {0}")]
    MountSourceNotFound(String),
}

/// Controllers every per-request box needs in its parent cgroup
const BOX_CONTROLLERS: &[&str] = &["memory", "pids"];

/// Make `cg_root` usable as the parent of per-box cgroups
///
/// Run once, before the first isolate context is created with `--cg`. When no
/// cgroup keeper service runs (typically inside a container), snipbox takes
/// over its job: it moves itself into a leaf cgroup, delegates the box
/// controllers down to `cg_root`, and creates `cg_root` if needed.
///
/// Returns `Ok(false)` when cgroup v2 or its memory controller is missing, in
/// which case contexts must be created without `--cg`.
pub fn prepare_cgroup(cg_root: &Path) -> Result<bool, IsolateError> {
    prepare_cgroup_under(Path::new("/sys/fs/cgroup"), cg_root, std::process::id())
}

fn prepare_cgroup_under(mount: &Path, cg_root: &Path, pid: u32) -> Result<bool, IsolateError> {
    let Ok(available) = fs::read_to_string(mount.join("cgroup.controllers")) else {
        return Ok(false);
    };
    if !lists_controller(&available, "memory") {
        return Ok(false);
    }

    let delegated = fs::read_to_string(cg_root.join("cgroup.subtree_control")).unwrap_or_default();
    if lists_controller(&delegated, "memory") {
        return Ok(true);
    }

    // Controllers can only be delegated from a cgroup with no member
    // processes, so leave the mount root for a leaf of our own first
    let leaf = mount.join("snipbox");
    fs::create_dir_all(&leaf)?;
    fs::write(leaf.join("cgroup.procs"), pid.to_string())?;

    let enable = BOX_CONTROLLERS
        .iter()
        .map(|controller| format!("+{controller}"))
        .collect::<Vec<_>>()
        .join(" ");
    fs::write(mount.join("cgroup.subtree_control"), &enable)?;
    fs::create_dir_all(cg_root)?;
    fs::write(cg_root.join("cgroup.subtree_control"), &enable)?;

    Ok(true)
}

fn lists_controller(list: &str, controller: &str) -> bool {
    list.split_whitespace().any(|name| name == controller)
}

/// Validate that all mount source paths exist
///
/// Optional mounts are skipped if their source doesn't exist.
pub fn validate_mounts(mounts: &[MountConfig]) -> Result<(), IsolateError> {
    for mount in mounts {
        if mount.optional {
            continue;
        }
        if !Path::new(&mount.source).exists() {
            return Err(IsolateError::MountSourceNotFound(mount.source.clone()));
        }
    }
    Ok(())
}

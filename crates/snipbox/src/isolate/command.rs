//! Command builder for the Isolate CLI
//!
//! Builds command-line arguments for the Isolate sandbox tool.

use std::path::{Path, PathBuf};

use crate::types::MountConfig;

/// Builder for Isolate command-line arguments
#[derive(Debug)]
pub struct IsolateCommand {
    /// Path to Isolate binary
    isolate_path: PathBuf,
    /// One of --init, --run, --cleanup
    action: IsolateAction,
    /// -b, --box-id
    box_id: u32,
    /// -w, --wall-time
    wall_time: Option<f64>,
    /// -p, --processes
    processes: Option<u32>,
    mounts: Vec<MountConfig>,
    /// -M, --meta
    meta_file: Option<PathBuf>,
    /// -o, --stdout
    stdout: Option<PathBuf>,
    /// -r, --stderr
    stderr: Option<PathBuf>,
    working_dir: Option<String>,
    command: Vec<String>,
    cgroup: bool,
}

impl IsolateCommand {
    pub fn new(isolate_path: impl Into<PathBuf>, box_id: u32) -> Self {
        Self {
            isolate_path: isolate_path.into(),
            action: IsolateAction::Run,
            box_id,
            wall_time: None,
            processes: None,
            mounts: Vec::new(),
            meta_file: None,
            stdout: None,
            stderr: None,
            working_dir: None,
            command: Vec::new(),
            cgroup: false,
        }
    }

    pub fn action(mut self, action: IsolateAction) -> Self {
        self.action = action;
        self
    }

    /// Wall-clock limit enforced by isolate itself, in seconds
    pub fn wall_time(mut self, seconds: f64) -> Self {
        self.wall_time = Some(seconds);
        self
    }

    /// Allow up to `count` processes and threads inside the box
    pub fn processes(mut self, count: u32) -> Self {
        self.processes = Some(count);
        self
    }

    pub fn mounts(mut self, mounts: impl IntoIterator<Item = MountConfig>) -> Self {
        self.mounts.extend(mounts);
        self
    }

    pub fn meta_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.meta_file = Some(path.into());
        self
    }

    pub fn stdout(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdout = Some(path.into());
        self
    }

    pub fn stderr(mut self, path: impl Into<PathBuf>) -> Self {
        self.stderr = Some(path.into());
        self
    }

    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn command(mut self, cmd: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.command = cmd.into_iter().map(Into::into).collect();
        self
    }

    pub fn cgroup(mut self, enable: bool) -> Self {
        self.cgroup = enable;
        self
    }

    /// Build the command-line arguments, binary first
    pub fn build(self) -> Vec<String> {
        let mut args = vec![self.isolate_path.to_string_lossy().into_owned()];

        args.push(format!("--box-id={}", self.box_id));

        if self.cgroup {
            args.push("--cg".to_string());
        }

        match self.action {
            IsolateAction::Init => {
                args.push("--init".to_string());
            }
            IsolateAction::Cleanup => {
                args.push("--cleanup".to_string());
            }
            IsolateAction::Run => {
                args.push("--run".to_string());

                if let Some(wall_time) = self.wall_time {
                    args.push(format!("--wall-time={wall_time}"));
                }
                if let Some(procs) = self.processes {
                    args.push(format!("--processes={procs}"));
                }

                for mount in &self.mounts {
                    // Skip optional mounts whose source doesn't exist
                    if mount.optional && !Path::new(&mount.source).exists() {
                        continue;
                    }
                    let mut opts = String::new();
                    if mount.writable {
                        opts.push_str(":rw");
                    }
                    if mount.optional {
                        opts.push_str(":maybe");
                    }
                    args.push(format!("--dir={}={}{}", mount.target, mount.source, opts));
                }

                if let Some(ref meta) = self.meta_file {
                    args.push(format!("--meta={}", meta.display()));
                }
                if let Some(ref stdout) = self.stdout {
                    args.push(format!("--stdout={}", stdout.display()));
                }
                if let Some(ref stderr) = self.stderr {
                    args.push(format!("--stderr={}", stderr.display()));
                }
                if let Some(ref dir) = self.working_dir {
                    args.push(format!("--chdir={dir}"));
                }

                args.push("--".to_string());
                args.extend(self.command);
            }
        }

        args
    }

    pub fn isolate_path(&self) -> &Path {
        &self.isolate_path
    }

    pub fn box_id(&self) -> u32 {
        self.box_id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolateAction {
    /// Initialize a new box
    Init,
    /// Run a command in the box
    Run,
    /// Clean up a box
    Cleanup,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mount(source: &str, target: &str, writable: bool) -> MountConfig {
        MountConfig {
            source: source.to_string(),
            target: target.to_string(),
            writable,
            optional: false,
        }
    }

    #[test]
    fn test_init_command() {
        let args = IsolateCommand::new("isolate", 0)
            .action(IsolateAction::Init)
            .build();
        assert_eq!(args, vec!["isolate", "--box-id=0", "--init"]);
    }

    #[test]
    fn test_cleanup_command() {
        let args = IsolateCommand::new("isolate", 5)
            .action(IsolateAction::Cleanup)
            .build();
        assert_eq!(args, vec!["isolate", "--box-id=5", "--cleanup"]);
    }

    #[test]
    fn test_run_command_with_wall_time() {
        let args = IsolateCommand::new("isolate", 0)
            .action(IsolateAction::Run)
            .wall_time(6.0)
            .command(vec!["/box/program"])
            .build();
        assert!(args.contains(&"--wall-time=6".to_string()));
        assert!(args.contains(&"--".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("/box/program"));
    }

    #[test]
    fn test_fractional_wall_time() {
        let args = IsolateCommand::new("isolate", 0)
            .wall_time(1.5)
            .command(vec!["/box/program"])
            .build();
        assert!(args.contains(&"--wall-time=1.5".to_string()));
    }

    #[test]
    fn test_no_limits_set() {
        let args = IsolateCommand::new("isolate", 0)
            .command(vec!["/box/program"])
            .build();
        assert!(!args.iter().any(|a| a.starts_with("--wall-time=")));
        assert!(!args.iter().any(|a| a.starts_with("--processes=")));
    }

    #[test]
    fn test_processes() {
        let args = IsolateCommand::new("isolate", 0)
            .processes(4)
            .command(vec!["/box/program"])
            .build();
        assert!(args.contains(&"--processes=4".to_string()));
    }

    #[test]
    fn test_run_command_with_cgroup() {
        let args = IsolateCommand::new("isolate", 0)
            .action(IsolateAction::Run)
            .cgroup(true)
            .command(vec!["/box/program"])
            .build();
        assert_eq!(args[2], "--cg");
        assert_eq!(args[3], "--run");
    }

    #[test]
    fn test_mounts() {
        let args = IsolateCommand::new("isolate", 0)
            .mounts(vec![
                mount("/usr/lib", "/lib", false),
                mount("/tmp/data", "/data", true),
            ])
            .command(vec!["/box/program"])
            .build();

        assert!(args.contains(&"--dir=/lib=/usr/lib".to_string()));
        assert!(args.contains(&"--dir=/data=/tmp/data:rw".to_string()));
    }

    #[test]
    fn test_missing_optional_mount_is_skipped() {
        let optional = MountConfig {
            source: "/nonexistent/snipbox/mount".to_string(),
            target: "/opt".to_string(),
            writable: false,
            optional: true,
        };
        let args = IsolateCommand::new("isolate", 0)
            .mounts(vec![optional])
            .command(vec!["/box/program"])
            .build();
        assert!(!args.iter().any(|a| a.starts_with("--dir=")));
    }

    #[test]
    fn test_io_and_meta_files() {
        let args = IsolateCommand::new("isolate", 0)
            .meta_file("/var/local/lib/isolate/0/box/meta.txt")
            .stdout("/box/stdout.txt")
            .stderr("/box/stderr.txt")
            .working_dir("/box")
            .command(vec!["/box/program"])
            .build();

        assert!(args.contains(&"--meta=/var/local/lib/isolate/0/box/meta.txt".to_string()));
        assert!(args.contains(&"--stdout=/box/stdout.txt".to_string()));
        assert!(args.contains(&"--stderr=/box/stderr.txt".to_string()));
        assert!(args.contains(&"--chdir=/box".to_string()));
    }

    #[test]
    fn test_command_follows_separator() {
        let args = IsolateCommand::new("isolate", 0)
            .command(vec!["/box/program", "/box/result.txt"])
            .build();

        let sep_pos = args.iter().position(|a| a == "--").unwrap();
        assert_eq!(args[sep_pos + 1], "/box/program");
        assert_eq!(args[sep_pos + 2], "/box/result.txt");
        assert_eq!(args.len(), sep_pos + 3);
    }

    #[test]
    fn test_accessors() {
        let cmd = IsolateCommand::new("/usr/local/bin/isolate", 42);
        assert_eq!(cmd.isolate_path(), Path::new("/usr/local/bin/isolate"));
        assert_eq!(cmd.box_id(), 42);
    }

    #[test]
    fn test_init_ignores_run_options() {
        let args = IsolateCommand::new("isolate", 0)
            .action(IsolateAction::Init)
            .wall_time(5.0)
            .working_dir("/box")
            .command(vec!["/box/program"])
            .build();
        assert_eq!(args, vec!["isolate", "--box-id=0", "--init"]);
    }

    #[test]
    fn test_cgroup_with_cleanup() {
        let args = IsolateCommand::new("isolate", 3)
            .action(IsolateAction::Cleanup)
            .cgroup(true)
            .build();
        assert_eq!(args, vec!["isolate", "--box-id=3", "--cg", "--cleanup"]);
    }
}

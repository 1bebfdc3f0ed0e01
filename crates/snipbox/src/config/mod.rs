use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::types::MountConfig;

mod loader;

/// Example configuration embedded at compile time.
///
/// Library users can access this to generate a starter config file.
pub const EXAMPLE_CONFIG: &str = include_str!("../../snipbox.example.toml");

/// Wall-clock deadline applied when the config does not name one
pub const DEFAULT_TIMEOUT_SECS: f64 = 5.0;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse config: {0}")]
    Parse(#[from] config::ConfigError),

    #[error("invalid namespace '{0}': expected a path like `std::collections` or `std::iter::*`")]
    InvalidNamespace(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Config for snipbox
///
/// Loaded once at startup and treated as immutable afterwards. The allow-list
/// and the deadline are both part of it so tests can run the pipeline with
/// alternate limits.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Wall-clock deadline for a single snippet execution, in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: f64,

    /// `use` paths made resolvable inside the snippet
    #[serde(default = "default_namespaces")]
    pub namespaces: Vec<String>,

    #[serde(default)]
    pub compiler: CompilerConfig,

    #[serde(default)]
    pub sandbox: SandboxConfig,
}

/// Settings for the `rustc` invocation
#[derive(Debug, Clone, Deserialize)]
pub struct CompilerConfig {
    /// Path or name of the rustc binary (resolved through PATH)
    #[serde(default = "default_rustc")]
    pub rustc: PathBuf,

    /// Rust edition the snippet is compiled with
    #[serde(default = "default_edition")]
    pub edition: String,

    /// Extra arguments passed to rustc before the source file
    #[serde(default = "default_rustc_args")]
    pub args: Vec<String>,

    /// Upper bound on compile time, in seconds
    #[serde(default = "default_compile_timeout_secs")]
    pub timeout_secs: f64,

    /// Directory scratch compile directories are created in (system temp if unset)
    #[serde(default)]
    pub scratch_dir: Option<PathBuf>,
}

/// Which isolation backend creates execution contexts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Plain child process in a throwaway directory
    #[default]
    Process,
    /// IOI Isolate box
    Isolate,
}

/// Settings for the isolation backend
#[derive(Debug, Clone, Deserialize)]
pub struct SandboxConfig {
    #[serde(default)]
    pub backend: Backend,

    /// Path to the Isolate binary (uses PATH if not specified).
    #[serde(default)]
    pub isolate_path: Option<PathBuf>,

    /// Run isolate with `--cg`.
    #[serde(default)]
    pub cgroup: bool,

    /// Cgroup root path for isolate. Must match isolate's `cg_root` config value.
    ///
    /// When `cgroup = true`, snipbox will attempt to create this cgroup directory
    /// and enable the memory controller before invoking isolate.
    #[serde(default = "default_cg_root")]
    pub cg_root: PathBuf,

    /// First isolate box ID handed out
    #[serde(default)]
    pub first_box_id: u32,

    /// Number of isolate box IDs available, which bounds concurrent requests
    #[serde(default = "default_box_count")]
    pub box_count: u32,

    /// Extra directory mounts applied to every isolate run
    #[serde(default)]
    pub mounts: Vec<MountConfig>,

    /// Directory process contexts are created in (system temp if unset)
    #[serde(default)]
    pub scratch_dir: Option<PathBuf>,
}

impl Config {
    /// Create a new config from the embedded defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// The execution deadline
    pub fn timeout(&self) -> Duration {
        clamped_duration(self.timeout_secs)
    }

    /// Replace the execution deadline
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs_f64();
        self
    }

    /// Replace the namespace allow-list
    pub fn with_namespaces(mut self, namespaces: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.namespaces = namespaces.into_iter().map(Into::into).collect();
        self
    }

    /// Get the path to the isolate binary
    pub fn isolate_binary(&self) -> PathBuf {
        self.sandbox
            .isolate_path
            .clone()
            .unwrap_or_else(|| PathBuf::from("isolate"))
    }
}

impl CompilerConfig {
    pub fn timeout(&self) -> Duration {
        clamped_duration(self.timeout_secs)
    }
}

/// `secs` as a [`Duration`], saturating instead of panicking when out of range
fn clamped_duration(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or(if secs > 0.0 {
        Duration::MAX
    } else {
        Duration::ZERO
    })
}

impl Default for Config {
    fn default() -> Self {
        Self::parse_toml(EXAMPLE_CONFIG).expect("embedded default config should be valid")
    }
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            rustc: default_rustc(),
            edition: default_edition(),
            args: default_rustc_args(),
            timeout_secs: default_compile_timeout_secs(),
            scratch_dir: None,
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            isolate_path: None,
            cgroup: false,
            cg_root: default_cg_root(),
            first_box_id: 0,
            box_count: default_box_count(),
            mounts: Vec::new(),
            scratch_dir: None,
        }
    }
}

fn default_timeout_secs() -> f64 {
    DEFAULT_TIMEOUT_SECS
}

/// The seven `use` paths available to snippets unless configured otherwise
pub fn default_namespaces() -> Vec<String> {
    [
        "std::collections::*",
        "std::iter::*",
        "std::cmp::*",
        "std::str::*",
        "std::char::*",
        "std::fmt",
        "std::io",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_rustc() -> PathBuf {
    PathBuf::from("rustc")
}

fn default_edition() -> String {
    "2021".to_string()
}

fn default_rustc_args() -> Vec<String> {
    ["-C", "opt-level=0", "-C", "debuginfo=0"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_compile_timeout_secs() -> f64 {
    30.0
}

fn default_cg_root() -> PathBuf {
    PathBuf::from("/sys/fs/cgroup/isolate")
}

fn default_box_count() -> u32 {
    100
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_timeout_is_five_seconds() {
        let config = Config::default();
        assert_eq!(config.timeout(), Duration::from_secs(5));
    }

    #[test]
    fn default_has_seven_namespaces() {
        let config = Config::default();
        assert_eq!(config.namespaces.len(), 7);
        assert_eq!(config.namespaces, default_namespaces());
    }

    #[test]
    fn default_backend_is_process() {
        let config = Config::default();
        assert_eq!(config.sandbox.backend, Backend::Process);
    }

    #[test]
    fn with_timeout_overrides_deadline() {
        let config = Config::default().with_timeout(Duration::from_millis(1500));
        assert_eq!(config.timeout(), Duration::from_millis(1500));
        assert_eq!(config.timeout_secs, 1.5);
    }

    #[test]
    fn out_of_range_timeouts_saturate() {
        let mut config = Config::default();
        config.timeout_secs = 1e30;
        config.compiler.timeout_secs = f64::INFINITY;
        assert_eq!(config.timeout(), Duration::MAX);
        assert_eq!(config.compiler.timeout(), Duration::MAX);

        config.timeout_secs = -1.0;
        config.compiler.timeout_secs = f64::NAN;
        assert_eq!(config.timeout(), Duration::ZERO);
        assert_eq!(config.compiler.timeout(), Duration::ZERO);
    }

    #[test]
    fn with_namespaces_replaces_list() {
        let config = Config::default().with_namespaces(["std::collections::*"]);
        assert_eq!(config.namespaces, vec!["std::collections::*".to_string()]);
    }

    #[test]
    fn isolate_binary_default() {
        let config = Config::default();
        assert_eq!(config.isolate_binary(), PathBuf::from("isolate"));
    }

    #[test]
    fn isolate_binary_custom_path() {
        let mut config = Config::default();
        config.sandbox.isolate_path = Some(PathBuf::from("/usr/local/bin/isolate"));
        assert_eq!(
            config.isolate_binary(),
            PathBuf::from("/usr/local/bin/isolate")
        );
    }

    #[test]
    fn compiler_defaults() {
        let compiler = CompilerConfig::default();
        assert_eq!(compiler.rustc, PathBuf::from("rustc"));
        assert_eq!(compiler.edition, "2021");
        assert_eq!(compiler.timeout(), Duration::from_secs(30));
    }
}

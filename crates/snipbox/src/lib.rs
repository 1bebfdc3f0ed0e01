//! A library for running untrusted Rust snippets.
//!
//! snipbox takes the body of a function from an end user, compiles it into a
//! standalone executable with `rustc`, runs that executable inside a
//! throwaway isolation context under a wall-clock deadline, and turns every
//! possible outcome into a display string. The context is destroyed on every
//! path, and none of the entry points return errors or panic.
//!
//! # Features
//!
//! - **Snippet synthesis**: the snippet becomes the body of a closure inside
//!   an explicitly named wrapper type, with a fixed entry point.
//! - **Namespace allow-list**: only the configured `use` paths resolve inside
//!   the snippet, and the default validator rejects everything else.
//! - **Two isolation backends**: plain child processes in throwaway
//!   directories, or IOI Isolate boxes.
//! - **Hard deadline**: runaway snippets are stopped by destroying their
//!   context, never by cooperation.
//!
//! ```rust,ignore
//! let executor = snipbox::Executor::new(snipbox::Config::default());
//! assert_eq!(executor.execute("return 1 + 1;").await, "2");
//! ```

pub use config::{Config, ConfigError, EXAMPLE_CONFIG};
pub use isolate::{IsolateError, prepare_cgroup};
pub use runner::{CompileError, Executor, normalize};
pub use sandbox::{ContextFactory, IsolationContext, SandboxError, SandboxFactory};
pub use types::{CompilationUnit, CompiledArtifact, Diagnostic, ExecutionResult, MountConfig};
pub use validate::{SourcePolicy, Validator};

pub mod config;
pub mod isolate;
pub mod runner;
pub mod sandbox;
pub mod types;
pub mod validate;

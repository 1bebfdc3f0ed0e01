use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A synthesized program ready for compilation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilationUnit {
    /// Full program source
    pub source: String,

    /// 1-based line of `source` on which the snippet starts
    pub snippet_line: usize,

    /// Number of lines the snippet occupies
    pub snippet_lines: usize,
}

impl CompilationUnit {
    /// Map a line of the synthesized source back to a line of the snippet.
    ///
    /// Returns `None` for lines that belong to the generated scaffolding.
    pub fn snippet_relative_line(&self, line: usize) -> Option<usize> {
        if line < self.snippet_line || line >= self.snippet_line + self.snippet_lines {
            return None;
        }
        Some(line - self.snippet_line + 1)
    }
}

/// An executable image produced by the compiler
///
/// The bytes only ever live in memory on the host side; they are written
/// into an isolation context by the loader and nowhere else.
#[derive(Clone, PartialEq, Eq)]
pub struct CompiledArtifact {
    bytes: Vec<u8>,
}

impl CompiledArtifact {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Debug for CompiledArtifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledArtifact")
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Severity of a compiler diagnostic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Note,
    Help,
}

impl Severity {
    /// Parse the `level` field of a rustc JSON diagnostic
    pub fn from_rustc_level(level: &str) -> Self {
        match level {
            "warning" => Severity::Warning,
            "note" | "failure-note" => Severity::Note,
            "help" => Severity::Help,
            // "error" and "error: internal compiler error"
            _ => Severity::Error,
        }
    }
}

/// Position inside the user's snippet (1-based)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub line: usize,
    pub column: usize,
}

/// A single compiler message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,

    /// User-facing message, with synthesized names already redacted
    pub message: String,

    /// Where in the snippet the message points, if it points into the snippet
    pub location: Option<Location>,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.location {
            Some(loc) => write!(f, "({},{}): {}", loc.line, loc.column, self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Outcome of a single `execute` request
///
/// Exactly one variant is produced per request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionResult {
    /// The snippet ran to completion. `None` means it produced no value.
    Value(Option<String>),

    /// Compilation failed with one or more diagnostics
    CompileError(Vec<Diagnostic>),

    /// The compiler reported success but produced an empty artifact
    EmitEmpty,

    /// The snippet (or the loading machinery) faulted at runtime
    RuntimeFault(String),

    /// The deadline elapsed before the snippet finished
    Timeout(Duration),

    /// The validator refused the snippet
    Rejected,

    /// The scheduling or isolation machinery itself failed
    SupervisionFault(String),
}

impl ExecutionResult {
    /// Short, stable name of the variant (used in logs and worker output)
    pub fn kind(&self) -> &'static str {
        match self {
            ExecutionResult::Value(_) => "value",
            ExecutionResult::CompileError(_) => "compile_error",
            ExecutionResult::EmitEmpty => "emit_empty",
            ExecutionResult::RuntimeFault(_) => "runtime_fault",
            ExecutionResult::Timeout(_) => "timeout",
            ExecutionResult::Rejected => "rejected",
            ExecutionResult::SupervisionFault(_) => "supervision_fault",
        }
    }

    #[must_use]
    pub fn is_value(&self) -> bool {
        matches!(self, ExecutionResult::Value(_))
    }
}

/// Configuration for a directory mount in Isolate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountConfig {
    /// Source path on the host
    pub source: String,

    /// Target path in the sandbox
    pub target: String,

    /// Whether the mount is read-write (default: read-only)
    #[serde(default)]
    pub writable: bool,

    /// Whether this mount is optional (don't fail if source doesn't exist)
    /// Maps to isolate's `:maybe` flag
    #[serde(default)]
    pub optional: bool,
}

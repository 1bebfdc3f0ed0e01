//! Compilation step
//!
//! Drives `rustc` over a synthesized program in a scratch directory and reads
//! the produced executable back into memory. The scratch directory is removed
//! before [`Compiler::compile`] returns.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use crate::config::CompilerConfig;
use crate::runner::CompileError;
use crate::runner::synthesize::{SNIPPET_BINDING, SNIPPET_PLACEHOLDER};
use crate::types::{CompilationUnit, CompiledArtifact, Diagnostic, Location, Severity};

const SOURCE_NAME: &str = "main.rs";
const OUTPUT_NAME: &str = "snippet";

/// Compiles synthesized programs with `rustc`
#[derive(Debug, Clone)]
pub struct Compiler {
    rustc: PathBuf,
    edition: String,
    args: Vec<String>,
    timeout: Duration,
    scratch_dir: Option<PathBuf>,
}

impl Compiler {
    pub fn from_config(config: &CompilerConfig) -> Self {
        Self {
            rustc: config.rustc.clone(),
            edition: config.edition.clone(),
            args: config.args.clone(),
            timeout: config.timeout(),
            scratch_dir: config.scratch_dir.clone(),
        }
    }

    /// Compile `unit` into an executable
    #[instrument(skip_all, fields(len = unit.source.len()))]
    pub async fn compile(&self, unit: &CompilationUnit) -> Result<CompiledArtifact, CompileError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("snipbox-build-");
        let dir = match &self.scratch_dir {
            Some(root) => builder.tempdir_in(root),
            None => builder.tempdir(),
        }
        .map_err(CompileError::Toolchain)?;

        let source = dir.path().join(SOURCE_NAME);
        let output = dir.path().join(OUTPUT_NAME);
        tokio::fs::write(&source, &unit.source)
            .await
            .map_err(CompileError::Toolchain)?;

        let mut command = Command::new(&self.rustc);
        command
            .arg("--edition")
            .arg(&self.edition)
            .args(["--crate-name", "snippet", "--crate-type", "bin"])
            .args(["--error-format=json", "-A", "warnings"])
            .args(&self.args)
            .arg("-o")
            .arg(&output)
            .arg(&source)
            .current_dir(dir.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(rustc = %self.rustc.display(), edition = %self.edition, "running compiler");

        let result = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| CompileError::Timeout(self.timeout))?
            .map_err(CompileError::Toolchain)?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            let diagnostics = parse_diagnostics(&stderr, unit);
            debug!(status = ?result.status, count = diagnostics.len(), "compilation failed");
            return Err(CompileError::Diagnostics(diagnostics));
        }

        let bytes = match tokio::fs::read(&output).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(CompileError::Toolchain(e)),
        };
        if bytes.is_empty() {
            warn!("compiler reported success without producing an executable");
            return Err(CompileError::EmitEmpty);
        }

        if let Err(e) = dir.close() {
            warn!(error = %e, "failed to remove compile directory");
        }

        debug!(len = bytes.len(), "compilation complete");
        Ok(CompiledArtifact::new(bytes))
    }
}

/// One line of `rustc --error-format=json` output
#[derive(Debug, Deserialize)]
struct RustcMessage {
    message: String,
    level: String,
    #[serde(default)]
    spans: Vec<RustcSpan>,
}

#[derive(Debug, Deserialize)]
struct RustcSpan {
    line_start: usize,
    column_start: usize,
    is_primary: bool,
}

/// Turn rustc's JSON diagnostics into snippet-relative [`Diagnostic`]s
///
/// Only errors are kept. If nothing parses, the raw stderr becomes a single
/// diagnostic so a failed compile never reports an empty list.
pub(crate) fn parse_diagnostics(stderr: &str, unit: &CompilationUnit) -> Vec<Diagnostic> {
    let mut diagnostics: Vec<Diagnostic> = stderr
        .lines()
        .filter(|line| line.starts_with('{'))
        .filter_map(|line| serde_json::from_str::<RustcMessage>(line).ok())
        .filter(|message| Severity::from_rustc_level(&message.level) == Severity::Error)
        .filter(|message| !message.message.starts_with("aborting due to"))
        .map(|message| {
            let location = message
                .spans
                .iter()
                .find(|span| span.is_primary)
                .and_then(|span| {
                    unit.snippet_relative_line(span.line_start)
                        .map(|line| Location {
                            line,
                            column: span.column_start,
                        })
                });
            Diagnostic {
                severity: Severity::Error,
                message: redact(&message.message),
                location,
            }
        })
        .collect();

    if diagnostics.is_empty() {
        let raw = stderr.trim();
        diagnostics.push(Diagnostic {
            severity: Severity::Error,
            message: if raw.is_empty() {
                "compilation failed".to_string()
            } else {
                redact(raw)
            },
            location: None,
        });
    }

    diagnostics
}

fn redact(message: &str) -> String {
    message.replace(SNIPPET_BINDING, SNIPPET_PLACEHOLDER)
}

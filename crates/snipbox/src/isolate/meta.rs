//! Meta file parsing for isolate
//!
//! Isolate writes a `key:value` meta file after every run. Only the entries
//! that say how the program ended are interpreted here.

use std::collections::HashMap;
use std::path::Path;

use thiserror::Error;

use crate::isolate::IsolateError;
use crate::sandbox::ExitKind;

/// Error that occurs during meta file parsing
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("meta file parse error at line {line_number}: {message} (line: {line:?})")]
pub struct MetaParseError {
    /// Line number (1-indexed) where the error occurred
    pub line_number: usize,
    /// The problematic line content
    pub line: String,
    pub message: String,
}

/// The `status` entry of a meta file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetaStatus {
    /// No status entry: the program exited normally
    Ok,
    /// `RE`: non-zero exit code
    RuntimeError,
    /// `SG`: killed by a signal
    Signaled,
    /// `TO`: a time limit was exceeded
    TimedOut,
    /// `XX`: isolate itself failed
    InternalError,
    Unknown(String),
}

impl MetaStatus {
    fn from_code(code: &str) -> Self {
        match code {
            "RE" => MetaStatus::RuntimeError,
            "SG" => MetaStatus::Signaled,
            "TO" => MetaStatus::TimedOut,
            "XX" => MetaStatus::InternalError,
            other => MetaStatus::Unknown(other.to_string()),
        }
    }
}

/// Parsed meta file from Isolate
#[derive(Debug, Clone, Default)]
pub struct MetaFile {
    /// Raw key-value pairs from the meta file
    pub entries: HashMap<String, String>,
}

impl MetaFile {
    /// Parse meta file content from a string
    ///
    /// This is a lenient parser that skips malformed lines. For strict parsing
    /// that reports errors, use [`try_parse`](Self::try_parse).
    pub fn parse(content: &str) -> Self {
        let mut entries = HashMap::new();

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            // The value is everything after the first colon
            if let Some((key, value)) = line.split_once(':') {
                let key = key.trim();
                if !key.is_empty() {
                    entries.insert(key.to_string(), value.trim().to_string());
                }
            }
        }

        Self { entries }
    }

    /// Parse meta file content, failing on the first malformed line
    pub fn try_parse(content: &str) -> Result<Self, MetaParseError> {
        let mut entries = HashMap::new();

        for (line_idx, line) in content.lines().enumerate() {
            let line_number = line_idx + 1;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let Some((key, value)) = trimmed.split_once(':') else {
                return Err(MetaParseError {
                    line_number,
                    line: line.to_string(),
                    message: "missing colon separator".to_string(),
                });
            };
            let key = key.trim();
            if key.is_empty() {
                return Err(MetaParseError {
                    line_number,
                    line: line.to_string(),
                    message: "empty key before colon".to_string(),
                });
            }
            entries.insert(key.to_string(), value.trim().to_string());
        }

        Ok(Self { entries })
    }

    /// Load and parse a meta file from disk
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, IsolateError> {
        let content = tokio::fs::read_to_string(path.as_ref()).await?;
        Self::try_parse(&content).map_err(|e| IsolateError::MetaParseFailed(e.to_string()))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    pub fn get_i32(&self, key: &str) -> Option<i32> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    pub fn status(&self) -> MetaStatus {
        self.get("status")
            .map(MetaStatus::from_code)
            .unwrap_or(MetaStatus::Ok)
    }

    /// Wall clock time used in seconds
    pub fn wall_time(&self) -> f64 {
        self.get_f64("time-wall").unwrap_or(0.0)
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.get_i32("exitcode")
    }

    pub fn signal(&self) -> Option<i32> {
        self.get_i32("exitsig")
    }

    pub fn message(&self) -> Option<&str> {
        self.get("message")
    }

    /// How the program ended, or an error if isolate itself failed
    pub fn exit_kind(&self) -> Result<ExitKind, IsolateError> {
        let message = |fallback: &str| self.message().unwrap_or(fallback).to_string();

        match self.status() {
            MetaStatus::Ok => Ok(ExitKind::Code(self.exit_code().unwrap_or(0))),
            MetaStatus::RuntimeError => Ok(match self.exit_code() {
                Some(code) => ExitKind::Code(code),
                None => ExitKind::Killed(message("runtime error")),
            }),
            MetaStatus::Signaled => Ok(match self.signal() {
                Some(signal) => ExitKind::Signal(signal),
                None => ExitKind::Killed(message("killed by a signal")),
            }),
            MetaStatus::TimedOut => Ok(ExitKind::Killed(message("time limit exceeded"))),
            MetaStatus::InternalError => Err(IsolateError::CommandFailed(message("internal error"))),
            MetaStatus::Unknown(code) => Err(IsolateError::MetaParseFailed(format!(
                "unknown status {code:?}"
            ))),
        }
    }
}

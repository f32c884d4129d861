//! Structured diagnostics extracted from build and test output.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Hint,
    Warning,
    Error,
}

/// Pipeline stage that produced a diagnostic.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticSource {
    Compiler,
    TestRunner,
    Timeout,
    Provisioning,
    Generator,
}

impl fmt::Display for DiagnosticSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DiagnosticSource::Compiler => "compiler",
            DiagnosticSource::TestRunner => "test",
            DiagnosticSource::Timeout => "timeout",
            DiagnosticSource::Provisioning => "provisioning",
            DiagnosticSource::Generator => "generator",
        };
        f.write_str(s)
    }
}

/// A single normalized diagnostic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Diagnostic {
    pub severity: Severity,

    /// Tool-specific code (e.g. "E0308", "TS2322") or failing test name.
    pub code: Option<String>,

    pub message: String,

    /// Source file path, relative to the environment work dir when known.
    pub file: Option<String>,

    /// Line number (1-indexed).
    pub line: Option<u32>,

    /// Column number (1-indexed).
    pub column: Option<u32>,

    pub source: DiagnosticSource,

    /// Evidence snippet from the original output.
    pub evidence: Option<String>,
}

impl Diagnostic {
    pub fn new(severity: Severity, message: impl Into<String>, source: DiagnosticSource) -> Self {
        Self {
            severity,
            code: None,
            message: message.into(),
            file: None,
            line: None,
            column: None,
            source,
            evidence: None,
        }
    }

    pub fn error(message: impl Into<String>, source: DiagnosticSource) -> Self {
        Self::new(Severity::Error, message, source)
    }

    /// The distinguished diagnostic recorded when work exceeds its wall-clock budget.
    pub fn timeout(what: &str, limit_ms: u64) -> Self {
        Self::error(
            format!("{} exceeded its time limit of {}ms", what, limit_ms),
            DiagnosticSource::Timeout,
        )
        .with_code("timeout")
    }

    pub fn with_location(mut self, file: impl Into<String>, line: u32, column: u32) -> Self {
        self.file = Some(file.into());
        self.line = Some(line);
        self.column = Some(column);
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_evidence(mut self, evidence: impl Into<String>) -> Self {
        self.evidence = Some(evidence.into());
        self
    }

    pub fn is_timeout(&self) -> bool {
        self.source == DiagnosticSource::Timeout
    }

    /// One-line rendering used in repair prompts and CLI output.
    pub fn render(&self) -> String {
        let mut out = format!("[{}]", self.source);
        if let Some(code) = &self.code {
            out.push_str(&format!(" {}", code));
        }
        if let Some(file) = &self.file {
            out.push_str(&format!(" {}", file));
            if let (Some(line), Some(col)) = (self.line, self.column) {
                out.push_str(&format!(":{}:{}", line, col));
            }
        }
        out.push_str(&format!(": {}", self.message));
        out
    }
}

//! Turn raw build and test output into structured diagnostics.
//!
//! Recognised formats:
//! - rustc: `error[E0308]: message` followed by ` --> file:line:col`
//! - tsc: `file(line,col): error TS2322: message` and `file:line:col - error TS2322: message`
//! - gcc/go style: `file:line:col: error: message`
//! - cargo test: `test name ... FAILED`
//! - jest/vitest: `✕ name`, `× name`, `FAIL path`
//! - pytest: `FAILED path::name - message`
//! - go test: `--- FAIL: Name`
//!
//! The exit code is the primary pass/fail signal. The keyword heuristic in
//! [`output_indicates_failure`] is used only when no exit code is available.

use std::sync::OnceLock;

use regex::Regex;
use sandbox_manager::ExecOutput;

use crate::domain::{Diagnostic, DiagnosticSource, Severity, StepResult, StepStatus};

/// Lines of output kept in `StepResult::log_excerpt`.
const EXCERPT_LINES: usize = 40;

struct Patterns {
    rustc_header: Regex,
    rustc_location: Regex,
    tsc_paren: Regex,
    tsc_dash: Regex,
    gcc_style: Regex,
    bare_error: Regex,
    cargo_test_failed: Regex,
    jest_failed: Regex,
    jest_file_failed: Regex,
    pytest_failed: Regex,
    go_test_failed: Regex,
    panic: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let re = |p: &str| Regex::new(p).unwrap_or_else(|e| panic!("invalid pattern {p}: {e}"));
        Patterns {
            rustc_header: re(r"^(error|warning)(?:\[(\w+)\])?: (.+)$"),
            rustc_location: re(r"^\s*--> (.+?):(\d+):(\d+)"),
            tsc_paren: re(r"^(.+?)\((\d+),(\d+)\): (error|warning) (TS\d+): (.+)$"),
            tsc_dash: re(r"^(.+?):(\d+):(\d+) - (error|warning) (TS\d+): (.+)$"),
            gcc_style: re(r"^(.+?):(\d+):(\d+): (error|warning|fatal error): (.+)$"),
            bare_error: re(r"^(?i:error):?\s+(.+)$"),
            cargo_test_failed: re(r"^test (\S+) \.\.\. FAILED$"),
            jest_failed: re(r"^\s*(?:✕|×) (.+?)(?: \(\d+\s?ms\))?$"),
            jest_file_failed: re(r"^FAIL (\S+)"),
            pytest_failed: re(r"^FAILED (\S+)(?: - (.+))?$"),
            go_test_failed: re(r"^\s*--- FAIL: (\S+)"),
            panic: re(r"^thread '(.+?)' panicked at (.+)$"),
        }
    })
}

fn severity_of(word: &str) -> Severity {
    if word == "warning" {
        Severity::Warning
    } else {
        Severity::Error
    }
}

fn flush(pending: Option<Diagnostic>, out: &mut Vec<Diagnostic>) {
    if let Some(d) = pending {
        if d.severity == Severity::Error {
            out.push(d);
        }
    }
}

fn num(s: &str) -> u32 {
    s.parse().unwrap_or(0)
}

/// Parse compiler errors from build output. Warnings are dropped; only errors
/// are actionable for a repair attempt.
pub fn parse_build_output(text: &str, max: usize) -> Vec<Diagnostic> {
    let p = patterns();
    let mut out: Vec<Diagnostic> = Vec::new();
    let mut pending: Option<Diagnostic> = None;

    for line in text.lines() {
        if let Some(c) = p.rustc_location.captures(line) {
            if let Some(d) = pending.take() {
                pending = Some(d.with_location(&c[1], num(&c[2]), num(&c[3])));
                continue;
            }
        }
        if let Some(c) = p.tsc_paren.captures(line) {
            flush(pending.take(), &mut out);
            out.push(
                Diagnostic::new(severity_of(&c[4]), &c[6], DiagnosticSource::Compiler)
                    .with_code(&c[5])
                    .with_location(&c[1], num(&c[2]), num(&c[3]))
                    .with_evidence(line.trim()),
            );
        } else if let Some(c) = p.tsc_dash.captures(line) {
            flush(pending.take(), &mut out);
            out.push(
                Diagnostic::new(severity_of(&c[4]), &c[6], DiagnosticSource::Compiler)
                    .with_code(&c[5])
                    .with_location(&c[1], num(&c[2]), num(&c[3]))
                    .with_evidence(line.trim()),
            );
        } else if let Some(c) = p.gcc_style.captures(line) {
            flush(pending.take(), &mut out);
            out.push(
                Diagnostic::new(severity_of(&c[4]), &c[5], DiagnosticSource::Compiler)
                    .with_location(&c[1], num(&c[2]), num(&c[3]))
                    .with_evidence(line.trim()),
            );
        } else if let Some(c) = p.rustc_header.captures(line) {
            flush(pending.take(), &mut out);
            // Summary lines like "error: could not compile" carry no detail.
            if c[3].starts_with("could not compile") || c[3].starts_with("aborting due to") {
                continue;
            }
            let mut d = Diagnostic::new(severity_of(&c[1]), &c[3], DiagnosticSource::Compiler)
                .with_evidence(line.trim());
            if let Some(code) = c.get(2) {
                d = d.with_code(code.as_str());
            }
            pending = Some(d);
        }
        if out.len() >= max {
            break;
        }
    }
    flush(pending.take(), &mut out);

    if out.is_empty() {
        for line in text.lines() {
            if let Some(c) = p.bare_error.captures(line.trim()) {
                out.push(
                    Diagnostic::error(&c[1], DiagnosticSource::Compiler).with_evidence(line.trim()),
                );
                if out.len() >= max {
                    break;
                }
            }
        }
    }
    out.truncate(max);
    out
}

/// Parse failing tests from test runner output.
pub fn parse_test_output(text: &str, max: usize) -> Vec<Diagnostic> {
    let p = patterns();
    let mut out = Vec::new();

    for line in text.lines() {
        let trimmed = line.trim_end();
        let diagnostic = if let Some(c) = p.cargo_test_failed.captures(trimmed) {
            Some(Diagnostic::error(format!("test {} failed", &c[1]), DiagnosticSource::TestRunner).with_code(&c[1]))
        } else if let Some(c) = p.panic.captures(trimmed) {
            Some(Diagnostic::error(format!("panicked at {}", &c[2]), DiagnosticSource::TestRunner).with_code(&c[1]))
        } else if let Some(c) = p.jest_failed.captures(trimmed) {
            Some(Diagnostic::error(format!("test failed: {}", c[1].trim()), DiagnosticSource::TestRunner).with_code(c[1].trim()))
        } else if let Some(c) = p.jest_file_failed.captures(trimmed) {
            Some(Diagnostic::error("test suite failed", DiagnosticSource::TestRunner).with_location(&c[1], 0, 0))
        } else if let Some(c) = p.pytest_failed.captures(trimmed) {
            let message = c.get(2).map(|m| m.as_str()).unwrap_or("test failed");
            Some(Diagnostic::error(message, DiagnosticSource::TestRunner).with_code(&c[1]))
        } else if let Some(c) = p.go_test_failed.captures(trimmed) {
            Some(Diagnostic::error(format!("test {} failed", &c[1]), DiagnosticSource::TestRunner).with_code(&c[1]))
        } else {
            None
        };
        if let Some(d) = diagnostic {
            out.push(d.with_evidence(trimmed.trim()));
            if out.len() >= max {
                break;
            }
        }
    }
    out
}

/// Keyword heuristic for runners that give no usable exit code.
pub fn output_indicates_failure(text: &str) -> bool {
    let lower = text.to_lowercase();
    if lower.contains("all tests passed") || lower.contains("0 failed") {
        return false;
    }
    ["failed", "error", "failing"]
        .iter()
        .any(|keyword| lower.contains(keyword))
}

/// Last `n` lines of `text`.
pub fn tail(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    Setup,
    Build,
    Test,
}

impl StepKind {
    fn label(self) -> &'static str {
        match self {
            StepKind::Setup => "setup",
            StepKind::Build => "build",
            StepKind::Test => "test suite",
        }
    }

    fn source(self) -> DiagnosticSource {
        match self {
            StepKind::Setup => DiagnosticSource::Provisioning,
            StepKind::Build => DiagnosticSource::Compiler,
            StepKind::Test => DiagnosticSource::TestRunner,
        }
    }
}

/// Classify one exec into a `StepResult` with parsed diagnostics.
pub fn classify_step(kind: StepKind, output: &ExecOutput, max: usize) -> StepResult {
    let combined = output.combined();
    let excerpt = tail(&combined, EXCERPT_LINES);

    if output.timed_out {
        let mut step = StepResult::timed_out(kind.label(), output.duration_ms);
        step.log_excerpt = excerpt;
        return step;
    }

    let failed = match output.exit_code {
        Some(code) => code != 0,
        None => output_indicates_failure(&combined),
    };
    if !failed {
        return StepResult {
            status: StepStatus::Passed,
            exit_code: output.exit_code,
            duration_ms: output.duration_ms,
            diagnostics: Vec::new(),
            log_excerpt: excerpt,
        };
    }

    let mut diagnostics = match kind {
        StepKind::Build => parse_build_output(&combined, max),
        StepKind::Test => {
            let mut d = parse_test_output(&combined, max);
            if d.is_empty() {
                // Test commands often compile first; surface compiler errors too.
                d = parse_build_output(&combined, max);
            }
            d
        }
        StepKind::Setup => Vec::new(),
    };
    if diagnostics.is_empty() {
        let message = match output.exit_code {
            Some(code) => format!("{} exited with code {}", kind.label(), code),
            None => format!("{} reported failure", kind.label()),
        };
        diagnostics.push(
            Diagnostic::error(message, kind.source()).with_evidence(tail(&combined, 20)),
        );
    }

    StepResult {
        status: StepStatus::Failed,
        exit_code: output.exit_code,
        duration_ms: output.duration_ms,
        diagnostics,
        log_excerpt: excerpt,
    }
}

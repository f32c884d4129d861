//! Generation attempts: one generate -> build -> test cycle and its record.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::AddAssign;

use chrono::{DateTime, Utc};
use sandbox_manager::FileWrite;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::diagnostic::{Diagnostic, Severity};
use super::request::GenerationRequest;

/// Candidate files keyed by relative path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileSet(BTreeMap<String, String>);

impl FileSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<String>, contents: impl Into<String>) {
        self.0.insert(path.into(), contents.into());
    }

    pub fn with_file(mut self, path: impl Into<String>, contents: impl Into<String>) -> Self {
        self.insert(path, contents);
        self
    }

    pub fn get(&self, path: &str) -> Option<&str> {
        self.0.get(path).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    pub fn paths(&self) -> Vec<&str> {
        self.0.keys().map(String::as_str).collect()
    }

    /// SHA-256 over paths and contents, stable across runs.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for (path, contents) in &self.0 {
            hasher.update(path.as_bytes());
            hasher.update([0u8]);
            hasher.update(contents.as_bytes());
            hasher.update([0u8]);
        }
        hex::encode(hasher.finalize())
    }

    pub fn to_writes(&self) -> Vec<FileWrite> {
        self.0
            .iter()
            .map(|(path, contents)| FileWrite::new(path.clone(), contents.clone()))
            .collect()
    }
}

impl FromIterator<(String, String)> for FileSet {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Passed,
    Failed,
    TimedOut,
    Skipped,
}

/// Outcome of one pipeline step (build or test) with parsed diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub status: StepStatus,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub diagnostics: Vec<Diagnostic>,
    /// Tail of the raw output, kept for humans.
    pub log_excerpt: String,
}

impl StepResult {
    pub fn passed(&self) -> bool {
        self.status == StepStatus::Passed
    }

    pub fn skipped() -> Self {
        Self {
            status: StepStatus::Skipped,
            exit_code: None,
            duration_ms: 0,
            diagnostics: Vec::new(),
            log_excerpt: String::new(),
        }
    }

    pub fn timed_out(what: &str, limit_ms: u64) -> Self {
        Self {
            status: StepStatus::TimedOut,
            exit_code: None,
            duration_ms: limit_ms,
            diagnostics: vec![Diagnostic::timeout(what, limit_ms)],
            log_excerpt: String::new(),
        }
    }

    /// A failure that happened before the step could run.
    pub fn failed_with(diagnostic: Diagnostic) -> Self {
        Self {
            status: StepStatus::Failed,
            exit_code: None,
            duration_ms: 0,
            log_excerpt: diagnostic.message.clone(),
            diagnostics: vec![diagnostic],
        }
    }
}

/// Token, time and dollar cost of an attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AttemptCost {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub wall_time_ms: u64,
    pub estimated_usd: f64,
}

impl AddAssign for AttemptCost {
    fn add_assign(&mut self, other: Self) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.wall_time_ms += other.wall_time_ms;
        self.estimated_usd += other.estimated_usd;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Passed,
    CompileFailed,
    TestFailed,
    /// Work exceeded its wall-clock budget; a test failure with a timeout tag.
    TimedOut,
    ProvisioningFailed,
    /// The repository could not be checked out; new code cannot fix that.
    SetupFailed,
    GenerationFailed,
}

impl AttemptOutcome {
    pub fn is_success(self) -> bool {
        self == AttemptOutcome::Passed
    }
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AttemptOutcome::Passed => "passed",
            AttemptOutcome::CompileFailed => "compile_failed",
            AttemptOutcome::TestFailed => "test_failed",
            AttemptOutcome::TimedOut => "timed_out",
            AttemptOutcome::ProvisioningFailed => "provisioning_failed",
            AttemptOutcome::SetupFailed => "setup_failed",
            AttemptOutcome::GenerationFailed => "generation_failed",
        };
        f.write_str(s)
    }
}

/// Append-only record of one generate -> build -> test cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationAttempt {
    pub attempt_number: u32,
    pub input: GenerationRequest,
    pub produced_files: FileSet,
    pub files_digest: String,
    pub model: Option<String>,
    pub compile_result: StepResult,
    pub test_result: Option<StepResult>,
    /// Diff of the working tree after the run, for repository-backed work.
    pub patch: Option<String>,
    pub cost: AttemptCost,
    pub outcome: AttemptOutcome,
    pub environment_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl GenerationAttempt {
    pub fn compiled(&self) -> bool {
        self.compile_result.passed()
    }

    pub fn tests_passed(&self) -> bool {
        self.test_result.as_ref().map(StepResult::passed).unwrap_or(false)
    }

    pub fn timed_out(&self) -> bool {
        self.outcome == AttemptOutcome::TimedOut
    }

    /// Diagnostics from every step, compile first.
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        let mut out = self.compile_result.diagnostics.clone();
        if let Some(test) = &self.test_result {
            out.extend(test.diagnostics.iter().cloned());
        }
        out
    }

    /// First error message, for summaries.
    pub fn headline(&self) -> Option<String> {
        self.diagnostics()
            .into_iter()
            .find(|d| d.severity == Severity::Error)
            .map(|d| d.render())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_set_digest_is_order_independent() {
        let a = FileSet::new()
            .with_file("src/a.ts", "export const a = 1;")
            .with_file("src/b.ts", "export const b = 2;");
        let b = FileSet::new()
            .with_file("src/b.ts", "export const b = 2;")
            .with_file("src/a.ts", "export const a = 1;");
        assert_eq!(a.digest(), b.digest());
        assert_eq!(a.digest().len(), 64);

        let c = a.clone().with_file("src/a.ts", "export const a = 3;");
        assert_ne!(a.digest(), c.digest());
    }

    #[test]
    fn test_cost_accumulates() {
        let mut total = AttemptCost::default();
        total += AttemptCost {
            prompt_tokens: 100,
            completion_tokens: 50,
            wall_time_ms: 1_000,
            estimated_usd: 0.25,
        };
        total += AttemptCost {
            prompt_tokens: 10,
            completion_tokens: 5,
            wall_time_ms: 500,
            estimated_usd: 0.25,
        };
        assert_eq!(total.prompt_tokens, 110);
        assert_eq!(total.wall_time_ms, 1_500);
        assert!((total.estimated_usd - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_timed_out_step_carries_timeout_diagnostic() {
        let step = StepResult::timed_out("build", 1000);
        assert_eq!(step.status, StepStatus::TimedOut);
        assert!(!step.passed());
        assert!(step.diagnostics[0].is_timeout());
    }
}

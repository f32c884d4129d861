//! Repair-task datasets.
//!
//! Accepts a JSON array or JSON Lines, with either normalized entries or
//! upstream Multi-SWE-bench entries (`org`, `repo`, `number`, `base.sha`,
//! `body`, `fix_patch`). Predictions files (`instance_id`, `model_patch`,
//! `model_name`) use the same two layouts.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::domain::{AutocoderError, ComponentSpecification, Result, TargetType, TestScenario};

const DEFAULT_LANGUAGE: &str = "typescript";

/// One repair task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BenchmarkTask {
    pub instance_id: String,
    pub repo_url: String,
    pub base_commit: Option<String>,
    pub language: String,
    pub difficulty: Option<String>,
    pub title: String,
    pub problem_statement: String,
    /// Tests that judge the fix, applied before the candidate files.
    pub test_patch: Option<String>,
    /// Reference fix, kept for reporting only.
    pub expected_patch: Option<String>,
    pub build_command: Option<String>,
    pub test_command: Option<String>,
}

impl BenchmarkTask {
    /// Specification for "produce a patch resolving this issue".
    pub fn to_specification(&self) -> ComponentSpecification {
        let mut description = String::new();
        if !self.title.is_empty() {
            description.push_str(&self.title);
            description.push_str("\n\n");
        }
        description.push_str(&self.problem_statement);
        if description.trim().is_empty() {
            description = format!("Resolve {}", self.instance_id);
        }

        let mut spec = ComponentSpecification::new(
            self.instance_id.clone(),
            description,
            TargetType::Patch,
            self.language.clone(),
        )
        .with_repository(self.repo_url.clone(), self.base_commit.clone())
        .with_commands(self.build_command.clone(), self.test_command.clone())
        .with_scenario(TestScenario::new(
            "regression",
            "the tests added by the task's test patch pass without breaking existing tests",
        ));
        if let Some(patch) = &self.test_patch {
            if !patch.trim().is_empty() {
                spec = spec.with_test_patch(patch.clone());
            }
        }
        spec
    }
}

#[derive(Debug, Deserialize)]
struct BaseRef {
    sha: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum IssueNumber {
    Int(u64),
    Text(String),
}

impl IssueNumber {
    fn render(&self) -> String {
        match self {
            IssueNumber::Int(n) => n.to_string(),
            IssueNumber::Text(s) => s.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawEntry {
    #[serde(default)]
    instance_id: Option<String>,
    #[serde(default)]
    org: Option<String>,
    #[serde(default)]
    repo: Option<String>,
    #[serde(default)]
    number: Option<IssueNumber>,
    #[serde(default)]
    repo_url: Option<String>,
    #[serde(default)]
    base: Option<BaseRef>,
    #[serde(default)]
    base_commit: Option<String>,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    difficulty: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default, alias = "body")]
    problem_statement: Option<String>,
    #[serde(default)]
    test_patch: Option<String>,
    #[serde(default, alias = "fix_patch", alias = "patch")]
    expected_patch: Option<String>,
    #[serde(default)]
    build_command: Option<String>,
    #[serde(default)]
    test_command: Option<String>,
}

impl RawEntry {
    fn normalize(self, position: usize) -> Result<BenchmarkTask> {
        let upstream_id = match (&self.org, &self.repo, &self.number) {
            (Some(org), Some(repo), Some(number)) => {
                Some(format!("{}__{}-{}", org, repo, number.render()))
            }
            _ => None,
        };
        let instance_id = self
            .instance_id
            .clone()
            .or(upstream_id)
            .ok_or_else(|| {
                AutocoderError::Dataset(format!(
                    "entry {}: missing instance_id (or org/repo/number)",
                    position
                ))
            })?;

        let repo_url = match (self.repo_url, &self.org, &self.repo) {
            (Some(url), _, _) => url,
            (None, Some(org), Some(repo)) => format!("https://github.com/{}/{}", org, repo),
            _ => {
                return Err(AutocoderError::Dataset(format!(
                    "entry {} ({}): missing repository reference",
                    position, instance_id
                )))
            }
        };

        Ok(BenchmarkTask {
            instance_id,
            repo_url,
            base_commit: self.base_commit.or(self.base.map(|b| b.sha)),
            language: self
                .language
                .map(|l| l.to_lowercase())
                .unwrap_or_else(|| DEFAULT_LANGUAGE.to_string()),
            difficulty: self.difficulty.map(|d| d.to_lowercase()),
            title: self.title.unwrap_or_default(),
            problem_statement: self.problem_statement.unwrap_or_default(),
            test_patch: self.test_patch,
            expected_patch: self.expected_patch,
            build_command: self.build_command,
            test_command: self.test_command,
        })
    }
}

/// A candidate fix produced elsewhere, to be verified rather than generated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prediction {
    pub instance_id: String,
    /// Unified diff against the task's base commit. Missing or null means empty.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub model_patch: String,
    #[serde(default = "unknown_model", alias = "model_name_or_path")]
    pub model_name: String,
}

fn unknown_model() -> String {
    "unknown".to_string()
}

fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

fn parse_entries<T: serde::de::DeserializeOwned>(text: &str) -> Result<Vec<T>> {
    let trimmed = text.trim_start();
    if trimmed.starts_with('[') {
        return serde_json::from_str(trimmed)
            .map_err(|e| AutocoderError::Dataset(format!("invalid JSON array: {}", e)));
    }
    let mut entries = Vec::new();
    for (index, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let entry = serde_json::from_str(line)
            .map_err(|e| AutocoderError::Dataset(format!("line {}: {}", index + 1, e)))?;
        entries.push(entry);
    }
    Ok(entries)
}

/// Parse predictions from JSON Lines (or a JSON array).
pub fn parse_predictions(text: &str) -> Result<Vec<Prediction>> {
    let predictions: Vec<Prediction> = parse_entries(text)?;
    let mut seen = HashSet::new();
    for prediction in &predictions {
        if prediction.instance_id.trim().is_empty() {
            return Err(AutocoderError::Dataset("prediction with empty instance_id".to_string()));
        }
        if !seen.insert(prediction.instance_id.as_str()) {
            return Err(AutocoderError::Dataset(format!(
                "duplicate prediction for {}",
                prediction.instance_id
            )));
        }
    }
    Ok(predictions)
}

pub fn load_predictions(path: &Path) -> Result<Vec<Prediction>> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        AutocoderError::Dataset(format!("cannot read {}: {}", path.display(), e))
    })?;
    parse_predictions(&text)
}

/// Parse a dataset from JSON array or JSON Lines text.
pub fn parse_dataset(text: &str) -> Result<Vec<BenchmarkTask>> {
    let raw: Vec<RawEntry> = parse_entries(text)?;

    let mut seen = HashSet::new();
    let mut tasks = Vec::with_capacity(raw.len());
    for (position, entry) in raw.into_iter().enumerate() {
        let task = entry.normalize(position + 1)?;
        if !seen.insert(task.instance_id.clone()) {
            return Err(AutocoderError::Dataset(format!(
                "duplicate instance_id {}",
                task.instance_id
            )));
        }
        tasks.push(task);
    }
    Ok(tasks)
}

pub fn load_dataset(path: &Path) -> Result<Vec<BenchmarkTask>> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        AutocoderError::Dataset(format!("cannot read {}: {}", path.display(), e))
    })?;
    parse_dataset(&text)
}

/// Selects which dataset entries a run replays.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetFilter {
    #[serde(default)]
    pub languages: Vec<String>,
    #[serde(default)]
    pub difficulties: Vec<String>,
    /// Explicit allow-list; empty means all.
    #[serde(default)]
    pub instance_ids: Vec<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl DatasetFilter {
    pub fn matches(&self, task: &BenchmarkTask) -> bool {
        let language_ok = self.languages.is_empty()
            || self
                .languages
                .iter()
                .any(|l| l.eq_ignore_ascii_case(&task.language));
        let difficulty_ok = self.difficulties.is_empty()
            || task.difficulty.as_deref().map_or(false, |d| {
                self.difficulties.iter().any(|want| want.eq_ignore_ascii_case(d))
            });
        let id_ok = self.instance_ids.is_empty() || self.instance_ids.contains(&task.instance_id);
        language_ok && difficulty_ok && id_ok
    }

    pub fn apply(&self, tasks: Vec<BenchmarkTask>) -> Vec<BenchmarkTask> {
        let selected = tasks.into_iter().filter(|t| self.matches(t));
        match self.limit {
            Some(limit) => selected.take(limit).collect(),
            None => selected.collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UPSTREAM: &str = r#"{"org":"acme","repo":"widgets","number":42,"base":{"sha":"abc123"},"title":"Crash on empty input","body":"Calling parse('') throws.","test_patch":"diff --git a/t.ts b/t.ts\n","fix_patch":"diff --git a/src.ts b/src.ts\n","language":"TypeScript"}"#;

    #[test]
    fn test_upstream_entry_is_normalized() {
        let tasks = parse_dataset(UPSTREAM).unwrap();
        let task = &tasks[0];
        assert_eq!(task.instance_id, "acme__widgets-42");
        assert_eq!(task.repo_url, "https://github.com/acme/widgets");
        assert_eq!(task.base_commit.as_deref(), Some("abc123"));
        assert_eq!(task.language, "typescript");
        assert_eq!(task.problem_statement, "Calling parse('') throws.");
        assert!(task.expected_patch.is_some());
    }

    #[test]
    fn test_json_array_and_lines_are_both_accepted() {
        let array = r#"[{"instance_id":"a-1","repo_url":"https://example.com/a"},{"instance_id":"b-2","repo_url":"https://example.com/b","language":"rust"}]"#;
        assert_eq!(parse_dataset(array).unwrap().len(), 2);

        let lines = "{\"instance_id\":\"a-1\",\"repo_url\":\"u\"}\n\n{\"instance_id\":\"b-2\",\"repo_url\":\"u\"}\n";
        let tasks = parse_dataset(lines).unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].language, "typescript");
    }

    #[test]
    fn test_missing_repository_is_rejected() {
        let err = parse_dataset(r#"{"instance_id":"a-1"}"#).unwrap_err();
        assert!(matches!(err, AutocoderError::Dataset(msg) if msg.contains("repository")));
    }

    #[test]
    fn test_duplicate_ids_are_rejected() {
        let lines = "{\"instance_id\":\"a\",\"repo_url\":\"u\"}\n{\"instance_id\":\"a\",\"repo_url\":\"u\"}";
        assert!(parse_dataset(lines).is_err());
    }

    #[test]
    fn test_filter_by_language_id_and_limit() {
        let lines = [
            r#"{"instance_id":"a","repo_url":"u","language":"rust","difficulty":"easy"}"#,
            r#"{"instance_id":"b","repo_url":"u","language":"typescript","difficulty":"hard"}"#,
            r#"{"instance_id":"c","repo_url":"u","language":"typescript","difficulty":"easy"}"#,
        ]
        .join("\n");
        let tasks = parse_dataset(&lines).unwrap();

        let by_language = DatasetFilter {
            languages: vec!["TypeScript".into()],
            ..DatasetFilter::default()
        };
        assert_eq!(by_language.apply(tasks.clone()).len(), 2);

        let by_difficulty = DatasetFilter {
            difficulties: vec!["easy".into()],
            limit: Some(1),
            ..DatasetFilter::default()
        };
        let picked = by_difficulty.apply(tasks.clone());
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].instance_id, "a");

        let by_id = DatasetFilter {
            instance_ids: vec!["c".into()],
            ..DatasetFilter::default()
        };
        assert_eq!(by_id.apply(tasks)[0].instance_id, "c");
    }

    #[test]
    fn test_predictions_are_parsed_from_lines() {
        let lines = concat!(
            r#"{"instance_id":"acme__widgets-42","model_patch":"diff --git a/src.ts b/src.ts\n","model_name":"gpt-x"}"#,
            "\n",
            r#"{"instance_id":"acme__widgets-43","model_patch":null,"model_name_or_path":"other"}"#,
            "\n",
            r#"{"instance_id":"acme__widgets-44"}"#,
        );
        let predictions = parse_predictions(lines).unwrap();
        assert_eq!(predictions.len(), 3);
        assert_eq!(predictions[0].model_name, "gpt-x");
        assert!(predictions[0].model_patch.starts_with("diff --git"));
        assert_eq!(predictions[1].model_name, "other");
        assert_eq!(predictions[2].model_name, "unknown");
        assert!(predictions[2].model_patch.is_empty());
    }

    #[test]
    fn test_duplicate_predictions_are_rejected() {
        let lines = "{\"instance_id\":\"a\",\"model_patch\":\"x\"}\n{\"instance_id\":\"a\",\"model_patch\":\"y\"}";
        let err = parse_predictions(lines).unwrap_err();
        assert!(matches!(err, AutocoderError::Dataset(msg) if msg.contains("duplicate")));
    }

    #[test]
    fn test_task_becomes_patch_specification() {
        let task = parse_dataset(UPSTREAM).unwrap().remove(0);
        let spec = task.to_specification();
        assert_eq!(spec.target_type, TargetType::Patch);
        assert!(spec.description.starts_with("Crash on empty input"));
        assert_eq!(spec.repository.as_ref().unwrap().base_commit.as_deref(), Some("abc123"));
        assert!(spec.test_patch.is_some());
        assert!(spec.validate().is_ok());
    }
}

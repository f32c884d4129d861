//! Deterministic prompt rendering for generation requests.

use std::fmt::Write as _;

use crate::domain::{GenerationRequest, TargetType};

/// System instructions sent with every request.
pub const SYSTEM_PROMPT: &str = "You are an expert software engineer. \
Produce complete, compilable source files together with their tests. \
Return every file as <file path=\"relative/path\">contents</file>. \
Do not include explanations outside file blocks.";

/// Prior files above this size are summarised by path only.
const MAX_PRIOR_FILE_CHARS: usize = 12_000;

pub fn render_prompt(request: &GenerationRequest) -> String {
    let spec = &request.specification;
    let mut out = String::new();

    let _ = writeln!(out, "# Task: {}", spec.name);
    let _ = writeln!(out, "Target: {} ({})", spec.target_type, spec.language);
    let _ = writeln!(out);
    let _ = writeln!(out, "{}", spec.description.trim());

    if !spec.required_capabilities.is_empty() {
        let _ = writeln!(out, "\n## Required capabilities");
        for cap in &spec.required_capabilities {
            let _ = writeln!(out, "- {}", cap);
        }
    }

    if !spec.test_scenarios.is_empty() {
        let _ = writeln!(out, "\n## Test scenarios");
        for scenario in &spec.test_scenarios {
            let _ = write!(out, "- {}: {}", scenario.name, scenario.description);
            if let Some(expected) = &scenario.expected {
                let _ = write!(out, " (expected: {})", expected);
            }
            let _ = writeln!(out);
        }
    }

    if let Some(repo) = &spec.repository {
        let _ = writeln!(out, "\n## Repository");
        let _ = writeln!(out, "{}", repo.url);
        if let Some(commit) = &repo.base_commit {
            let _ = writeln!(out, "Base commit: {}", commit);
        }
        if spec.target_type == TargetType::Patch {
            let _ = writeln!(
                out,
                "Return the full new contents of every file you change, with paths relative to the repository root."
            );
        }
    }

    if let Some(context) = &request.research_context {
        if !context.trim().is_empty() {
            let _ = writeln!(out, "\n## Context\n{}", context.trim());
        }
    }

    if request.is_repair() {
        let _ = writeln!(
            out,
            "\n## Previous attempt failed (attempt {})",
            request.attempt_number - 1
        );
        if request.prior_diagnostics.is_empty() {
            let _ = writeln!(out, "No diagnostics were captured.");
        }
        for diagnostic in &request.prior_diagnostics {
            let _ = writeln!(out, "- {}", diagnostic.render());
        }
        if let Some(files) = &request.prior_files {
            let _ = writeln!(out, "\n## Previous files");
            for (path, contents) in files.iter() {
                if contents.len() > MAX_PRIOR_FILE_CHARS {
                    let _ = writeln!(out, "<file path=\"{}\">(omitted, {} bytes)</file>", path, contents.len());
                } else {
                    let _ = writeln!(out, "<file path=\"{}\">\n{}</file>", path, contents);
                }
            }
        }
        let _ = writeln!(out, "\nFix the defects above. Return the complete corrected file set.");
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        ComponentSpecification, Diagnostic, DiagnosticSource, FileSet, TestScenario,
    };

    fn spec() -> ComponentSpecification {
        ComponentSpecification::new("add", "Add two integers.", TargetType::Function, "rust")
            .with_scenario(TestScenario::new("positive", "2 + 2 = 4"))
    }

    #[test]
    fn test_initial_prompt_has_no_repair_section() {
        let prompt = render_prompt(&GenerationRequest::initial(spec(), None));
        assert!(prompt.contains("# Task: add"));
        assert!(prompt.contains("- positive: 2 + 2 = 4"));
        assert!(!prompt.contains("Previous attempt failed"));
    }

    #[test]
    fn test_repair_prompt_carries_diagnostics_and_files() {
        let diag = Diagnostic::error("mismatched types", DiagnosticSource::Compiler)
            .with_code("E0308")
            .with_location("src/lib.rs", 1, 30);
        let files = FileSet::new().with_file("src/lib.rs", "pub fn add(a: i32, b: i32) -> i32 { \"x\" }");
        let request = GenerationRequest::repair(spec(), Some("uses std only".into()), 2, vec![diag], files);
        let prompt = render_prompt(&request);
        assert!(prompt.contains("Previous attempt failed (attempt 1)"));
        assert!(prompt.contains("E0308 src/lib.rs:1:30: mismatched types"));
        assert!(prompt.contains("<file path=\"src/lib.rs\">"));
        assert!(prompt.contains("## Context\nuses std only"));
    }

    #[test]
    fn test_rendering_is_deterministic() {
        let request = GenerationRequest::initial(spec(), Some("ctx".into()));
        assert_eq!(render_prompt(&request), render_prompt(&request));
    }
}

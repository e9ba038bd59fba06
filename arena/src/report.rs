//! Review aggregation and rendering for `arena review report`.

use std::fmt::Write as _;
use std::path::Path;

use anyhow::{Result, bail};
use serde::Serialize;
use tracing::{instrument, warn};

use crate::core::aggregate::{AgentFindings, Aggregation, MergedFinding, aggregate};
use crate::core::finding::{Category, Finding, Severity};
use crate::core::normalize::normalize;
use crate::core::types::ExecutionStatus;
use crate::io::config::ArenaConfig;
use crate::io::review_run::{ReviewMetadata, ReviewPaths, load_metadata, read_agent_output};

const NOTE_CHARS: usize = 300;
const SUGGESTION_CHARS: usize = 200;
const UNIQUE_CHARS: usize = 100;
const UNIQUE_SHOWN: usize = 10;

/// Aggregated findings of one review run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReviewReport {
    pub review_id: String,
    pub metadata: ReviewMetadata,
    #[serde(flatten)]
    pub aggregation: Aggregation,
    /// Problems reading individual agent outputs.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// Normalize and aggregate the outputs of every agent that completed.
///
/// An agent whose output file cannot be read is left out of the participant
/// set and reported as a warning.
#[instrument(skip_all, fields(review_id = %review_id))]
pub fn aggregate_review(
    reviews_dir: &Path,
    review_id: &str,
    config: &ArenaConfig,
) -> Result<ReviewReport> {
    let paths = ReviewPaths::new(reviews_dir, review_id);
    if !paths.dir.is_dir() {
        bail!("review {review_id} not found in {}", reviews_dir.display());
    }
    let metadata = load_metadata(&paths)?;
    let opts = config.aggregate.normalize_options();

    let mut agents = Vec::new();
    let mut warnings = Vec::new();
    for result in metadata
        .results
        .iter()
        .filter(|r| r.status == ExecutionStatus::Complete)
    {
        let path = result
            .output_file
            .clone()
            .unwrap_or_else(|| paths.output_path(&result.cli));
        match read_agent_output(&path) {
            Ok(record) => agents.push(AgentFindings {
                agent: result.cli.clone(),
                findings: normalize(&result.cli, &record.stdout, &opts),
            }),
            Err(err) => {
                warn!(cli = %result.cli, err = %err, "skipping unreadable agent output");
                warnings.push(format!("{}: {err:#}", result.cli));
            }
        }
    }

    let aggregation = aggregate(&agents, config.aggregate.match_threshold);
    Ok(ReviewReport {
        review_id: metadata.review_id.clone(),
        metadata,
        aggregation,
        warnings,
    })
}

fn severity_label(severity: Severity) -> &'static str {
    match severity {
        Severity::Critical => "[CRITICAL]",
        Severity::Major => "[MAJOR]",
        Severity::Minor => "[MINOR]",
        Severity::Trivial => "[TRIVIAL]",
    }
}

fn title_case(text: &str) -> String {
    text.split(['-', '_', ' '])
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

/// Single-line excerpt with an ellipsis when cut.
fn excerpt(text: &str, max_chars: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() > max_chars {
        let cut: String = flat.chars().take(max_chars).collect();
        format!("{cut}...")
    } else {
        flat
    }
}

fn location(file: Option<&str>, line: Option<u32>) -> Option<String> {
    let file = file?;
    Some(match line {
        Some(line) => format!("{file}:{line}"),
        None => file.to_string(),
    })
}

fn unique_count(report: &ReviewReport) -> usize {
    report.aggregation.unique.values().map(Vec::len).sum()
}

fn push_merged(out: &mut String, index: usize, finding: &MergedFinding) {
    let _ = writeln!(out, "### {index}. {} Issue", title_case(finding.category.as_str()));
    out.push('\n');
    if let Some(loc) = location(finding.file.as_deref(), finding.line) {
        let _ = writeln!(out, "**File**: `{loc}`");
    }
    let _ = writeln!(
        out,
        "**Severity**: {} {}",
        severity_label(finding.severity),
        title_case(finding.severity.as_str())
    );
    let _ = writeln!(out, "**Agreement**: {}", finding.sources.join(", "));
    out.push('\n');

    if !finding.descriptions.is_empty() {
        out.push_str("**Reviewer Notes**:\n");
        for (agent, description) in &finding.descriptions {
            let _ = writeln!(out, "- **{agent}**: {}", excerpt(description, NOTE_CHARS));
        }
        out.push('\n');
    }
    if !finding.suggestions.is_empty() {
        out.push_str("**Suggested Fixes**:\n");
        for suggestion in &finding.suggestions {
            let _ = writeln!(out, "- {}", excerpt(suggestion, SUGGESTION_CHARS));
        }
        out.push('\n');
    }
    out.push_str("---\n\n");
}

fn push_unique(out: &mut String, index: usize, finding: &Finding) {
    let loc = location(finding.file.as_deref(), finding.line)
        .unwrap_or_else(|| "unknown file".to_string());
    let _ = writeln!(
        out,
        "{index}. {} `{loc}` - {}",
        severity_label(finding.severity),
        excerpt(&finding.description, UNIQUE_CHARS)
    );
}

fn push_tier(
    out: &mut String,
    heading: &str,
    blurb: &str,
    empty: &str,
    findings: &[MergedFinding],
) {
    if findings.is_empty() {
        let _ = writeln!(out, "## {heading}\n\n*{empty}*\n\n---\n");
        return;
    }
    let _ = writeln!(out, "## {heading}\n\n{blurb}\n");
    for (i, finding) in findings.iter().enumerate() {
        push_merged(out, i + 1, finding);
    }
}

/// Human-readable comparison report.
pub fn render_markdown(report: &ReviewReport) -> String {
    let meta = &report.metadata;
    let agg = &report.aggregation;
    let mut out = String::new();

    out.push_str("# Multi-Agent Code Review Report\n\n");
    let _ = writeln!(out, "**Review ID**: `{}`", report.review_id);
    let _ = writeln!(out, "**Project**: `{}`", meta.project_root.display());
    let _ = writeln!(out, "**Date**: {}", meta.started_at);
    let _ = writeln!(out, "**Agents**: {}", agg.participants.join(", "));
    out.push('\n');

    if !meta.missing_clis.is_empty() {
        let _ = writeln!(
            out,
            "**Warning**: Missing agents: {}\n",
            meta.missing_clis.join(", ")
        );
    }
    let incomplete: Vec<String> = meta
        .results
        .iter()
        .filter(|r| r.status != ExecutionStatus::Complete)
        .map(|r| format!("{} ({})", r.cli, r.status))
        .collect();
    if !incomplete.is_empty() {
        let _ = writeln!(
            out,
            "**Warning**: Did not complete: {}\n",
            incomplete.join(", ")
        );
    }
    for warning in &report.warnings {
        let _ = writeln!(out, "**Warning**: {warning}\n");
    }

    out.push_str("---\n\n## Summary\n\n");
    out.push_str("| Agreement Level | Count | Description |\n");
    out.push_str("|-----------------|-------|-------------|\n");
    let _ = writeln!(
        out,
        "| Consensus | {} | All agents agree |",
        agg.consensus.len()
    );
    let _ = writeln!(out, "| Majority | {} | 2+ agents agree |", agg.majority.len());
    let _ = writeln!(
        out,
        "| Unique | {} | Only one agent found |",
        unique_count(report)
    );
    let _ = writeln!(
        out,
        "| **Total** | **{}** | All findings |",
        agg.total_findings
    );
    out.push_str("\n---\n\n");

    if !agg.by_severity.is_empty() {
        out.push_str("### By Severity\n\n");
        for severity in Severity::ALL {
            if let Some(count) = agg.by_severity.get(&severity).filter(|c| **c > 0) {
                let _ = writeln!(
                    out,
                    "- {} **{}**: {count}",
                    severity_label(severity),
                    title_case(severity.as_str())
                );
            }
        }
        out.push_str("\n---\n\n");
    }

    push_tier(
        &mut out,
        "Consensus Findings (All Agents Agree)",
        "These findings were identified by ALL reviewers - **highest confidence**.",
        "No findings where all agents agreed.",
        &agg.consensus,
    );
    push_tier(
        &mut out,
        "Majority Findings (2+ Agents Agree)",
        "These findings were identified by several reviewers - **likely valid**.",
        "No findings where 2+ agents agreed.",
        &agg.majority,
    );

    if agg.unique.values().any(|f| !f.is_empty()) {
        out.push_str("## Unique Findings\n\n");
        out.push_str(
            "These findings were only identified by one reviewer - **may need human review**.\n\n",
        );
        for (agent, findings) in &agg.unique {
            if findings.is_empty() {
                continue;
            }
            let _ = writeln!(
                out,
                "### {} Only ({} findings)\n",
                agent.to_uppercase(),
                findings.len()
            );
            for (i, finding) in findings.iter().take(UNIQUE_SHOWN).enumerate() {
                push_unique(&mut out, i + 1, finding);
            }
            if findings.len() > UNIQUE_SHOWN {
                let _ = writeln!(out, "\n*... and {} more*", findings.len() - UNIQUE_SHOWN);
            }
            out.push('\n');
        }
    }
    out
}

/// Short plain-text digest.
pub fn render_summary(report: &ReviewReport) -> String {
    let agg = &report.aggregation;
    let mut out = String::new();
    let _ = writeln!(out, "review: {}", report.review_id);
    let _ = writeln!(out, "agents: {}", agg.participants.join(", "));
    let _ = writeln!(
        out,
        "findings: {} (consensus {}, majority {}, unique {})",
        agg.total_findings,
        agg.consensus.len(),
        agg.majority.len(),
        unique_count(report)
    );
    let severities: Vec<String> = Severity::ALL
        .iter()
        .map(|s| format!("{} {}", s, agg.by_severity.get(s).copied().unwrap_or(0)))
        .collect();
    let _ = writeln!(out, "severity: {}", severities.join(", "));
    let categories: Vec<String> = Category::ALL
        .iter()
        .filter_map(|c| agg.by_category.get(c).map(|n| format!("{c} {n}")))
        .collect();
    if !categories.is_empty() {
        let _ = writeln!(out, "category: {}", categories.join(", "));
    }
    for warning in &report.warnings {
        let _ = writeln!(out, "warning: {warning}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ExecutionResult;
    use crate::io::review_run::{AgentOutputRecord, write_agent_output, write_metadata};
    use std::path::PathBuf;

    fn record(cli: &str, stdout: &str) -> AgentOutputRecord {
        AgentOutputRecord {
            cli: cli.to_string(),
            model: None,
            stdout: stdout.to_string(),
            stderr: String::new(),
            exit_code: Some(0),
            timed_out: false,
            stdout_truncated: 0,
            stderr_truncated: 0,
            timestamp: "2026-01-01T00:00:00Z".to_string(),
        }
    }

    fn result(cli: &str, status: ExecutionStatus) -> ExecutionResult {
        ExecutionResult {
            status,
            ..ExecutionResult::pending(cli)
        }
    }

    fn seed(root: &Path, outputs: &[(&str, ExecutionStatus, Option<&str>)]) -> String {
        let id = "review-20260101_000000-abcdef12";
        let paths = ReviewPaths::new(root, id);
        let mut results = Vec::new();
        for (cli, status, stdout) in outputs {
            if let Some(stdout) = stdout {
                write_agent_output(&paths.output_path(cli), &record(cli, stdout)).expect("write");
            }
            results.push(result(cli, *status));
        }
        let meta = ReviewMetadata {
            review_id: id.to_string(),
            project_root: PathBuf::from("/repo"),
            prompt_hash: "0".repeat(16),
            prompt_length: 3,
            requested_clis: outputs.iter().map(|o| o.0.to_string()).collect(),
            available_clis: outputs.iter().map(|o| o.0.to_string()).collect(),
            missing_clis: vec!["codex".to_string()],
            timeout_minutes: 10,
            started_at: "2026-01-01T00:00:00Z".to_string(),
            completed_at: Some("2026-01-01T00:05:00Z".to_string()),
            results,
        };
        write_metadata(&paths, &meta).expect("metadata");
        id.to_string()
    }

    const CLAUDE_JSON: &str = r#"[{"severity":"critical","category":"security","file":"src/db.rs","line":42,"description":"SQL injection via string formatting of user input"}]"#;
    const GEMINI_JSON: &str = r#"{"findings":[{"severity":"high","type":"security","path":"src/db.rs","line":43,"message":"User input formatted into SQL query allows injection"}]}"#;

    #[test]
    fn only_completed_agents_participate() {
        let temp = tempfile::tempdir().expect("tempdir");
        let id = seed(
            temp.path(),
            &[
                ("claude", ExecutionStatus::Complete, Some(CLAUDE_JSON)),
                ("gemini", ExecutionStatus::Complete, Some(GEMINI_JSON)),
                ("qwen", ExecutionStatus::Failed, Some(CLAUDE_JSON)),
            ],
        );
        let report = aggregate_review(temp.path(), &id, &ArenaConfig::default()).expect("report");
        assert_eq!(report.aggregation.participants, vec!["claude", "gemini"]);
        assert_eq!(report.aggregation.total_findings, 2);
        assert_eq!(report.aggregation.majority.len(), 1);
        let merged = &report.aggregation.majority[0];
        assert_eq!(merged.severity, Severity::Critical);
        assert_eq!(merged.sources, vec!["claude", "gemini"]);
    }

    #[test]
    fn unreadable_output_becomes_warning() {
        let temp = tempfile::tempdir().expect("tempdir");
        let id = seed(
            temp.path(),
            &[
                ("claude", ExecutionStatus::Complete, Some(CLAUDE_JSON)),
                ("gemini", ExecutionStatus::Complete, None),
            ],
        );
        let report = aggregate_review(temp.path(), &id, &ArenaConfig::default()).expect("report");
        assert_eq!(report.aggregation.participants, vec!["claude"]);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].starts_with("gemini:"));
    }

    #[test]
    fn unknown_review_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = aggregate_review(temp.path(), "review-nope", &ArenaConfig::default())
            .expect_err("missing");
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn markdown_has_summary_and_warnings() {
        let temp = tempfile::tempdir().expect("tempdir");
        let id = seed(
            temp.path(),
            &[
                ("claude", ExecutionStatus::Complete, Some(CLAUDE_JSON)),
                ("gemini", ExecutionStatus::Complete, Some(GEMINI_JSON)),
                ("qwen", ExecutionStatus::Timeout, None),
            ],
        );
        let report = aggregate_review(temp.path(), &id, &ArenaConfig::default()).expect("report");
        let md = render_markdown(&report);
        assert!(md.contains("**Warning**: Missing agents: codex"));
        assert!(md.contains("Did not complete: qwen (timeout)"));
        assert!(md.contains("| Majority | 1 | 2+ agents agree |"));
        assert!(md.contains("### 1. Security Issue"));
        assert!(md.contains("**File**: `src/db.rs:42`"));
        assert!(md.contains("[CRITICAL] Critical"));
        assert!(md.contains("*No findings where all agents agreed.*"));

        let summary = render_summary(&report);
        assert!(summary.contains("findings: 2 (consensus 0, majority 1, unique 0)"));
    }

    #[test]
    fn excerpt_flattens_and_cuts() {
        assert_eq!(excerpt("a\n b   c", 10), "a b c");
        assert_eq!(excerpt("abcdef", 3), "abc...");
        assert_eq!(title_case("best-practices"), "Best Practices");
    }
}

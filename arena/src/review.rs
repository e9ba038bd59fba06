//! Parallel review runs: the same prompt sent to several agent CLIs at once.
//!
//! Each available agent runs on its own scoped thread. Results come back over a
//! channel in completion order; one agent failing, timing out or refusing to
//! start never affects the others. Artifacts land under
//! `<reviews dir>/<review id>/` (see [`crate::io::review_run`]).

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::core::heuristics::truncate_chars;
use crate::core::types::{ExecutionResult, ExecutionStatus};
use crate::io::agents::{AgentInvocation, AgentRunner, LaunchMode};
use crate::io::config::ArenaConfig;
use crate::io::process::CommandOutput;
use crate::io::review_run::{
    AgentOutputRecord, ReviewMetadata, ReviewPaths, generate_review_id, prompt_hash,
    write_agent_output, write_metadata,
};
use crate::io::timestamp::now_rfc3339;

/// Inputs for one review run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewRequest {
    /// Agents to ask, in order. Duplicates are ignored.
    pub clis: Vec<String>,
    pub prompt: String,
    /// Working directory for every agent.
    pub project_root: PathBuf,
    pub timeout_minutes: u64,
    /// Per-agent model overrides.
    pub models: BTreeMap<String, String>,
}

/// Result of [`run_review`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReviewOutcome {
    /// At least one agent completed.
    pub success: bool,
    pub review_id: String,
    pub output_dir: PathBuf,
    /// Per-agent results in completion order.
    pub results: Vec<ExecutionResult>,
    pub missing_clis: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ReviewOutcome {
    /// True when the run never started because nothing was installed.
    pub fn no_agents_available(&self) -> bool {
        !self.success && self.results.is_empty()
    }
}

/// Run `request` against every available agent in parallel.
///
/// `Err` is reserved for failures of the run itself (unusable artifact
/// directory, invalid request). Agent failures are reported in the outcome.
#[instrument(skip_all, fields(clis = ?request.clis, timeout_minutes = request.timeout_minutes))]
pub fn run_review<R: AgentRunner>(
    runner: &R,
    config: &ArenaConfig,
    reviews_dir: &Path,
    request: &ReviewRequest,
) -> Result<ReviewOutcome> {
    let requested = dedupe(&request.clis);
    if requested.is_empty() {
        bail!("no agents requested");
    }
    if request.timeout_minutes == 0 {
        bail!("timeout must be at least one minute");
    }
    let timeout = request
        .timeout_minutes
        .checked_mul(60)
        .map(Duration::from_secs)
        .ok_or_else(|| anyhow!("timeout of {} minutes is too large", request.timeout_minutes))?;

    let (available, missing): (Vec<String>, Vec<String>) = requested
        .iter()
        .cloned()
        .partition(|cli| config.agent(cli).is_some() && runner.is_available(cli));
    if !missing.is_empty() {
        warn!(missing = ?missing, "some agents are not available");
    }

    let review_id = generate_review_id();
    let paths = ReviewPaths::new(reviews_dir, &review_id);
    fs::create_dir_all(&paths.dir)
        .with_context(|| format!("create review dir {}", paths.dir.display()))?;

    let mut metadata = ReviewMetadata {
        review_id: review_id.clone(),
        project_root: request.project_root.clone(),
        prompt_hash: prompt_hash(&request.prompt),
        prompt_length: request.prompt.chars().count(),
        requested_clis: requested,
        available_clis: available.clone(),
        missing_clis: missing.clone(),
        timeout_minutes: request.timeout_minutes,
        started_at: now_rfc3339(),
        completed_at: None,
        results: available
            .iter()
            .map(|cli| ExecutionResult::pending(cli))
            .collect(),
    };
    write_metadata(&paths, &metadata)?;

    if available.is_empty() {
        metadata.completed_at = Some(now_rfc3339());
        write_metadata(&paths, &metadata)?;
        return Ok(ReviewOutcome {
            success: false,
            review_id,
            output_dir: paths.dir,
            results: Vec::new(),
            error: Some(format!(
                "No agents available. Missing: {}",
                missing.join(", ")
            )),
            missing_clis: missing,
        });
    }

    info!(review_id = %review_id, agents = available.len(), "starting review");
    let mut results = Vec::with_capacity(available.len());
    thread::scope(|scope| {
        let (tx, rx) = mpsc::channel();
        for cli in &available {
            let tx = tx.clone();
            let paths = &paths;
            scope.spawn(move || {
                let result = run_agent(runner, config, paths, request, cli, timeout);
                // The receiver outlives every sender inside this scope.
                let _ = tx.send(result);
            });
        }
        drop(tx);
        for result in rx {
            info!(cli = %result.cli, status = %result.status, "agent finished");
            if let Some(slot) = metadata.results.iter_mut().find(|r| r.cli == result.cli) {
                *slot = result.clone();
            }
            if let Err(err) = write_metadata(&paths, &metadata) {
                warn!(err = %err, "failed to record intermediate review progress");
            }
            results.push(result);
        }
    });

    metadata.completed_at = Some(now_rfc3339());
    write_metadata(&paths, &metadata)?;

    let success = results
        .iter()
        .any(|r| r.status == ExecutionStatus::Complete);
    let error = (!success).then(|| {
        let parts: Vec<String> = results
            .iter()
            .map(|r| match &r.error {
                Some(err) => format!("{} {}: {}", r.cli, r.status, err),
                None => format!("{} {}", r.cli, r.status),
            })
            .collect();
        format!("All agents failed: {}", parts.join("; "))
    });
    info!(review_id = %review_id, success, "review finished");

    Ok(ReviewOutcome {
        success,
        review_id,
        output_dir: paths.dir,
        results,
        missing_clis: missing,
        error,
    })
}

fn dedupe(clis: &[String]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    clis.iter()
        .map(|c| c.trim())
        .filter(|c| !c.is_empty() && seen.insert(c.to_string()))
        .map(str::to_string)
        .collect()
}

#[instrument(skip_all, fields(cli = %cli))]
fn run_agent<R: AgentRunner>(
    runner: &R,
    config: &ArenaConfig,
    paths: &ReviewPaths,
    request: &ReviewRequest,
    cli: &str,
    timeout: Duration,
) -> ExecutionResult {
    let excerpt_chars = config.review.error_excerpt_chars;
    let mut result = ExecutionResult {
        status: ExecutionStatus::Running,
        started_at: Some(now_rfc3339()),
        ..ExecutionResult::pending(cli)
    };

    let invocation = match AgentInvocation::build(
        config,
        cli,
        &request.prompt,
        request.models.get(cli).map(String::as_str),
        LaunchMode::Review,
        &request.project_root,
    ) {
        Ok(invocation) => invocation,
        Err(err) => return finish_error(result, &err, excerpt_chars),
    };

    let output = match runner.run(&invocation, timeout, config.review.output_limit_bytes) {
        Ok(output) => output,
        Err(err) => return finish_error(result, &err, excerpt_chars),
    };

    let output_path = paths.output_path(cli);
    let record = AgentOutputRecord {
        cli: cli.to_string(),
        model: invocation.model.clone(),
        stdout: output.stdout_text(),
        stderr: output.stderr_text(),
        exit_code: output.exit_code,
        timed_out: output.timed_out,
        stdout_truncated: output.stdout_truncated,
        stderr_truncated: output.stderr_truncated,
        timestamp: now_rfc3339(),
    };
    if let Err(err) = write_agent_output(&output_path, &record) {
        return finish_error(result, &err.context("write agent output"), excerpt_chars);
    }

    result.output_file = Some(output_path);
    result.exit_code = output.exit_code;
    result.ended_at = Some(now_rfc3339());
    if output.timed_out {
        result.status = ExecutionStatus::Timeout;
        result.error = Some(format!(
            "exceeded {} minute timeout",
            request.timeout_minutes
        ));
    } else if output.exit_code == Some(0) {
        result.status = ExecutionStatus::Complete;
    } else {
        result.status = ExecutionStatus::Failed;
        result.error = Some(failure_excerpt(&output, excerpt_chars));
    }
    result
}

fn finish_error(
    mut result: ExecutionResult,
    err: &anyhow::Error,
    excerpt_chars: usize,
) -> ExecutionResult {
    warn!(cli = %result.cli, err = %err, "agent could not be run");
    result.status = ExecutionStatus::Error;
    result.ended_at = Some(now_rfc3339());
    result.error = Some(truncate_chars(&format!("{err:#}"), excerpt_chars));
    result
}

/// Bounded explanation of a non-zero exit: stderr when there is any.
fn failure_excerpt(output: &CommandOutput, excerpt_chars: usize) -> String {
    let stderr = output.stderr_text();
    let stderr = stderr.trim();
    if !stderr.is_empty() {
        return truncate_chars(stderr, excerpt_chars);
    }
    match output.exit_code {
        Some(code) => format!("non-zero exit code {code}"),
        None => "terminated by signal".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::review_run::{load_metadata, read_agent_output};
    use crate::test_support::{ScriptedAgentRunner, ScriptedRun};

    fn request(clis: &[&str]) -> ReviewRequest {
        ReviewRequest {
            clis: clis.iter().map(|c| c.to_string()).collect(),
            prompt: "review the diff".to_string(),
            project_root: PathBuf::from("."),
            timeout_minutes: 1,
            models: BTreeMap::new(),
        }
    }

    #[test]
    fn nothing_available_reports_missing() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = ScriptedAgentRunner::new();
        let outcome = run_review(
            &runner,
            &ArenaConfig::default(),
            temp.path(),
            &request(&["claude", "gemini"]),
        )
        .expect("run");
        assert!(!outcome.success);
        assert!(outcome.no_agents_available());
        assert_eq!(outcome.missing_clis, vec!["claude", "gemini"]);
        assert_eq!(
            outcome.error.as_deref(),
            Some("No agents available. Missing: claude, gemini")
        );
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn mixed_outcomes_are_isolated() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = ScriptedAgentRunner::new()
            .with_agent("claude", ScriptedRun::ok("## Finding\nSQL injection in db.rs:12"))
            .with_agent("gemini", ScriptedRun::fail(2, "quota exceeded"))
            .with_agent("codex", ScriptedRun::TimedOut);
        let outcome = run_review(
            &runner,
            &ArenaConfig::default(),
            temp.path(),
            &request(&["claude", "gemini", "codex", "missing"]),
        )
        .expect("run");

        assert!(outcome.success);
        assert_eq!(outcome.missing_clis, vec!["missing"]);
        let status = |cli: &str| {
            outcome
                .results
                .iter()
                .find(|r| r.cli == cli)
                .expect("result")
                .clone()
        };
        assert_eq!(status("claude").status, ExecutionStatus::Complete);
        let gemini = status("gemini");
        assert_eq!(gemini.status, ExecutionStatus::Failed);
        assert_eq!(gemini.error.as_deref(), Some("quota exceeded"));
        assert_eq!(gemini.exit_code, Some(2));
        let codex = status("codex");
        assert_eq!(codex.status, ExecutionStatus::Timeout);
        assert_eq!(codex.error.as_deref(), Some("exceeded 1 minute timeout"));

        let paths = ReviewPaths::new(temp.path(), &outcome.review_id);
        let meta = load_metadata(&paths).expect("metadata");
        assert!(meta.completed_at.is_some());
        assert!(meta.results.iter().all(|r| r.status.is_terminal()));
        let claude = read_agent_output(&paths.output_path("claude")).expect("output");
        assert!(claude.stdout.contains("SQL injection"));
        assert_eq!(claude.model.as_deref(), Some("opus"));
    }

    #[test]
    fn all_failed_names_each_agent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = ScriptedAgentRunner::new()
            .with_agent("claude", ScriptedRun::fail(1, ""))
            .with_agent("gemini", ScriptedRun::LaunchError("permission denied".to_string()));
        let outcome = run_review(
            &runner,
            &ArenaConfig::default(),
            temp.path(),
            &request(&["claude", "gemini"]),
        )
        .expect("run");
        assert!(!outcome.success);
        assert!(!outcome.no_agents_available());
        let error = outcome.error.expect("error");
        assert!(error.contains("claude failed: non-zero exit code 1"), "{error}");
        assert!(error.contains("gemini error: permission denied"), "{error}");
    }

    #[test]
    fn results_arrive_in_completion_order() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = ScriptedAgentRunner::new()
            .with_delayed_agent("claude", ScriptedRun::ok("slow"), Duration::from_millis(300))
            .with_agent("gemini", ScriptedRun::ok("fast"));
        let outcome = run_review(
            &runner,
            &ArenaConfig::default(),
            temp.path(),
            &request(&["claude", "gemini"]),
        )
        .expect("run");
        let order: Vec<_> = outcome.results.iter().map(|r| r.cli.as_str()).collect();
        assert_eq!(order, vec!["gemini", "claude"]);
    }

    #[test]
    fn stderr_excerpt_is_bounded() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut config = ArenaConfig::default();
        config.review.error_excerpt_chars = 10;
        let runner =
            ScriptedAgentRunner::new().with_agent("claude", ScriptedRun::fail(1, &"x".repeat(50)));
        let outcome =
            run_review(&runner, &config, temp.path(), &request(&["claude"])).expect("run");
        let error = outcome.results[0].error.clone().expect("error");
        assert!(error.chars().count() <= 13, "{error}");
    }

    #[test]
    fn duplicates_and_blank_names_are_dropped() {
        assert_eq!(
            dedupe(&["a".into(), " a ".into(), "".into(), "b".into()]),
            vec!["a", "b"]
        );
    }

    #[test]
    fn oversized_timeout_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = ScriptedAgentRunner::new().with_agent("claude", ScriptedRun::ok("fine"));
        let err = run_review(
            &runner,
            &ArenaConfig::default(),
            temp.path(),
            &ReviewRequest {
                timeout_minutes: u64::MAX,
                ..request(&["claude"])
            },
        )
        .expect_err("too large");
        assert!(err.to_string().contains("too large"), "{err}");
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn empty_request_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = run_review(
            &ScriptedAgentRunner::new(),
            &ArenaConfig::default(),
            temp.path(),
            &request(&[]),
        )
        .expect_err("empty");
        assert!(err.to_string().contains("no agents requested"));
    }
}

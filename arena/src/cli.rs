//! CLI command implementations.
//!
//! Each command prints product output to stdout and returns the process exit
//! code. Hard failures are returned as errors and mapped by
//! [`exit_code_for_error`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use clap::ValueEnum;
use serde::Serialize;
use tracing::{debug, info};

use crate::core::registry::{NewWorker, WorkerSelector};
use crate::core::types::{ExecutionStatus, Tournament, Worker};
use crate::exit_codes;
use crate::io::agents::{AgentRunner, SessionLauncher};
use crate::io::config::ArenaConfig;
use crate::io::coordination::{CoordinationStore, StoreError};
use crate::io::paths::ArenaPaths;
use crate::io::review_run::{ReviewPaths, list_reviews, load_metadata};
use crate::report::{aggregate_review, render_markdown, render_summary};
use crate::review::{ReviewRequest, run_review};
use crate::tournament::{
    CombineRequest, SpawnRequest, TournamentContext, WorkerRef, worker_for_cwd,
};

/// Output shape for report commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ReportFormat {
    #[default]
    Markdown,
    Json,
    Summary,
}

/// Resolved project state shared by every command.
#[derive(Debug, Clone)]
pub struct Project {
    pub paths: ArenaPaths,
    pub config: ArenaConfig,
}

impl Project {
    pub fn discover(cwd: &Path) -> Result<Self> {
        let paths = ArenaPaths::discover(cwd)?;
        let config = paths.load_config()?;
        debug!(state_dir = %paths.state_dir.display(), "project discovered");
        Ok(Self { paths, config })
    }

    pub fn store(&self) -> CoordinationStore {
        self.paths.store(&self.config)
    }

    pub fn reviews_dir(&self) -> PathBuf {
        self.paths.reviews_dir(&self.config)
    }
}

/// Map a hard failure to its exit code.
pub fn exit_code_for_error(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<StoreError>() {
        Some(StoreError::Busy { .. }) => exit_codes::STORE_BUSY,
        _ => exit_codes::INVALID,
    }
}

/// Parse repeated `agent=model` options.
pub fn parse_model_overrides(raw: &[String]) -> Result<BTreeMap<String, String>> {
    let mut models = BTreeMap::new();
    for item in raw {
        let (agent, model) = item
            .split_once('=')
            .ok_or_else(|| anyhow!("model override '{item}' must look like agent=model"))?;
        let (agent, model) = (agent.trim(), model.trim());
        if agent.is_empty() || model.is_empty() {
            bail!("model override '{item}' must look like agent=model");
        }
        models.insert(agent.to_string(), model.to_string());
    }
    Ok(models)
}

/// Split comma-separated agent lists, falling back to `default`.
pub fn agent_list(raw: &[String], default: &[String]) -> Vec<String> {
    let agents: Vec<String> = raw
        .iter()
        .flat_map(|item| item.split(','))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    if agents.is_empty() {
        default.to_vec()
    } else {
        agents
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize json")?;
    println!("{payload}");
    Ok(())
}

fn print_worker(worker: &Worker) {
    let pid = worker.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string());
    println!(
        "worker: id={} status={} branch={} pid={} terminal={} path={} task={}",
        worker.id,
        worker.status,
        worker.branch,
        pid,
        worker.terminal,
        worker.workspace_path.display(),
        worker.task
    );
}

fn print_tournament(tournament: &Tournament) {
    let completion = tournament.completion();
    println!(
        "tournament: id={} status={} done={}/{} agents={} task={}",
        tournament.id,
        tournament.status,
        completion.done,
        completion.total,
        tournament.clis.join(","),
        tournament.task
    );
    if let Some(branch) = &tournament.combined_branch {
        println!("  combined: {branch}");
    }
}

pub fn worker_list(project: &Project, all: bool, json: bool) -> Result<i32> {
    let workers = project.store().list_workers(all)?;
    if json {
        print_json(&workers)?;
    } else {
        for worker in &workers {
            print_worker(worker);
        }
    }
    Ok(exit_codes::OK)
}

pub fn worker_register(project: &Project, new: NewWorker) -> Result<i32> {
    let store = project.store();
    store.ensure_main_repo(&project.paths.project_root)?;
    let id = store.register_worker(new)?;
    println!("{id}");
    Ok(exit_codes::OK)
}

pub fn worker_unregister(project: &Project, selector: &WorkerSelector) -> Result<i32> {
    if !project.store().unregister_worker(selector)? {
        bail!("no worker matches {selector:?}");
    }
    println!("stopped");
    Ok(exit_codes::OK)
}

pub fn worker_remove(project: &Project, selector: &WorkerSelector) -> Result<i32> {
    if !project.store().remove_worker(selector)? {
        bail!("no worker matches {selector:?}");
    }
    println!("removed");
    Ok(exit_codes::OK)
}

pub fn worker_cleanup(project: &Project, json: bool) -> Result<i32> {
    let stopped = project.store().cleanup_stale_workers()?;
    if json {
        print_json(&stopped)?;
    } else {
        println!("cleanup: stopped={}", stopped.len());
        for id in stopped {
            println!("  worker {id}");
        }
    }
    Ok(exit_codes::OK)
}

/// Options for `review run` after prompt resolution.
#[derive(Debug, Clone, Default)]
pub struct ReviewRunArgs {
    pub agents: Vec<String>,
    pub prompt: String,
    pub timeout_minutes: Option<u64>,
    pub models: Vec<String>,
    pub json: bool,
}

pub fn review_run<R: AgentRunner>(
    project: &Project,
    runner: &R,
    args: &ReviewRunArgs,
) -> Result<i32> {
    if args.prompt.trim().is_empty() {
        bail!("review prompt is empty");
    }
    let request = ReviewRequest {
        clis: agent_list(&args.agents, &project.config.review.default_agents),
        prompt: args.prompt.clone(),
        project_root: project.paths.project_root.clone(),
        timeout_minutes: args
            .timeout_minutes
            .unwrap_or(project.config.review.timeout_minutes),
        models: parse_model_overrides(&args.models)?,
    };
    let outcome = run_review(runner, &project.config, &project.reviews_dir(), &request)?;

    if args.json {
        print_json(&outcome)?;
    } else {
        println!(
            "review: id={} success={} dir={}",
            outcome.review_id,
            outcome.success,
            outcome.output_dir.display()
        );
        for result in &outcome.results {
            match &result.error {
                Some(err) => println!("agent: {} {} ({err})", result.cli, result.status),
                None => println!("agent: {} {}", result.cli, result.status),
            }
        }
        for cli in &outcome.missing_clis {
            match project
                .config
                .agent(cli)
                .and_then(|spec| spec.install_hint.as_deref())
            {
                Some(hint) => println!("missing: {cli} (install: {hint})"),
                None => println!("missing: {cli}"),
            }
        }
        if let Some(err) = &outcome.error {
            eprintln!("error: {err}");
        }
    }

    Ok(if outcome.no_agents_available() {
        exit_codes::NO_AGENTS
    } else if !outcome.success {
        exit_codes::ALL_FAILED
    } else {
        exit_codes::OK
    })
}

pub fn review_status(project: &Project, review_id: &str, json: bool) -> Result<i32> {
    let paths = ReviewPaths::new(&project.reviews_dir(), review_id);
    if !paths.dir.is_dir() {
        bail!("review {review_id} not found");
    }
    let metadata = load_metadata(&paths)?;
    if json {
        print_json(&metadata)?;
        return Ok(exit_codes::OK);
    }
    println!(
        "review: id={} started={} completed={}",
        metadata.review_id,
        metadata.started_at,
        metadata.completed_at.as_deref().unwrap_or("-")
    );
    for result in &metadata.results {
        println!("agent: {} {}", result.cli, result.status);
    }
    if !metadata.missing_clis.is_empty() {
        println!("missing: {}", metadata.missing_clis.join(", "));
    }
    Ok(exit_codes::OK)
}

pub fn review_list(project: &Project, limit: Option<usize>, json: bool) -> Result<i32> {
    let (mut reviews, warnings) = list_reviews(&project.reviews_dir())?;
    if let Some(limit) = limit {
        reviews.truncate(limit);
    }
    if json {
        print_json(&reviews)?;
    } else {
        for meta in &reviews {
            let complete = meta
                .results
                .iter()
                .filter(|r| r.status == ExecutionStatus::Complete)
                .count();
            println!(
                "review: id={} agents={}/{} started={}",
                meta.review_id,
                complete,
                meta.results.len(),
                meta.started_at
            );
        }
    }
    for warning in warnings {
        eprintln!("warning: {warning}");
    }
    Ok(exit_codes::OK)
}

pub fn review_report(
    project: &Project,
    review_id: &str,
    format: ReportFormat,
    threshold: Option<f64>,
) -> Result<i32> {
    let mut config = project.config.clone();
    if let Some(threshold) = threshold {
        if !(0.0..=1.0).contains(&threshold) {
            bail!("threshold must be between 0 and 1");
        }
        config.aggregate.match_threshold = threshold;
    }
    let report = aggregate_review(&project.reviews_dir(), review_id, &config)?;
    match format {
        ReportFormat::Markdown => print!("{}", render_markdown(&report)),
        ReportFormat::Json => print_json(&report)?,
        ReportFormat::Summary => print!("{}", render_summary(&report)),
    }
    Ok(exit_codes::OK)
}

#[derive(Debug, Clone, Serialize)]
struct AgentAvailability {
    agent: String,
    command: Option<String>,
    available: bool,
    install_hint: Option<String>,
}

pub fn review_check<R: AgentRunner>(
    project: &Project,
    runner: &R,
    agents: &[String],
    json: bool,
) -> Result<i32> {
    let names: Vec<String> = if agents.is_empty() {
        project.config.agents.keys().cloned().collect()
    } else {
        agent_list(agents, &[])
    };
    let rows: Vec<AgentAvailability> = names
        .into_iter()
        .map(|agent| {
            let spec = project.config.agent(&agent);
            AgentAvailability {
                available: spec.is_some() && runner.is_available(&agent),
                command: spec.map(|s| s.command.clone()),
                install_hint: spec.and_then(|s| s.install_hint.clone()),
                agent,
            }
        })
        .collect();

    if json {
        print_json(&rows)?;
    } else {
        for row in &rows {
            let state = if row.available { "available" } else { "missing" };
            match (&row.install_hint, row.available) {
                (Some(hint), false) => println!("agent: {} {state} (install: {hint})", row.agent),
                _ => println!("agent: {} {state}", row.agent),
            }
        }
    }
    Ok(if rows.iter().any(|r| r.available) {
        exit_codes::OK
    } else {
        exit_codes::NO_AGENTS
    })
}

pub fn tournament_spawn<L: SessionLauncher>(
    project: &Project,
    launcher: &L,
    task: &str,
    agents: &[String],
    base: Option<String>,
    models: &[String],
    json: bool,
) -> Result<i32> {
    let ctx = TournamentContext::new(&project.paths, &project.config);
    let request = SpawnRequest {
        task: task.to_string(),
        clis: agent_list(agents, &project.config.review.default_agents),
        base,
        models: parse_model_overrides(models)?,
    };
    let outcome = ctx.spawn(launcher, &request)?;
    info!(tournament_id = %outcome.tournament_id, "spawned");
    if json {
        print_json(&outcome)?;
    } else {
        println!(
            "tournament: id={} base={} workers={}",
            outcome.tournament_id,
            outcome.base_ref,
            outcome.workers.len()
        );
        for worker in &outcome.workers {
            println!(
                "worker: {} {} pid={} branch={} path={} log={}",
                worker.worker_id,
                worker.cli,
                worker.pid,
                worker.branch,
                worker.workspace_path.display(),
                worker.log_path.display()
            );
        }
        for err in &outcome.errors {
            eprintln!("error: {err}");
        }
    }
    Ok(if outcome.success {
        exit_codes::OK
    } else {
        exit_codes::ALL_FAILED
    })
}

pub fn tournament_status(project: &Project, id: Option<&str>, json: bool) -> Result<i32> {
    let ctx = TournamentContext::new(&project.paths, &project.config);
    let ids: Vec<String> = match id {
        Some(id) => vec![id.to_string()],
        None => ctx.list(false)?.into_iter().map(|t| t.id).collect(),
    };
    let mut snapshots = Vec::with_capacity(ids.len());
    for id in &ids {
        snapshots.push(ctx.refresh(id)?);
    }
    if json {
        print_json(&snapshots)?;
        return Ok(exit_codes::OK);
    }
    if snapshots.is_empty() {
        println!("no active tournaments");
    }
    for snap in &snapshots {
        print_tournament(&snap.tournament);
        for cli in &snap.newly_done {
            println!("  finished: {cli}");
        }
        for pending in &snap.completion.pending {
            println!(
                "  pending: {} {} {}",
                pending.worker_id,
                pending.cli,
                pending.workspace_path.display()
            );
        }
    }
    Ok(exit_codes::OK)
}

pub fn tournament_list(project: &Project, all: bool, json: bool) -> Result<i32> {
    let ctx = TournamentContext::new(&project.paths, &project.config);
    let tournaments = ctx.list(all)?;
    if json {
        print_json(&tournaments)?;
    } else {
        for tournament in &tournaments {
            print_tournament(tournament);
        }
    }
    Ok(exit_codes::OK)
}

/// Mark a worker done; without an explicit worker, the one whose workspace
/// contains `cwd`.
pub fn tournament_done(
    project: &Project,
    id: &str,
    worker: Option<WorkerRef>,
    cwd: &Path,
) -> Result<i32> {
    let ctx = TournamentContext::new(&project.paths, &project.config);
    let worker = match worker {
        Some(worker) => worker,
        None => {
            let tournament = ctx.store().require_tournament(id)?;
            let found = worker_for_cwd(&tournament, cwd).ok_or_else(|| {
                anyhow!(
                    "{} is not a workspace of tournament {id}; pass --worker or --cli",
                    cwd.display()
                )
            })?;
            WorkerRef::Id(found.worker_id)
        }
    };
    let snap = ctx.mark_done(id, &worker)?;
    println!(
        "tournament: id={} status={} done={}/{}",
        snap.tournament.id, snap.tournament.status, snap.completion.done, snap.completion.total
    );
    Ok(exit_codes::OK)
}

pub fn tournament_report(project: &Project, id: &str, format: ReportFormat) -> Result<i32> {
    let ctx = TournamentContext::new(&project.paths, &project.config);
    let report = ctx.report(id)?;
    match format {
        ReportFormat::Json => print_json(&report)?,
        ReportFormat::Markdown => print!("{}", ctx.render_report(&report)?),
        ReportFormat::Summary => {
            print_tournament(&report.tournament);
            println!(
                "summary: workers={} completed={} files_changed={} commits={}",
                report.summary.total_workers,
                report.summary.completed_workers,
                report.summary.total_files_changed,
                report.summary.total_commits
            );
        }
    }
    Ok(exit_codes::OK)
}

pub fn tournament_diff(project: &Project, id: &str, worker: &WorkerRef, file: &str) -> Result<i32> {
    let ctx = TournamentContext::new(&project.paths, &project.config);
    print!("{}", ctx.diff_file(id, worker, file)?);
    Ok(exit_codes::OK)
}

pub fn tournament_combine(project: &Project, request: &CombineRequest, json: bool) -> Result<i32> {
    let ctx = TournamentContext::new(&project.paths, &project.config);
    let outcome = ctx.combine(request)?;
    if json {
        print_json(&outcome)?;
    } else {
        println!(
            "combined: branch={} files={} committed={}",
            outcome.branch,
            outcome.selections.len(),
            outcome.committed
        );
    }
    Ok(exit_codes::OK)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn model_overrides_need_equals() {
        let models =
            parse_model_overrides(&["claude=sonnet".to_string(), " codex = o3 ".to_string()])
                .expect("parse");
        assert_eq!(models.get("claude").map(String::as_str), Some("sonnet"));
        assert_eq!(models.get("codex").map(String::as_str), Some("o3"));
        assert!(parse_model_overrides(&["claude".to_string()]).is_err());
    }

    #[test]
    fn agent_list_splits_and_defaults() {
        let default = vec!["claude".to_string()];
        assert_eq!(
            agent_list(&["gemini,codex".to_string(), " qwen ".to_string()], &default),
            vec!["gemini", "codex", "qwen"]
        );
        assert_eq!(agent_list(&[], &default), default);
    }

    #[test]
    fn busy_store_maps_to_its_exit_code() {
        let busy = anyhow::Error::from(StoreError::Busy {
            path: PathBuf::from("/s"),
            waited: Duration::from_secs(1),
        })
        .context("register worker");
        assert_eq!(exit_code_for_error(&busy), exit_codes::STORE_BUSY);
        assert_eq!(exit_code_for_error(&anyhow!("nope")), exit_codes::INVALID);
    }
}

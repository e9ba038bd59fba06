//! Tournaments: several agents solve the same task in isolated git worktrees,
//! then selected files from each solution are combined onto one branch.
//!
//! Lifecycle: `running` until every worker has dropped a `DONE.md` marker,
//! `reviewing` while solutions are compared, `complete` once combined.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::core::registry::{NewWorker, TournamentUpdate};
use crate::core::types::{Completion, Tournament, TournamentStatus, TournamentWorker};
use crate::io::agents::{AgentInvocation, LaunchMode, SessionLauncher};
use crate::io::config::ArenaConfig;
use crate::io::coordination::CoordinationStore;
use crate::io::fs_util::write_atomic;
use crate::io::git::{Git, branch_slug, sibling_worktree_path};
use crate::io::paths::ArenaPaths;
use crate::io::prompt::{DONE_FILE, PromptEngine, SolutionView, TASK_FILE};
use crate::io::timestamp::{now_rfc3339, short_id, unix_secs};

/// Terminal label recorded for background-launched workers.
const BACKGROUND_TERMINAL: &str = "background";

/// Inputs for [`TournamentContext::spawn`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnRequest {
    pub task: String,
    pub clis: Vec<String>,
    /// Revision to branch from; `HEAD` when absent.
    pub base: Option<String>,
    /// Per-agent model overrides.
    pub models: BTreeMap<String, String>,
}

/// One worker that was created and launched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpawnedWorker {
    pub worker_id: u32,
    pub cli: String,
    pub branch: String,
    pub workspace_path: PathBuf,
    pub pid: u32,
    /// Id in the general worker registry.
    pub registry_id: u32,
    pub log_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpawnOutcome {
    /// At least one worker was launched.
    pub success: bool,
    pub tournament_id: String,
    pub base_ref: String,
    pub workers: Vec<SpawnedWorker>,
    /// Per-worker problems (existing worktree, failed launch, ...).
    pub errors: Vec<String>,
}

/// Tournament plus freshly computed completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TournamentSnapshot {
    pub tournament: Tournament,
    pub completion: Completion,
    /// Agents whose completion was recorded by this call.
    pub newly_done: Vec<String>,
}

/// Identifies a worker within one tournament.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerRef {
    Id(u32),
    Cli(String),
    Path(PathBuf),
}

impl WorkerRef {
    fn find<'t>(&self, tournament: &'t Tournament) -> Option<&'t TournamentWorker> {
        match self {
            Self::Id(id) => tournament.worker(*id),
            Self::Cli(cli) => tournament.worker_for_cli(cli),
            Self::Path(path) => tournament.worker_for_path(path),
        }
    }
}

/// What one worker produced, relative to the tournament base.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Solution {
    pub worker_id: u32,
    pub cli: String,
    pub branch: String,
    pub workspace_path: PathBuf,
    pub done: bool,
    pub done_summary: Option<String>,
    pub diff_stat: Option<String>,
    pub files_changed: Vec<String>,
    pub commit_count: Option<u32>,
    /// Problems gathering this solution; the others are unaffected.
    pub errors: Vec<String>,
}

impl Solution {
    fn view(&self) -> SolutionView<'_> {
        SolutionView {
            cli: &self.cli,
            branch: &self.branch,
            done: self.done,
            commit_count: self.commit_count,
            files_changed: &self.files_changed,
            diff_stat: self.diff_stat.as_deref(),
            done_summary: self.done_summary.as_deref(),
            errors: &self.errors,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReportSummary {
    pub total_workers: usize,
    pub completed_workers: usize,
    pub total_files_changed: usize,
    pub total_commits: u32,
}

/// Everything a reviewer needs to compare the solutions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TournamentReport {
    pub tournament: Tournament,
    pub completion: Completion,
    pub solutions: Vec<Solution>,
    pub summary: ReportSummary,
}

/// Inputs for [`TournamentContext::combine`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CombineRequest {
    pub tournament_id: String,
    /// Defaults to `tournament/<slug>-combined`.
    pub branch: Option<String>,
    /// `file=cli` pairs. Empty creates the branch for a manual merge.
    pub selections: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CombineOutcome {
    pub branch: String,
    /// Files taken from each agent.
    pub selections: BTreeMap<String, String>,
    /// Whether a commit was created on the combined branch.
    pub committed: bool,
}

/// Parse `file=cli`. The last `=` separates the two.
pub fn parse_selection(raw: &str) -> Result<(String, String)> {
    let (file, cli) = raw
        .rsplit_once('=')
        .ok_or_else(|| anyhow!("selection '{raw}' must look like file=cli"))?;
    let (file, cli) = (file.trim(), cli.trim());
    if file.is_empty() || cli.is_empty() {
        bail!("selection '{raw}' must look like file=cli");
    }
    Ok((file.to_string(), cli.to_string()))
}

/// Shared handles for tournament operations on one project.
pub struct TournamentContext<'a> {
    paths: &'a ArenaPaths,
    config: &'a ArenaConfig,
    store: CoordinationStore,
    git: Git,
    prompts: PromptEngine,
}

impl<'a> TournamentContext<'a> {
    pub fn new(paths: &'a ArenaPaths, config: &'a ArenaConfig) -> Self {
        Self {
            paths,
            config,
            store: paths.store(config),
            git: Git::new(&paths.project_root),
            prompts: PromptEngine::new(),
        }
    }

    pub fn store(&self) -> &CoordinationStore {
        &self.store
    }

    /// Create one worktree per agent, register the tournament, then launch
    /// every agent in the background.
    #[instrument(skip_all, fields(clis = ?request.clis))]
    pub fn spawn<L: SessionLauncher>(
        &self,
        launcher: &L,
        request: &SpawnRequest,
    ) -> Result<SpawnOutcome> {
        let task = request.task.trim();
        if task.is_empty() {
            bail!("task must not be empty");
        }
        let mut seen = BTreeSet::new();
        let clis: Vec<String> = request
            .clis
            .iter()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty() && seen.insert(c.clone()))
            .collect();
        if clis.is_empty() {
            bail!("no agents requested");
        }
        if let Some(unknown) = clis.iter().find(|c| self.config.agent(c).is_none()) {
            bail!("unknown agent '{unknown}'");
        }
        if !self.git.is_repo() {
            bail!(
                "{} is not a git repository; tournaments need worktrees",
                self.paths.project_root.display()
            );
        }
        let base_ref = self
            .git
            .resolve_commit(request.base.as_deref().unwrap_or("HEAD"))?;
        self.store.ensure_main_repo(&self.paths.project_root)?;

        let slug = branch_slug(task);
        let mut errors = Vec::new();
        let mut planned = Vec::new();
        for (index, cli) in clis.iter().enumerate() {
            let worker_id = index as u32 + 1;
            let branch = format!("tournament/{slug}-{cli}-{worker_id}");
            match self.git.worktree_for_branch(&branch) {
                Ok(Some(existing)) => {
                    errors.push(format!(
                        "worktree already exists for branch {branch}: {}",
                        existing.path.display()
                    ));
                    continue;
                }
                Ok(None) => {}
                Err(err) => {
                    errors.push(format!("worker {worker_id} ({cli}): {err:#}"));
                    continue;
                }
            }
            let workspace_path = sibling_worktree_path(&self.paths.project_root, &branch);
            if let Err(err) = self.git.worktree_add(&workspace_path, &branch, &base_ref) {
                errors.push(format!("worker {worker_id} ({cli}): {err:#}"));
                continue;
            }
            planned.push(TournamentWorker {
                worker_id,
                cli: cli.clone(),
                workspace_path,
                branch,
                done: false,
                done_marker: None,
                completed_at: None,
            });
        }
        if planned.is_empty() {
            bail!("no tournament workspaces could be created: {}", errors.join("; "));
        }

        let tournament = Tournament {
            id: format!("tournament-{}-{}", unix_secs(), short_id(6)),
            task: task.to_string(),
            base_ref: base_ref.clone(),
            started_at: now_rfc3339(),
            status: TournamentStatus::Running,
            clis,
            workers: planned.clone(),
            combined_branch: None,
        };
        let tournament_id = self.store.register_tournament(tournament)?;

        let mut workers = Vec::new();
        for worker in &planned {
            let model = request.models.get(&worker.cli).map(String::as_str);
            match self.launch_worker(launcher, &tournament_id, task, worker, model) {
                Ok(spawned) => workers.push(spawned),
                Err(err) => {
                    warn!(cli = %worker.cli, err = %err, "failed to launch tournament worker");
                    errors.push(format!("spawning {}: {err:#}", worker.cli));
                }
            }
        }
        info!(tournament_id = %tournament_id, launched = workers.len(), "tournament spawned");
        Ok(SpawnOutcome {
            success: !workers.is_empty(),
            tournament_id,
            base_ref,
            workers,
            errors,
        })
    }

    fn launch_worker<L: SessionLauncher>(
        &self,
        launcher: &L,
        tournament_id: &str,
        task: &str,
        worker: &TournamentWorker,
        model: Option<&str>,
    ) -> Result<SpawnedWorker> {
        let task_md = self.prompts.render_task(
            tournament_id,
            &worker.cli,
            task,
            &worker.branch,
            &worker.workspace_path,
        )?;
        write_atomic(&worker.workspace_path.join(TASK_FILE), task_md.as_bytes())?;

        let invocation = AgentInvocation::build(
            self.config,
            &worker.cli,
            &task_md,
            model,
            LaunchMode::Autonomous,
            &worker.workspace_path,
        )?;
        let log_path = self.paths.tournament_log(tournament_id, &worker.cli);
        let pid = launcher.launch(&invocation, &log_path)?;
        let registry_id = self.store.register_worker(NewWorker {
            workspace_path: worker.workspace_path.clone(),
            branch: worker.branch.clone(),
            task: format!("[Tournament: {tournament_id}] {task}"),
            pid: Some(pid),
            terminal: BACKGROUND_TERMINAL.to_string(),
        })?;
        Ok(SpawnedWorker {
            worker_id: worker.worker_id,
            cli: worker.cli.clone(),
            branch: worker.branch.clone(),
            workspace_path: worker.workspace_path.clone(),
            pid,
            registry_id,
            log_path,
        })
    }

    /// Active tournaments, or every tournament when `all` is set.
    pub fn list(&self, all: bool) -> Result<Vec<Tournament>> {
        if all {
            self.store.all_tournaments()
        } else {
            self.store.active_tournaments()
        }
    }

    /// Record workers whose `DONE.md` has appeared and advance the lifecycle.
    #[instrument(skip_all, fields(tournament_id = %id))]
    pub fn refresh(&self, id: &str) -> Result<TournamentSnapshot> {
        let tournament = self.store.require_tournament(id)?;
        let mut newly_done = Vec::new();
        for worker in tournament.workers.iter().filter(|w| !w.done) {
            let marker = worker.workspace_path.join(DONE_FILE);
            if marker.is_file()
                && self
                    .store
                    .mark_tournament_worker_done(id, worker.worker_id, Some(marker))?
            {
                info!(cli = %worker.cli, "worker finished");
                newly_done.push(worker.cli.clone());
            }
        }
        self.advance_if_complete(id)?;
        self.snapshot(id, newly_done)
    }

    /// Explicitly mark one worker done, whether or not it wrote a marker.
    #[instrument(skip_all, fields(tournament_id = %id))]
    pub fn mark_done(&self, id: &str, worker: &WorkerRef) -> Result<TournamentSnapshot> {
        let tournament = self.store.require_tournament(id)?;
        let target = worker
            .find(&tournament)
            .ok_or_else(|| anyhow!("no worker {worker:?} in tournament {id}"))?;
        let marker = target.workspace_path.join(DONE_FILE);
        let marker = marker.is_file().then_some(marker);
        let changed = self
            .store
            .mark_tournament_worker_done(id, target.worker_id, marker)?;
        self.advance_if_complete(id)?;
        let newly_done = if changed {
            vec![target.cli.clone()]
        } else {
            Vec::new()
        };
        self.snapshot(id, newly_done)
    }

    fn snapshot(&self, id: &str, newly_done: Vec<String>) -> Result<TournamentSnapshot> {
        let tournament = self.store.require_tournament(id)?;
        let completion = tournament.completion();
        Ok(TournamentSnapshot {
            tournament,
            completion,
            newly_done,
        })
    }

    /// `running -> reviewing` once every worker is done. Returns whether it moved.
    fn advance_if_complete(&self, id: &str) -> Result<bool> {
        let advanced = self.store.update(|data| {
            let ready = data.tournament(id).is_some_and(|t| {
                t.status == TournamentStatus::Running && t.completion().complete
            });
            if ready {
                data.update_tournament(
                    id,
                    &TournamentUpdate {
                        status: Some(TournamentStatus::Reviewing),
                        combined_branch: None,
                    },
                )?;
            }
            Ok(ready)
        })?;
        if advanced {
            info!(tournament_id = %id, "all workers done, tournament is reviewing");
        }
        Ok(advanced)
    }

    /// Collect each worker's summary and changes relative to the base.
    pub fn gather_solutions(&self, tournament: &Tournament) -> Vec<Solution> {
        tournament
            .workers
            .iter()
            .map(|worker| self.gather_one(&tournament.base_ref, worker))
            .collect()
    }

    fn gather_one(&self, base: &str, worker: &TournamentWorker) -> Solution {
        let mut errors = Vec::new();
        let marker = worker
            .done_marker
            .clone()
            .unwrap_or_else(|| worker.workspace_path.join(DONE_FILE));
        let done_summary = match fs::read_to_string(&marker) {
            Ok(text) => Some(text.trim().to_string()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => {
                errors.push(format!("read {}: {err}", marker.display()));
                None
            }
        };
        let mut record = |what: &str, err: anyhow::Error| {
            errors.push(format!("{what}: {err:#}"));
        };
        let diff_stat = self
            .git
            .diff_stat(base, &worker.branch)
            .map_err(|e| record("diff stat", e))
            .ok();
        let files_changed = self
            .git
            .changed_files(base, &worker.branch)
            .map_err(|e| record("changed files", e))
            .unwrap_or_default();
        let commit_count = self
            .git
            .commit_count(base, &worker.branch)
            .map_err(|e| record("commit count", e))
            .ok();
        Solution {
            worker_id: worker.worker_id,
            cli: worker.cli.clone(),
            branch: worker.branch.clone(),
            workspace_path: worker.workspace_path.clone(),
            done: worker.done,
            done_summary,
            diff_stat: diff_stat.filter(|s| !s.is_empty()),
            files_changed,
            commit_count,
            errors,
        }
    }

    /// Refresh completion, gather every solution and move a finished
    /// tournament into `reviewing`.
    #[instrument(skip_all, fields(tournament_id = %id))]
    pub fn report(&self, id: &str) -> Result<TournamentReport> {
        let snapshot = self.refresh(id)?;
        let solutions = self.gather_solutions(&snapshot.tournament);
        let summary = ReportSummary {
            total_workers: solutions.len(),
            completed_workers: solutions.iter().filter(|s| s.done).count(),
            total_files_changed: solutions.iter().map(|s| s.files_changed.len()).sum(),
            total_commits: solutions.iter().filter_map(|s| s.commit_count).sum(),
        };
        Ok(TournamentReport {
            tournament: snapshot.tournament,
            completion: snapshot.completion,
            solutions,
            summary,
        })
    }

    /// Review prompt comparing every solution.
    pub fn render_report(&self, report: &TournamentReport) -> Result<String> {
        let views: Vec<SolutionView<'_>> = report.solutions.iter().map(Solution::view).collect();
        self.prompts
            .render_review(&report.tournament, &report.completion, &views)
    }

    /// Full diff of `file` on one worker's branch against the tournament base.
    pub fn diff_file(&self, id: &str, worker: &WorkerRef, file: &str) -> Result<String> {
        let tournament = self.store.require_tournament(id)?;
        let target = worker
            .find(&tournament)
            .ok_or_else(|| anyhow!("no worker {worker:?} in tournament {id}"))?;
        self.git
            .diff_file(&tournament.base_ref, &target.branch, file)
            .with_context(|| format!("diff {file} on {}", target.branch))
    }

    /// Build the combined branch from the base plus the selected files, then
    /// return to the branch that was checked out before.
    #[instrument(skip_all, fields(tournament_id = %request.tournament_id))]
    pub fn combine(&self, request: &CombineRequest) -> Result<CombineOutcome> {
        let id = request.tournament_id.as_str();
        let tournament = self.store.require_tournament(id)?;

        let mut selections = BTreeMap::new();
        for raw in &request.selections {
            let (file, cli) = parse_selection(raw)?;
            if tournament.worker_for_cli(&cli).is_none() {
                bail!("agent '{cli}' did not take part in tournament {id}");
            }
            if let Some(previous) = selections.insert(file.clone(), cli) {
                bail!("{file} selected more than once (already from {previous})");
            }
        }

        let branch = request
            .branch
            .clone()
            .unwrap_or_else(|| format!("tournament/{}-combined", branch_slug(&tournament.task)));
        self.git.ensure_clean()?;
        if self.git.branch_exists(&branch)? {
            bail!("branch {branch} already exists");
        }
        let previous = match self.git.current_branch() {
            Ok(name) => name,
            Err(_) => self.git.resolve_commit("HEAD")?,
        };

        self.git
            .checkout_new_branch(&branch, &tournament.base_ref)?;
        let applied = self.apply_selections(&tournament, &selections);
        if applied.is_err()
            && let Err(err) = self.git.reset_hard()
        {
            warn!(err = %err, "failed to discard partial combination");
        }
        let restored = self.git.checkout_branch(&previous);
        let committed = match (applied, restored) {
            (Ok(committed), Ok(())) => committed,
            (Err(err), restored) => {
                if let Err(restore_err) = restored {
                    warn!(err = %restore_err, previous = %previous, "failed to return to previous branch");
                }
                return Err(err.context(format!("combine into {branch}")));
            }
            (Ok(_), Err(err)) => {
                return Err(err.context(format!("return to {previous} after combining")));
            }
        };

        self.store.update_tournament(
            id,
            &TournamentUpdate {
                status: Some(TournamentStatus::Complete),
                combined_branch: Some(branch.clone()),
            },
        )?;
        info!(branch = %branch, files = selections.len(), "combined branch created");
        Ok(CombineOutcome {
            branch,
            selections,
            committed,
        })
    }

    fn apply_selections(
        &self,
        tournament: &Tournament,
        selections: &BTreeMap<String, String>,
    ) -> Result<bool> {
        if selections.is_empty() {
            return Ok(false);
        }
        for (file, cli) in selections {
            let worker = tournament
                .worker_for_cli(cli)
                .ok_or_else(|| anyhow!("agent '{cli}' not in tournament"))?;
            self.git
                .checkout_path_from(&worker.branch, file)
                .with_context(|| format!("take {file} from {}", worker.branch))?;
        }
        self.git.add_all()?;
        self.git
            .commit_staged(&format!("Combined solution from tournament {}", tournament.id))
    }
}

/// Whether `path` lies inside one of the tournament's worker workspaces.
pub fn worker_for_cwd<'t>(tournament: &'t Tournament, cwd: &Path) -> Option<&'t TournamentWorker> {
    tournament
        .workers
        .iter()
        .find(|w| cwd.starts_with(&w.workspace_path))
}

//! `arena`: run several AI coding CLIs side by side.
//!
//! Reviews send one prompt to every agent and aggregate their findings by
//! agreement. Tournaments let agents compete on one task in separate git
//! worktrees and combine the best files afterwards. Workers are tracked in a
//! coordination store shared by every worktree of the repository.

use std::io::Read;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};

use arena::cli::{self, Project, ReportFormat, ReviewRunArgs};
use arena::core::registry::{NewWorker, WorkerSelector};
use arena::io::agents::{BackgroundLauncher, ProcessAgentRunner};
use arena::tournament::{CombineRequest, WorkerRef};

#[derive(Parser)]
#[command(name = "arena", version, about = "Multi-agent review and tournament orchestration")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Track agent processes working in isolated workspaces.
    #[command(subcommand)]
    Worker(WorkerCommand),
    /// Send one prompt to several agents and aggregate their findings.
    #[command(subcommand)]
    Review(ReviewCommand),
    /// Let several agents compete on one task in separate worktrees.
    #[command(subcommand)]
    Tournament(TournamentCommand),
}

/// Worker chosen by id or workspace path.
#[derive(Args)]
#[group(required = true, multiple = false)]
struct WorkerTarget {
    #[arg(long)]
    id: Option<u32>,
    #[arg(long)]
    path: Option<PathBuf>,
}

impl WorkerTarget {
    fn selector(self) -> Result<WorkerSelector> {
        match (self.id, self.path) {
            (Some(id), _) => Ok(WorkerSelector::Id(id)),
            (None, Some(path)) => Ok(WorkerSelector::Path(path)),
            (None, None) => bail!("pass --id or --path"),
        }
    }
}

#[derive(Subcommand)]
enum WorkerCommand {
    /// List active workers.
    List {
        /// Include stopped workers.
        #[arg(long)]
        all: bool,
        #[arg(long)]
        json: bool,
    },
    /// Register a worker and print its id.
    Register {
        #[arg(long)]
        path: PathBuf,
        #[arg(long)]
        branch: String,
        #[arg(long)]
        task: String,
        #[arg(long)]
        pid: Option<u32>,
        #[arg(long, default_value = "manual")]
        terminal: String,
    },
    /// Mark a worker stopped.
    Unregister(WorkerTarget),
    /// Delete a worker record.
    Remove(WorkerTarget),
    /// Stop workers whose process is gone.
    Cleanup {
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum ReviewCommand {
    /// Run a review. The prompt comes from --prompt, --prompt-file or stdin.
    Run {
        /// Agents to ask (comma separated or repeated). Defaults to the configured list.
        #[arg(long = "agents", value_name = "AGENTS")]
        agents: Vec<String>,
        #[arg(long, conflicts_with = "prompt_file")]
        prompt: Option<String>,
        #[arg(long)]
        prompt_file: Option<PathBuf>,
        #[arg(long)]
        timeout_minutes: Option<u64>,
        /// Per-agent model, as agent=model.
        #[arg(long = "model", value_name = "AGENT=MODEL")]
        models: Vec<String>,
        #[arg(long)]
        json: bool,
    },
    /// Show the recorded state of one review.
    Status {
        review_id: String,
        #[arg(long)]
        json: bool,
    },
    /// List past reviews, newest first.
    List {
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        json: bool,
    },
    /// Aggregate the findings of one review.
    Report {
        review_id: String,
        #[arg(long, value_enum, default_value_t)]
        format: ReportFormat,
        /// Similarity needed to treat two findings as the same issue.
        #[arg(long)]
        threshold: Option<f64>,
    },
    /// Show which agents are installed.
    Check {
        #[arg(long = "agents", value_name = "AGENTS")]
        agents: Vec<String>,
        #[arg(long)]
        json: bool,
    },
}

/// Worker inside a tournament, by id or agent name.
#[derive(Args)]
#[group(multiple = false)]
struct TournamentWorkerArg {
    #[arg(long)]
    worker: Option<u32>,
    #[arg(long)]
    cli: Option<String>,
}

impl TournamentWorkerArg {
    fn worker_ref(self) -> Option<WorkerRef> {
        match (self.worker, self.cli) {
            (Some(id), _) => Some(WorkerRef::Id(id)),
            (None, Some(cli)) => Some(WorkerRef::Cli(cli)),
            (None, None) => None,
        }
    }
}

#[derive(Subcommand)]
enum TournamentCommand {
    /// Start a tournament.
    Spawn {
        #[arg(long)]
        task: String,
        #[arg(long = "agents", value_name = "AGENTS")]
        agents: Vec<String>,
        /// Revision to branch from (default HEAD).
        #[arg(long)]
        base: Option<String>,
        #[arg(long = "model", value_name = "AGENT=MODEL")]
        models: Vec<String>,
        #[arg(long)]
        json: bool,
    },
    /// Check completion markers; all active tournaments without --tournament.
    Status {
        #[arg(long)]
        tournament: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// List active tournaments.
    List {
        #[arg(long)]
        all: bool,
        #[arg(long)]
        json: bool,
    },
    /// Mark a worker done (defaults to the workspace containing the current directory).
    Done {
        #[arg(long)]
        tournament: String,
        #[command(flatten)]
        worker: TournamentWorkerArg,
    },
    /// Compare the solutions.
    Report {
        #[arg(long)]
        tournament: String,
        #[arg(long, value_enum, default_value_t)]
        format: ReportFormat,
    },
    /// Diff one file of one worker against the tournament base.
    Diff {
        #[arg(long)]
        tournament: String,
        #[command(flatten)]
        worker: TournamentWorkerArg,
        #[arg(long)]
        file: String,
    },
    /// Create a branch combining selected files from each solution.
    Combine {
        #[arg(long)]
        tournament: String,
        #[arg(long)]
        branch: Option<String>,
        /// file=agent, repeatable.
        #[arg(long = "select", value_name = "FILE=AGENT")]
        selections: Vec<String>,
        #[arg(long)]
        json: bool,
    },
}

fn main() {
    arena::logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            cli::exit_code_for_error(&err)
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let cwd = std::env::current_dir().context("resolve current directory")?;
    let project = Project::discover(&cwd)?;
    match cli.command {
        Command::Worker(cmd) => run_worker(&project, cmd),
        Command::Review(cmd) => run_review(&project, cmd),
        Command::Tournament(cmd) => run_tournament(&project, &cwd, cmd),
    }
}

fn run_worker(project: &Project, cmd: WorkerCommand) -> Result<i32> {
    match cmd {
        WorkerCommand::List { all, json } => cli::worker_list(project, all, json),
        WorkerCommand::Register {
            path,
            branch,
            task,
            pid,
            terminal,
        } => cli::worker_register(
            project,
            NewWorker {
                workspace_path: path,
                branch,
                task,
                pid,
                terminal,
            },
        ),
        WorkerCommand::Unregister(target) => cli::worker_unregister(project, &target.selector()?),
        WorkerCommand::Remove(target) => cli::worker_remove(project, &target.selector()?),
        WorkerCommand::Cleanup { json } => cli::worker_cleanup(project, json),
    }
}

fn run_review(project: &Project, cmd: ReviewCommand) -> Result<i32> {
    let runner = ProcessAgentRunner::new(&project.config);
    match cmd {
        ReviewCommand::Run {
            agents,
            prompt,
            prompt_file,
            timeout_minutes,
            models,
            json,
        } => {
            let prompt = read_prompt(prompt, prompt_file)?;
            let args = ReviewRunArgs {
                agents,
                prompt,
                timeout_minutes,
                models,
                json,
            };
            cli::review_run(project, &runner, &args)
        }
        ReviewCommand::Status { review_id, json } => cli::review_status(project, &review_id, json),
        ReviewCommand::List { limit, json } => cli::review_list(project, limit, json),
        ReviewCommand::Report {
            review_id,
            format,
            threshold,
        } => cli::review_report(project, &review_id, format, threshold),
        ReviewCommand::Check { agents, json } => cli::review_check(project, &runner, &agents, json),
    }
}

fn run_tournament(project: &Project, cwd: &std::path::Path, cmd: TournamentCommand) -> Result<i32> {
    match cmd {
        TournamentCommand::Spawn {
            task,
            agents,
            base,
            models,
            json,
        } => cli::tournament_spawn(
            project,
            &BackgroundLauncher,
            &task,
            &agents,
            base,
            &models,
            json,
        ),
        TournamentCommand::Status { tournament, json } => {
            cli::tournament_status(project, tournament.as_deref(), json)
        }
        TournamentCommand::List { all, json } => cli::tournament_list(project, all, json),
        TournamentCommand::Done { tournament, worker } => {
            cli::tournament_done(project, &tournament, worker.worker_ref(), cwd)
        }
        TournamentCommand::Report { tournament, format } => {
            cli::tournament_report(project, &tournament, format)
        }
        TournamentCommand::Diff {
            tournament,
            worker,
            file,
        } => {
            let worker = worker
                .worker_ref()
                .context("diff needs --worker or --cli")?;
            cli::tournament_diff(project, &tournament, &worker, &file)
        }
        TournamentCommand::Combine {
            tournament,
            branch,
            selections,
            json,
        } => cli::tournament_combine(
            project,
            &CombineRequest {
                tournament_id: tournament,
                branch,
                selections,
            },
            json,
        ),
    }
}

/// Prompt text from the flag, a file, or stdin (also for `--prompt-file -`).
fn read_prompt(prompt: Option<String>, prompt_file: Option<PathBuf>) -> Result<String> {
    if let Some(prompt) = prompt {
        return Ok(prompt);
    }
    match prompt_file {
        Some(path) if path.as_os_str() != "-" => std::fs::read_to_string(&path)
            .with_context(|| format!("read prompt file {}", path.display())),
        _ => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("read prompt from stdin")?;
            Ok(buf)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_review_run() {
        let cli = Cli::parse_from([
            "arena",
            "review",
            "run",
            "--agents",
            "claude,gemini",
            "--prompt",
            "check auth",
            "--model",
            "claude=sonnet",
        ]);
        let Command::Review(ReviewCommand::Run {
            agents,
            prompt,
            models,
            json,
            ..
        }) = cli.command
        else {
            panic!("expected review run");
        };
        assert_eq!(agents, vec!["claude,gemini"]);
        assert_eq!(prompt.as_deref(), Some("check auth"));
        assert_eq!(models, vec!["claude=sonnet"]);
        assert!(!json);
    }

    #[test]
    fn worker_target_needs_exactly_one() {
        assert!(Cli::try_parse_from(["arena", "worker", "remove"]).is_err());
        assert!(
            Cli::try_parse_from(["arena", "worker", "remove", "--id", "1", "--path", "/x"])
                .is_err()
        );
        let cli = Cli::parse_from(["arena", "worker", "unregister", "--id", "3"]);
        let Command::Worker(WorkerCommand::Unregister(target)) = cli.command else {
            panic!("expected unregister");
        };
        assert_eq!(target.selector().expect("selector"), WorkerSelector::Id(3));
    }

    #[test]
    fn parse_combine_selections() {
        let cli = Cli::parse_from([
            "arena",
            "tournament",
            "combine",
            "--tournament",
            "t-1",
            "--select",
            "src/a.rs=claude",
            "--select",
            "src/b.rs=codex",
        ]);
        let Command::Tournament(TournamentCommand::Combine { selections, .. }) = cli.command else {
            panic!("expected combine");
        };
        assert_eq!(selections, vec!["src/a.rs=claude", "src/b.rs=codex"]);
    }

    #[test]
    fn report_format_defaults_to_markdown() {
        let cli = Cli::parse_from(["arena", "review", "report", "review-1"]);
        let Command::Review(ReviewCommand::Report { format, .. }) = cli.command else {
            panic!("expected report");
        };
        assert_eq!(format, ReportFormat::Markdown);
    }
}

//! Shared data model for workers, tournaments and review runs.
//!
//! These records are persisted verbatim in the coordination store, so field
//! names are part of the on-disk contract.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Lifecycle of a registered worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Active,
    Stopped,
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => f.write_str("active"),
            Self::Stopped => f.write_str("stopped"),
        }
    }
}

/// A tracked agent process bound to one isolated workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Worker {
    pub id: u32,
    pub workspace_path: PathBuf,
    pub branch: String,
    pub task: String,
    pub started_at: String,
    pub status: WorkerStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub terminal: String,
}

/// Tournament lifecycle. Ordered: a tournament never moves backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TournamentStatus {
    Running,
    Reviewing,
    Complete,
}

impl TournamentStatus {
    fn rank(self) -> u8 {
        match self {
            Self::Running => 0,
            Self::Reviewing => 1,
            Self::Complete => 2,
        }
    }

    /// Running and reviewing tournaments still need attention.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Reviewing)
    }

    /// True when `next` does not regress the lifecycle.
    pub fn can_advance_to(self, next: TournamentStatus) -> bool {
        next.rank() >= self.rank()
    }
}

impl fmt::Display for TournamentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => f.write_str("running"),
            Self::Reviewing => f.write_str("reviewing"),
            Self::Complete => f.write_str("complete"),
        }
    }
}

/// One competing agent inside a tournament.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TournamentWorker {
    pub worker_id: u32,
    pub cli: String,
    pub workspace_path: PathBuf,
    pub branch: String,
    #[serde(default)]
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub done_marker: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
}

/// Several agents solving the same task in parallel workspaces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tournament {
    pub id: String,
    pub task: String,
    pub base_ref: String,
    pub started_at: String,
    pub status: TournamentStatus,
    pub clis: Vec<String>,
    pub workers: Vec<TournamentWorker>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub combined_branch: Option<String>,
}

/// Worker that has not reported completion yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingWorker {
    pub worker_id: u32,
    pub cli: String,
    pub workspace_path: PathBuf,
}

/// Completion snapshot for a tournament.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completion {
    pub complete: bool,
    pub total: usize,
    pub done: usize,
    pub pending: Vec<PendingWorker>,
}

impl Tournament {
    pub fn worker(&self, worker_id: u32) -> Option<&TournamentWorker> {
        self.workers.iter().find(|w| w.worker_id == worker_id)
    }

    pub fn worker_for_cli(&self, cli: &str) -> Option<&TournamentWorker> {
        self.workers.iter().find(|w| w.cli == cli)
    }

    pub fn worker_for_path(&self, path: &Path) -> Option<&TournamentWorker> {
        self.workers.iter().find(|w| w.workspace_path == path)
    }

    /// A tournament with no workers is never complete.
    pub fn completion(&self) -> Completion {
        let total = self.workers.len();
        let pending: Vec<PendingWorker> = self
            .workers
            .iter()
            .filter(|w| !w.done)
            .map(|w| PendingWorker {
                worker_id: w.worker_id,
                cli: w.cli.clone(),
                workspace_path: w.workspace_path.clone(),
            })
            .collect();
        let done = total - pending.len();
        Completion {
            complete: total > 0 && pending.is_empty(),
            total,
            done,
            pending,
        }
    }
}

/// Per-agent progress within a review run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Complete,
    /// Exited non-zero.
    Failed,
    Timeout,
    /// Could not be launched.
    Error,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Outcome of one agent in a review run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub cli: String,
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Bounded excerpt explaining a non-complete status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionResult {
    pub fn pending(cli: &str) -> Self {
        Self {
            cli: cli.to_string(),
            status: ExecutionStatus::Pending,
            started_at: None,
            ended_at: None,
            output_file: None,
            exit_code: None,
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tournament_worker(id: u32, cli: &str, done: bool) -> TournamentWorker {
        TournamentWorker {
            worker_id: id,
            cli: cli.to_string(),
            workspace_path: PathBuf::from(format!("/tmp/repo-{cli}")),
            branch: format!("tournament/task-{cli}-{id}"),
            done,
            done_marker: None,
            completed_at: None,
        }
    }

    fn tournament(workers: Vec<TournamentWorker>) -> Tournament {
        Tournament {
            id: "tournament-1".to_string(),
            task: "task".to_string(),
            base_ref: "HEAD".to_string(),
            started_at: "2026-01-01T00:00:00Z".to_string(),
            status: TournamentStatus::Running,
            clis: workers.iter().map(|w| w.cli.clone()).collect(),
            workers,
            combined_branch: None,
        }
    }

    #[test]
    fn status_never_regresses() {
        assert!(TournamentStatus::Running.can_advance_to(TournamentStatus::Reviewing));
        assert!(TournamentStatus::Running.can_advance_to(TournamentStatus::Complete));
        assert!(TournamentStatus::Reviewing.can_advance_to(TournamentStatus::Reviewing));
        assert!(!TournamentStatus::Complete.can_advance_to(TournamentStatus::Running));
        assert!(!TournamentStatus::Reviewing.can_advance_to(TournamentStatus::Running));
    }

    #[test]
    fn completion_lists_pending_workers() {
        let t = tournament(vec![
            tournament_worker(1, "claude", true),
            tournament_worker(2, "gemini", false),
        ]);
        let c = t.completion();
        assert!(!c.complete);
        assert_eq!((c.total, c.done), (2, 1));
        assert_eq!(c.pending.len(), 1);
        assert_eq!(c.pending[0].cli, "gemini");
    }

    #[test]
    fn completion_requires_workers() {
        let c = tournament(Vec::new()).completion();
        assert!(!c.complete);
        assert_eq!(c.total, 0);
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&TournamentStatus::Reviewing).expect("serialize");
        assert_eq!(json, "\"reviewing\"");
    }
}

//! In-memory operations on a coordination snapshot.
//!
//! The store loads a [`CoordinationData`], applies one of these operations under
//! its lock, and writes the result back. Nothing here touches the filesystem.

use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

use crate::core::types::{Completion, Tournament, TournamentStatus, Worker, WorkerStatus};

/// Current on-disk format version.
pub const STORE_VERSION: u32 = 1;

/// Persisted coordination record shared by all orchestrator processes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinationData {
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main_repo: Option<PathBuf>,
    #[serde(default)]
    pub workers: Vec<Worker>,
    #[serde(default)]
    pub tournaments: Vec<Tournament>,
}

impl Default for CoordinationData {
    fn default() -> Self {
        Self {
            version: STORE_VERSION,
            main_repo: None,
            workers: Vec::new(),
            tournaments: Vec::new(),
        }
    }
}

/// Fields needed to register a worker; id, timestamp and status are assigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewWorker {
    pub workspace_path: PathBuf,
    pub branch: String,
    pub task: String,
    pub pid: Option<u32>,
    pub terminal: String,
}

/// Selects workers either by id or by workspace path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerSelector {
    Id(u32),
    Path(PathBuf),
}

impl WorkerSelector {
    pub fn matches(&self, worker: &Worker) -> bool {
        match self {
            Self::Id(id) => worker.id == *id,
            Self::Path(path) => worker.workspace_path == *path,
        }
    }
}

/// Partial tournament update. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TournamentUpdate {
    pub status: Option<TournamentStatus>,
    pub combined_branch: Option<String>,
}

impl CoordinationData {
    /// One past the highest id ever present, or 1 for an empty store.
    pub fn next_worker_id(&self) -> u32 {
        self.workers
            .iter()
            .map(|w| w.id)
            .max()
            .map_or(1, |max| max + 1)
    }

    pub fn register_worker(&mut self, new: NewWorker, now: &str) -> u32 {
        let id = self.next_worker_id();
        self.workers.push(Worker {
            id,
            workspace_path: new.workspace_path,
            branch: new.branch,
            task: new.task,
            started_at: now.to_string(),
            status: WorkerStatus::Active,
            pid: new.pid,
            terminal: new.terminal,
        });
        id
    }

    /// Mark the first matching worker stopped. Returns whether any worker matched.
    pub fn stop_worker(&mut self, selector: &WorkerSelector) -> bool {
        match self.workers.iter_mut().find(|w| selector.matches(w)) {
            Some(worker) => {
                worker.status = WorkerStatus::Stopped;
                true
            }
            None => false,
        }
    }

    /// Delete every matching worker. Returns the number removed.
    pub fn remove_workers(&mut self, selector: &WorkerSelector) -> usize {
        let before = self.workers.len();
        self.workers.retain(|w| !selector.matches(w));
        before - self.workers.len()
    }

    pub fn worker_by_path(&self, path: &Path) -> Option<&Worker> {
        self.workers.iter().find(|w| w.workspace_path == path)
    }

    pub fn list_workers(&self, include_stopped: bool) -> Vec<&Worker> {
        self.workers
            .iter()
            .filter(|w| include_stopped || w.status == WorkerStatus::Active)
            .collect()
    }

    /// Stop active workers whose recorded process is gone. Returns the ids stopped.
    pub fn mark_stale<F>(&mut self, mut is_alive: F) -> Vec<u32>
    where
        F: FnMut(u32) -> bool,
    {
        let mut stopped = Vec::new();
        for worker in &mut self.workers {
            if worker.status != WorkerStatus::Active {
                continue;
            }
            if let Some(pid) = worker.pid
                && !is_alive(pid)
            {
                worker.status = WorkerStatus::Stopped;
                stopped.push(worker.id);
            }
        }
        stopped
    }

    pub fn register_tournament(&mut self, tournament: Tournament) -> Result<()> {
        if self.tournament(&tournament.id).is_some() {
            bail!("tournament {} already registered", tournament.id);
        }
        self.tournaments.push(tournament);
        Ok(())
    }

    pub fn tournament(&self, id: &str) -> Option<&Tournament> {
        self.tournaments.iter().find(|t| t.id == id)
    }

    fn tournament_mut(&mut self, id: &str) -> Option<&mut Tournament> {
        self.tournaments.iter_mut().find(|t| t.id == id)
    }

    pub fn active_tournaments(&self) -> Vec<&Tournament> {
        self.tournaments
            .iter()
            .filter(|t| t.status.is_active())
            .collect()
    }

    /// Apply a partial update. Returns `Ok(false)` when the tournament is unknown.
    ///
    /// Status changes must not regress, and `reviewing` requires every worker done.
    pub fn update_tournament(&mut self, id: &str, update: &TournamentUpdate) -> Result<bool> {
        let Some(tournament) = self.tournament_mut(id) else {
            return Ok(false);
        };
        if let Some(next) = update.status {
            if !tournament.status.can_advance_to(next) {
                bail!(
                    "tournament {id} cannot move from {} to {next}",
                    tournament.status
                );
            }
            if next == TournamentStatus::Reviewing {
                let completion = tournament.completion();
                if !completion.complete {
                    bail!(
                        "tournament {id} cannot enter reviewing: {} of {} workers done",
                        completion.done,
                        completion.total
                    );
                }
            }
            tournament.status = next;
        }
        if let Some(branch) = &update.combined_branch {
            tournament.combined_branch = Some(branch.clone());
        }
        Ok(true)
    }

    /// Record a worker's completion. Returns `Ok(false)` if it was already done.
    pub fn mark_tournament_worker_done(
        &mut self,
        id: &str,
        worker_id: u32,
        marker: Option<PathBuf>,
        now: &str,
    ) -> Result<bool> {
        let Some(tournament) = self.tournament_mut(id) else {
            bail!("tournament {id} not found");
        };
        let Some(worker) = tournament
            .workers
            .iter_mut()
            .find(|w| w.worker_id == worker_id)
        else {
            bail!("tournament {id} has no worker {worker_id}");
        };
        if worker.done {
            return Ok(false);
        }
        worker.done = true;
        worker.done_marker = marker;
        worker.completed_at = Some(now.to_string());
        Ok(true)
    }

    pub fn tournament_completion(&self, id: &str) -> Option<Completion> {
        self.tournament(id).map(Tournament::completion)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::TournamentWorker;

    const NOW: &str = "2026-01-01T00:00:00Z";

    fn new_worker(path: &str, pid: Option<u32>) -> NewWorker {
        NewWorker {
            workspace_path: PathBuf::from(path),
            branch: "feature".to_string(),
            task: "do the thing".to_string(),
            pid,
            terminal: "background".to_string(),
        }
    }

    fn tournament(id: &str, clis: &[&str]) -> Tournament {
        Tournament {
            id: id.to_string(),
            task: "task".to_string(),
            base_ref: "HEAD".to_string(),
            started_at: NOW.to_string(),
            status: TournamentStatus::Running,
            clis: clis.iter().map(|c| c.to_string()).collect(),
            workers: clis
                .iter()
                .zip(1u32..)
                .map(|(cli, n)| TournamentWorker {
                    worker_id: n,
                    cli: cli.to_string(),
                    workspace_path: PathBuf::from(format!("/tmp/{cli}")),
                    branch: format!("tournament/task-{cli}-{n}"),
                    done: false,
                    done_marker: None,
                    completed_at: None,
                })
                .collect(),
            combined_branch: None,
        }
    }

    #[test]
    fn empty_store_starts_at_one() {
        let data = CoordinationData::default();
        assert_eq!(data.next_worker_id(), 1);
        assert_eq!(data.version, STORE_VERSION);
    }

    #[test]
    fn ids_follow_the_maximum_even_after_removal() {
        let mut data = CoordinationData::default();
        assert_eq!(data.register_worker(new_worker("/a", None), NOW), 1);
        assert_eq!(data.register_worker(new_worker("/b", None), NOW), 2);
        assert_eq!(data.register_worker(new_worker("/c", None), NOW), 3);
        data.remove_workers(&WorkerSelector::Id(2));
        assert_eq!(data.next_worker_id(), 4);
    }

    #[test]
    fn stop_and_remove_are_no_ops_without_a_match() {
        let mut data = CoordinationData::default();
        data.register_worker(new_worker("/a", None), NOW);
        let before = data.clone();
        assert!(!data.stop_worker(&WorkerSelector::Id(9)));
        assert_eq!(data.remove_workers(&WorkerSelector::Path("/zzz".into())), 0);
        assert_eq!(data, before);
    }

    #[test]
    fn stop_by_path_keeps_record() {
        let mut data = CoordinationData::default();
        data.register_worker(new_worker("/a", None), NOW);
        assert!(data.stop_worker(&WorkerSelector::Path("/a".into())));
        assert_eq!(data.workers[0].status, WorkerStatus::Stopped);
        assert!(data.list_workers(false).is_empty());
        assert_eq!(data.list_workers(true).len(), 1);
    }

    #[test]
    fn mark_stale_only_touches_dead_active_workers() {
        let mut data = CoordinationData::default();
        data.register_worker(new_worker("/alive", Some(10)), NOW);
        data.register_worker(new_worker("/dead", Some(20)), NOW);
        data.register_worker(new_worker("/nopid", None), NOW);
        let stopped = data.mark_stale(|pid| pid == 10);
        assert_eq!(stopped, vec![2]);
        assert_eq!(data.workers[0].status, WorkerStatus::Active);
        assert_eq!(data.workers[2].status, WorkerStatus::Active);
    }

    #[test]
    fn duplicate_tournament_is_rejected() {
        let mut data = CoordinationData::default();
        data.register_tournament(tournament("t1", &["claude"]))
            .expect("register");
        assert!(data.register_tournament(tournament("t1", &["codex"])).is_err());
    }

    #[test]
    fn reviewing_requires_all_workers_done() {
        let mut data = CoordinationData::default();
        data.register_tournament(tournament("t1", &["claude", "codex"]))
            .expect("register");
        let to_reviewing = TournamentUpdate {
            status: Some(TournamentStatus::Reviewing),
            ..TournamentUpdate::default()
        };
        assert!(data.update_tournament("t1", &to_reviewing).is_err());

        assert!(data.mark_tournament_worker_done("t1", 1, None, NOW).expect("mark"));
        assert!(data.mark_tournament_worker_done("t1", 2, None, NOW).expect("mark"));
        assert!(data.update_tournament("t1", &to_reviewing).expect("update"));
        assert_eq!(
            data.tournament("t1").map(|t| t.status),
            Some(TournamentStatus::Reviewing)
        );
    }

    #[test]
    fn status_regression_is_rejected() {
        let mut data = CoordinationData::default();
        data.register_tournament(tournament("t1", &["claude"]))
            .expect("register");
        let complete = TournamentUpdate {
            status: Some(TournamentStatus::Complete),
            combined_branch: Some("tournament/task-combined".to_string()),
        };
        assert!(data.update_tournament("t1", &complete).expect("update"));
        let back = TournamentUpdate {
            status: Some(TournamentStatus::Running),
            ..TournamentUpdate::default()
        };
        assert!(data.update_tournament("t1", &back).is_err());
        let t = data.tournament("t1").expect("tournament");
        assert_eq!(t.combined_branch.as_deref(), Some("tournament/task-combined"));
    }

    #[test]
    fn unknown_tournament_update_reports_false() {
        let mut data = CoordinationData::default();
        let updated = data
            .update_tournament("missing", &TournamentUpdate::default())
            .expect("update");
        assert!(!updated);
        assert!(data.tournament_completion("missing").is_none());
    }

    #[test]
    fn marking_done_twice_keeps_first_timestamp() {
        let mut data = CoordinationData::default();
        data.register_tournament(tournament("t1", &["claude"]))
            .expect("register");
        assert!(data
            .mark_tournament_worker_done("t1", 1, Some("/tmp/claude/DONE.md".into()), NOW)
            .expect("mark"));
        assert!(!data
            .mark_tournament_worker_done("t1", 1, None, "2027-01-01T00:00:00Z")
            .expect("mark again"));
        let worker = data.tournament("t1").and_then(|t| t.worker(1)).expect("worker");
        assert_eq!(worker.completed_at.as_deref(), Some(NOW));
        assert!(worker.done_marker.is_some());
        assert!(data.mark_tournament_worker_done("t1", 7, None, NOW).is_err());
    }
}

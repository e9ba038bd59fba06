//! Coordination store shared by every orchestrator process of a repository.
//!
//! The store is a single JSON file guarded by an advisory lock on a sibling
//! `.lock` file. Every mutation holds the lock across read, modify and write,
//! and writes go through a temp file plus rename so readers never observe a
//! partially written store.

use std::fs::{self, File};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use fs2::FileExt;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::core::registry::{
    CoordinationData, NewWorker, STORE_VERSION, TournamentUpdate, WorkerSelector,
};
use crate::core::types::{Completion, Tournament, Worker};
use crate::io::fs_util::write_json;
use crate::io::process::is_process_alive;
use crate::io::timestamp::now_rfc3339;

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Store failures callers may need to tell apart.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("coordination store {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("coordination store {path} has unsupported version {found}")]
    UnsupportedVersion { path: PathBuf, found: u32 },
    #[error("coordination store {path} is busy: lock not acquired within {waited:?}")]
    Busy { path: PathBuf, waited: Duration },
}

/// Handle to the coordination file. Cheap to construct; holds no open files.
#[derive(Debug, Clone)]
pub struct CoordinationStore {
    path: PathBuf,
    lock_path: PathBuf,
    lock_timeout: Option<Duration>,
}

/// Exclusive lock held until dropped.
struct StoreLock {
    file: File,
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            warn!(err = %err, "failed to release store lock");
        }
    }
}

impl CoordinationStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut lock_name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        lock_name.push(".lock");
        let lock_path = path.with_file_name(lock_name);
        Self {
            path,
            lock_path,
            lock_timeout: None,
        }
    }

    /// Bound the lock wait. `None` waits indefinitely.
    pub fn with_lock_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<StoreLock> {
        if let Some(parent) = self.lock_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let file = File::options()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)
            .with_context(|| format!("open lock file {}", self.lock_path.display()))?;

        let Some(timeout) = self.lock_timeout else {
            file.lock_exclusive()
                .with_context(|| format!("lock {}", self.lock_path.display()))?;
            return Ok(StoreLock { file });
        };

        let started = Instant::now();
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(StoreLock { file }),
                Err(err) if is_contended(&err) => {
                    if started.elapsed() >= timeout {
                        warn!(waited_ms = started.elapsed().as_millis() as u64, "store lock busy");
                        return Err(StoreError::Busy {
                            path: self.path.clone(),
                            waited: timeout,
                        }
                        .into());
                    }
                    thread::sleep(LOCK_POLL_INTERVAL);
                }
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("lock {}", self.lock_path.display()));
                }
            }
        }
    }

    /// Read the current snapshot. A missing file is an empty store; a file
    /// that cannot be parsed is [`StoreError::Corrupt`].
    pub fn load(&self) -> Result<CoordinationData> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "store missing, using empty snapshot");
                return Ok(CoordinationData::default());
            }
            Err(err) => {
                return Err(err).with_context(|| format!("read {}", self.path.display()));
            }
        };
        let data: CoordinationData =
            serde_json::from_str(&contents).map_err(|source| StoreError::Corrupt {
                path: self.path.clone(),
                source,
            })?;
        if data.version > STORE_VERSION {
            return Err(StoreError::UnsupportedVersion {
                path: self.path.clone(),
                found: data.version,
            }
            .into());
        }
        Ok(data)
    }

    /// Replace the whole snapshot.
    #[instrument(skip_all, fields(path = %self.path.display()))]
    pub fn save(&self, data: &CoordinationData) -> Result<()> {
        let _lock = self.lock()?;
        write_json(&self.path, data)
    }

    /// Read-modify-write under the lock. Nothing is written if `f` fails.
    pub fn update<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut CoordinationData) -> Result<T>,
    {
        let _lock = self.lock()?;
        let mut data = self.load()?;
        let before = data.clone();
        let out = f(&mut data)?;
        if data != before {
            write_json(&self.path, &data)?;
        }
        Ok(out)
    }

    /// Record the repository root the store belongs to, once.
    pub fn ensure_main_repo(&self, repo_root: &Path) -> Result<()> {
        self.update(|data| {
            if data.main_repo.is_none() {
                data.main_repo = Some(repo_root.to_path_buf());
            }
            Ok(())
        })
    }

    #[instrument(skip_all, fields(path = %new.workspace_path.display()))]
    pub fn register_worker(&self, new: NewWorker) -> Result<u32> {
        let now = now_rfc3339();
        let id = self.update(|data| Ok(data.register_worker(new, &now)))?;
        info!(worker_id = id, "worker registered");
        Ok(id)
    }

    /// Mark the first matching worker stopped. Returns whether one matched.
    pub fn unregister_worker(&self, selector: &WorkerSelector) -> Result<bool> {
        self.update(|data| Ok(data.stop_worker(selector)))
    }

    /// Delete matching workers. Returns whether any were removed.
    pub fn remove_worker(&self, selector: &WorkerSelector) -> Result<bool> {
        self.update(|data| Ok(data.remove_workers(selector) > 0))
    }

    pub fn list_workers(&self, include_stopped: bool) -> Result<Vec<Worker>> {
        let data = self.load()?;
        Ok(data
            .list_workers(include_stopped)
            .into_iter()
            .cloned()
            .collect())
    }

    pub fn worker_by_path(&self, path: &Path) -> Result<Option<Worker>> {
        Ok(self.load()?.worker_by_path(path).cloned())
    }

    /// Stop workers whose process no longer exists. Returns the ids stopped.
    pub fn cleanup_stale_workers(&self) -> Result<Vec<u32>> {
        self.cleanup_stale_workers_with(is_process_alive)
    }

    pub fn cleanup_stale_workers_with<F>(&self, is_alive: F) -> Result<Vec<u32>>
    where
        F: FnMut(u32) -> bool,
    {
        let stopped = self.update(|data| Ok(data.mark_stale(is_alive)))?;
        if !stopped.is_empty() {
            info!(count = stopped.len(), "stale workers stopped");
        }
        Ok(stopped)
    }

    #[instrument(skip_all, fields(tournament_id = %tournament.id))]
    pub fn register_tournament(&self, tournament: Tournament) -> Result<String> {
        let id = tournament.id.clone();
        self.update(|data| data.register_tournament(tournament))?;
        info!("tournament registered");
        Ok(id)
    }

    pub fn tournament(&self, id: &str) -> Result<Option<Tournament>> {
        Ok(self.load()?.tournament(id).cloned())
    }

    /// Like [`Self::tournament`], but an unknown id is an error.
    pub fn require_tournament(&self, id: &str) -> Result<Tournament> {
        self.tournament(id)?
            .ok_or_else(|| anyhow!("tournament {id} not found"))
    }

    pub fn active_tournaments(&self) -> Result<Vec<Tournament>> {
        let data = self.load()?;
        Ok(data.active_tournaments().into_iter().cloned().collect())
    }

    pub fn all_tournaments(&self) -> Result<Vec<Tournament>> {
        Ok(self.load()?.tournaments)
    }

    /// Returns `false` when the tournament is unknown.
    pub fn update_tournament(&self, id: &str, update: &TournamentUpdate) -> Result<bool> {
        self.update(|data| data.update_tournament(id, update))
    }

    /// Returns `false` when the worker was already marked done.
    pub fn mark_tournament_worker_done(
        &self,
        id: &str,
        worker_id: u32,
        marker: Option<PathBuf>,
    ) -> Result<bool> {
        let now = now_rfc3339();
        self.update(|data| data.mark_tournament_worker_done(id, worker_id, marker, &now))
    }

    /// `None` when the tournament is unknown.
    pub fn tournament_completion(&self, id: &str) -> Result<Option<Completion>> {
        Ok(self.load()?.tournament_completion(id))
    }
}

fn is_contended(err: &std::io::Error) -> bool {
    err.kind() == fs2::lock_contended_error().kind() || err.kind() == ErrorKind::WouldBlock
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{TournamentStatus, WorkerStatus};

    fn store(dir: &Path) -> CoordinationStore {
        CoordinationStore::new(dir.join("arena").join("coordination.json"))
    }

    fn new_worker(path: &str) -> NewWorker {
        NewWorker {
            workspace_path: PathBuf::from(path),
            branch: "feature".to_string(),
            task: "task".to_string(),
            pid: Some(1),
            terminal: "background".to_string(),
        }
    }

    #[test]
    fn missing_store_loads_empty() {
        let temp = tempfile::tempdir().expect("tempdir");
        let data = store(temp.path()).load().expect("load");
        assert_eq!(data, CoordinationData::default());
    }

    #[test]
    fn corrupt_store_is_not_treated_as_empty() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        fs::create_dir_all(store.path().parent().expect("parent")).expect("mkdir");
        fs::write(store.path(), "{ not json").expect("write");
        let err = store.load().expect_err("corrupt");
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::Corrupt { .. })
        ));
        // mutations refuse to overwrite it
        assert!(store.register_worker(new_worker("/a")).is_err());
        assert_eq!(fs::read_to_string(store.path()).expect("read"), "{ not json");
    }

    #[test]
    fn newer_version_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        fs::create_dir_all(store.path().parent().expect("parent")).expect("mkdir");
        fs::write(store.path(), r#"{"version": 99, "workers": [], "tournaments": []}"#)
            .expect("write");
        let err = store.load().expect_err("version");
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::UnsupportedVersion { found: 99, .. })
        ));
    }

    #[test]
    fn register_unregister_remove() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        assert_eq!(store.register_worker(new_worker("/a")).expect("a"), 1);
        assert_eq!(store.register_worker(new_worker("/b")).expect("b"), 2);

        assert!(store.unregister_worker(&WorkerSelector::Id(1)).expect("stop"));
        assert!(!store.unregister_worker(&WorkerSelector::Id(42)).expect("stop missing"));
        let active = store.list_workers(false).expect("list");
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, 2);

        let stopped = store
            .worker_by_path(Path::new("/a"))
            .expect("lookup")
            .expect("worker");
        assert_eq!(stopped.status, WorkerStatus::Stopped);

        assert!(store.remove_worker(&WorkerSelector::Path("/a".into())).expect("remove"));
        assert_eq!(store.list_workers(true).expect("list").len(), 1);
        assert_eq!(store.register_worker(new_worker("/c")).expect("c"), 3);
    }

    #[test]
    fn cleanup_uses_liveness_probe() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        store.register_worker(new_worker("/a")).expect("a");
        let stopped = store.cleanup_stale_workers_with(|_| false).expect("cleanup");
        assert_eq!(stopped, vec![1]);
        assert!(store.list_workers(false).expect("list").is_empty());
    }

    #[test]
    fn cleanup_with_real_probe_stops_dead_pid() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        let mut dead = new_worker("/dead");
        dead.pid = Some(i32::MAX as u32);
        store.register_worker(dead).expect("dead");
        let mut alive = new_worker("/alive");
        alive.pid = Some(std::process::id());
        store.register_worker(alive).expect("alive");
        let stopped = store.cleanup_stale_workers().expect("cleanup");
        if cfg!(unix) {
            assert_eq!(stopped, vec![1]);
        }
    }

    #[test]
    fn failed_update_writes_nothing() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        store.register_worker(new_worker("/a")).expect("a");
        let before = fs::read_to_string(store.path()).expect("read");
        let result: Result<()> = store.update(|data| {
            data.workers.clear();
            Err(anyhow!("abort"))
        });
        assert!(result.is_err());
        assert_eq!(fs::read_to_string(store.path()).expect("read"), before);
    }

    #[test]
    fn busy_lock_times_out() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path()).with_lock_timeout(Some(Duration::from_millis(100)));
        let held = store.lock().expect("first lock");
        let other = CoordinationStore::new(store.path())
            .with_lock_timeout(Some(Duration::from_millis(100)));
        let err = other.save(&CoordinationData::default()).expect_err("busy");
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::Busy { .. })
        ));
        drop(held);
        other.save(&CoordinationData::default()).expect("save after release");
    }

    #[test]
    fn concurrent_updates_are_not_lost() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("coordination.json");
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let path = path.clone();
                thread::spawn(move || {
                    let store = CoordinationStore::new(path);
                    for i in 0..10 {
                        store
                            .register_worker(new_worker(&format!("/w{t}-{i}")))
                            .expect("register");
                    }
                })
            })
            .collect();
        let reader = {
            let path = path.clone();
            thread::spawn(move || {
                let store = CoordinationStore::new(path);
                for _ in 0..50 {
                    // every observed snapshot parses
                    store.load().expect("load during writes");
                    thread::sleep(Duration::from_millis(1));
                }
            })
        };
        for handle in handles {
            handle.join().expect("writer");
        }
        reader.join().expect("reader");

        let workers = CoordinationStore::new(&path).list_workers(true).expect("list");
        assert_eq!(workers.len(), 40);
        let mut ids: Vec<u32> = workers.iter().map(|w| w.id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 40);
    }

    #[test]
    fn tournament_lifecycle_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        let tournament = Tournament {
            id: "tournament-1".to_string(),
            task: "task".to_string(),
            base_ref: "HEAD".to_string(),
            started_at: now_rfc3339(),
            status: TournamentStatus::Running,
            clis: vec!["claude".to_string()],
            workers: vec![crate::core::types::TournamentWorker {
                worker_id: 1,
                cli: "claude".to_string(),
                workspace_path: PathBuf::from("/tmp/w"),
                branch: "tournament/task-claude-1".to_string(),
                done: false,
                done_marker: None,
                completed_at: None,
            }],
            combined_branch: None,
        };
        store.register_tournament(tournament).expect("register");
        assert_eq!(store.active_tournaments().expect("active").len(), 1);

        let completion = store
            .tournament_completion("tournament-1")
            .expect("completion")
            .expect("known");
        assert!(!completion.complete);
        assert!(store.tournament_completion("nope").expect("completion").is_none());

        assert!(store
            .mark_tournament_worker_done("tournament-1", 1, None)
            .expect("mark"));
        let update = TournamentUpdate {
            status: Some(TournamentStatus::Complete),
            combined_branch: Some("combined".to_string()),
        };
        assert!(store.update_tournament("tournament-1", &update).expect("update"));
        assert!(store.active_tournaments().expect("active").is_empty());
        assert_eq!(store.all_tournaments().expect("all").len(), 1);
        assert!(store.require_tournament("nope").is_err());
    }
}

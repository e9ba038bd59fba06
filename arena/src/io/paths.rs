//! Locations of arena state for a project.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use crate::io::config::{ArenaConfig, load_config};
use crate::io::coordination::CoordinationStore;
use crate::io::git::Git;

/// Directory name used inside the git common dir.
pub const STATE_DIR_NAME: &str = "arena";
/// Directory name used at the project root outside git.
pub const FALLBACK_STATE_DIR_NAME: &str = ".arena";

/// Filesystem layout under the arena state directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArenaPaths {
    /// Root of the project (work tree top level when inside git).
    pub project_root: PathBuf,
    pub state_dir: PathBuf,
    pub store_path: PathBuf,
    pub config_path: PathBuf,
    pub tournaments_dir: PathBuf,
}

impl ArenaPaths {
    pub fn new(project_root: impl Into<PathBuf>, state_dir: impl Into<PathBuf>) -> Self {
        let state_dir = state_dir.into();
        Self {
            project_root: project_root.into(),
            store_path: state_dir.join("coordination.json"),
            config_path: state_dir.join("config.toml"),
            tournaments_dir: state_dir.join("tournaments"),
            state_dir,
        }
    }

    /// Locate state for the project containing `start`.
    ///
    /// Inside git the state lives in the common `.git` dir, so every worktree of
    /// the repository shares one store. Otherwise it lives in `<start>/.arena`.
    pub fn discover(start: &Path) -> Result<Self> {
        let git = Git::new(start);
        if git.is_repo() {
            let root = git.toplevel().context("resolve repository root")?;
            let common = git.common_dir().context("resolve git common dir")?;
            debug!(root = %root.display(), common = %common.display(), "using git state dir");
            return Ok(Self::new(root, common.join(STATE_DIR_NAME)));
        }
        debug!(start = %start.display(), "not a git repository, using local state dir");
        Ok(Self::new(start, start.join(FALLBACK_STATE_DIR_NAME)))
    }

    pub fn load_config(&self) -> Result<ArenaConfig> {
        load_config(&self.config_path)
    }

    pub fn store(&self, config: &ArenaConfig) -> CoordinationStore {
        CoordinationStore::new(&self.store_path).with_lock_timeout(
            config
                .store
                .lock_timeout_secs
                .map(std::time::Duration::from_secs),
        )
    }

    pub fn reviews_dir(&self, config: &ArenaConfig) -> PathBuf {
        config.reviews_dir(&self.state_dir)
    }

    pub fn tournament_log(&self, tournament_id: &str, cli: &str) -> PathBuf {
        self.tournaments_dir
            .join(tournament_id)
            .join(format!("{cli}.log"))
    }
}

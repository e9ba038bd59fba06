//! Test-only helpers: finding builders, throwaway git repositories and scripted
//! agent fakes.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use tempfile::TempDir;

use crate::core::finding::{Category, Finding, Severity};
use crate::io::agents::{AgentInvocation, AgentRunner, SessionLauncher};
use crate::io::git::Git;
use crate::io::process::CommandOutput;

/// Create a finding with a deterministic id derived from its source and description.
pub fn finding(
    source: &str,
    file: Option<&str>,
    line: Option<u32>,
    category: Category,
    severity: Severity,
    description: &str,
) -> Finding {
    Finding {
        id: format!("{source}:{description}"),
        source: source.to_string(),
        category,
        severity,
        file: file.map(str::to_string),
        line,
        description: description.to_string(),
        suggestion: None,
    }
}

/// A git repository in a temp directory with one initial commit on `main`.
///
/// The repository lives in `<tempdir>/repo` so sibling worktrees created next to
/// it are cleaned up with the temp dir.
pub struct TestRepo {
    temp: TempDir,
    root: PathBuf,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("create tempdir")?;
        let root = temp.path().join("repo");
        fs::create_dir_all(&root).context("create repo dir")?;
        git(&root, &["init", "--initial-branch=main"])?;
        git(&root, &["config", "user.email", "test@example.com"])?;
        git(&root, &["config", "user.name", "test"])?;
        fs::write(root.join("README.md"), "hi\n").context("write README")?;
        git(&root, &["add", "README.md"])?;
        git(&root, &["commit", "-m", "chore: init"])?;
        Ok(Self { temp, root })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Directory that holds the repository and its sibling worktrees.
    pub fn parent(&self) -> &Path {
        self.temp.path()
    }

    pub fn git(&self) -> Git {
        Git::new(&self.root)
    }

    /// Write `contents` to `rel` inside `dir` and commit it there.
    pub fn commit_file_in(dir: &Path, rel: &str, contents: &str, message: &str) -> Result<()> {
        let path = dir.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
        git(dir, &["add", rel])?;
        git(dir, &["commit", "-m", message])?;
        Ok(())
    }

    pub fn commit_file(&self, rel: &str, contents: &str, message: &str) -> Result<()> {
        Self::commit_file_in(&self.root, rel, contents, message)
    }
}

fn git(dir: &Path, args: &[&str]) -> Result<()> {
    let status = Command::new("git")
        .args(args)
        .current_dir(dir)
        .status()
        .with_context(|| format!("spawn git {}", args.join(" ")))?;
    if !status.success() {
        bail!("git {} failed", args.join(" "));
    }
    Ok(())
}

/// Scripted result of one agent run.
#[derive(Debug, Clone)]
pub enum ScriptedRun {
    Exit {
        code: i32,
        stdout: String,
        stderr: String,
    },
    TimedOut,
    LaunchError(String),
}

impl ScriptedRun {
    pub fn ok(stdout: &str) -> Self {
        Self::Exit {
            code: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    pub fn fail(code: i32, stderr: &str) -> Self {
        Self::Exit {
            code,
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }
}

/// Agent runner that replays scripted outcomes and records every invocation.
///
/// Agents without a script are reported unavailable.
#[derive(Debug, Default)]
pub struct ScriptedAgentRunner {
    scripts: BTreeMap<String, (ScriptedRun, Duration)>,
    calls: Mutex<Vec<AgentInvocation>>,
}

impl ScriptedAgentRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_agent(mut self, agent: &str, run: ScriptedRun) -> Self {
        self.scripts
            .insert(agent.to_string(), (run, Duration::ZERO));
        self
    }

    /// Like [`Self::with_agent`], but the run takes `delay` before returning.
    pub fn with_delayed_agent(mut self, agent: &str, run: ScriptedRun, delay: Duration) -> Self {
        self.scripts.insert(agent.to_string(), (run, delay));
        self
    }

    pub fn calls(&self) -> Vec<AgentInvocation> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

impl AgentRunner for ScriptedAgentRunner {
    fn is_available(&self, agent: &str) -> bool {
        self.scripts.contains_key(agent)
    }

    fn run(
        &self,
        invocation: &AgentInvocation,
        _timeout: Duration,
        _output_limit_bytes: usize,
    ) -> Result<CommandOutput> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(invocation.clone());
        }
        let (run, delay) = self
            .scripts
            .get(&invocation.agent)
            .ok_or_else(|| anyhow!("no script for agent {}", invocation.agent))?;
        if !delay.is_zero() {
            thread::sleep(*delay);
        }
        match run {
            ScriptedRun::Exit {
                code,
                stdout,
                stderr,
            } => Ok(CommandOutput {
                exit_code: Some(*code),
                stdout: stdout.as_bytes().to_vec(),
                stderr: stderr.as_bytes().to_vec(),
                ..CommandOutput::default()
            }),
            ScriptedRun::TimedOut => Ok(CommandOutput {
                timed_out: true,
                ..CommandOutput::default()
            }),
            ScriptedRun::LaunchError(msg) => Err(anyhow!("{msg}")),
        }
    }
}

/// Launcher that records launches instead of starting processes.
#[derive(Debug, Default)]
pub struct RecordingLauncher {
    failing: BTreeSet<String>,
    launches: Mutex<Vec<(AgentInvocation, PathBuf)>>,
}

impl RecordingLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make launches of `agent` fail.
    pub fn failing(mut self, agent: &str) -> Self {
        self.failing.insert(agent.to_string());
        self
    }

    pub fn launches(&self) -> Vec<(AgentInvocation, PathBuf)> {
        self.launches.lock().map(|l| l.clone()).unwrap_or_default()
    }
}

impl SessionLauncher for RecordingLauncher {
    fn launch(&self, invocation: &AgentInvocation, log_path: &Path) -> Result<u32> {
        if self.failing.contains(&invocation.agent) {
            bail!("failed to launch {}", invocation.agent);
        }
        let mut launches = self
            .launches
            .lock()
            .map_err(|_| anyhow!("launch log poisoned"))?;
        launches.push((invocation.clone(), log_path.to_path_buf()));
        Ok(40_000 + launches.len() as u32)
    }
}

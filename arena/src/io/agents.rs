//! Agent CLI invocation: command building, availability probing, execution.
//!
//! The orchestrators talk to agents only through [`AgentRunner`] (blocking,
//! captured review runs) and [`SessionLauncher`] (detached tournament runs), so
//! tests can substitute scripted fakes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tracing::{debug, instrument};

use crate::io::config::{AgentSpec, ArenaConfig, validate_model_name};
use crate::io::process::{CommandOutput, run_command_with_timeout, spawn_detached};

/// Which flag set to pass to the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchMode {
    /// Non-interactive run whose stdout is the review.
    Review,
    /// Unattended run that edits a workspace.
    Autonomous,
}

impl AgentSpec {
    /// Model to use: explicit override, then `model_env`, then the configured
    /// (or fast) model.
    pub fn resolve_model(&self, override_model: Option<&str>, fast: bool) -> Result<Option<String>> {
        let from_env = || {
            self.model_env
                .as_deref()
                .and_then(|var| std::env::var(var).ok())
                .map(|m| m.trim().to_string())
                .filter(|m| !m.is_empty())
        };
        let configured = || {
            if fast {
                self.fast_model.clone().or_else(|| self.model.clone())
            } else {
                self.model.clone()
            }
        };
        let model = override_model
            .map(str::to_string)
            .or_else(from_env)
            .or_else(configured);
        if let Some(model) = &model {
            validate_model_name(model)?;
        }
        Ok(model)
    }

    pub fn build_args(&self, prompt: &str, model: Option<&str>, mode: LaunchMode) -> Vec<String> {
        let mut args = Vec::new();
        if let (Some(flag), Some(model)) = (&self.model_flag, model) {
            args.push(flag.clone());
            args.push(model.to_string());
        }
        match mode {
            LaunchMode::Review => args.extend(self.review_flags.iter().cloned()),
            LaunchMode::Autonomous => args.extend(self.autonomous_flags.iter().cloned()),
        }
        if let Some(flag) = &self.prompt_flag {
            args.push(flag.clone());
        }
        args.push(prompt.to_string());
        args
    }
}

/// A fully resolved agent command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentInvocation {
    pub agent: String,
    pub program: String,
    pub args: Vec<String>,
    pub model: Option<String>,
    pub workdir: PathBuf,
}

impl AgentInvocation {
    /// Resolve `agent` against the configured registry.
    pub fn build(
        config: &ArenaConfig,
        agent: &str,
        prompt: &str,
        model_override: Option<&str>,
        mode: LaunchMode,
        workdir: &Path,
    ) -> Result<Self> {
        let spec = config
            .agent(agent)
            .ok_or_else(|| anyhow!("unknown agent '{agent}'"))?;
        let model = spec.resolve_model(model_override, false)?;
        Ok(Self {
            agent: agent.to_string(),
            program: spec.command.clone(),
            args: spec.build_args(prompt, model.as_deref(), mode),
            model,
            workdir: workdir.to_path_buf(),
        })
    }

    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).current_dir(&self.workdir);
        cmd
    }
}

/// Runs an agent to completion and captures its output.
pub trait AgentRunner: Sync {
    /// Whether `agent` is known and its executable can be found.
    fn is_available(&self, agent: &str) -> bool;

    /// Run one invocation. `Err` means the agent could not be launched at all.
    fn run(
        &self,
        invocation: &AgentInvocation,
        timeout: Duration,
        output_limit_bytes: usize,
    ) -> Result<CommandOutput>;
}

/// Runs agents as real subprocesses found on `PATH`.
#[derive(Debug, Clone)]
pub struct ProcessAgentRunner {
    agents: BTreeMap<String, AgentSpec>,
}

impl ProcessAgentRunner {
    pub fn new(config: &ArenaConfig) -> Self {
        Self {
            agents: config.agents.clone(),
        }
    }
}

impl AgentRunner for ProcessAgentRunner {
    fn is_available(&self, agent: &str) -> bool {
        self.agents
            .get(agent)
            .is_some_and(|spec| which::which(&spec.command).is_ok())
    }

    #[instrument(skip_all, fields(agent = %invocation.agent))]
    fn run(
        &self,
        invocation: &AgentInvocation,
        timeout: Duration,
        output_limit_bytes: usize,
    ) -> Result<CommandOutput> {
        debug!(program = %invocation.program, "running agent");
        run_command_with_timeout(invocation.command(), None, timeout, output_limit_bytes)
    }
}

/// Starts an agent in the background and returns immediately.
pub trait SessionLauncher {
    /// Returns the pid of the started process.
    fn launch(&self, invocation: &AgentInvocation, log_path: &Path) -> Result<u32>;
}

/// Launches agents as detached subprocesses logging to a file.
#[derive(Debug, Clone, Copy, Default)]
pub struct BackgroundLauncher;

impl SessionLauncher for BackgroundLauncher {
    fn launch(&self, invocation: &AgentInvocation, log_path: &Path) -> Result<u32> {
        spawn_detached(invocation.command(), log_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ArenaConfig {
        ArenaConfig::default()
    }

    #[test]
    fn claude_review_uses_prompt_flag() {
        let spec = config().agents["claude"].clone();
        let args = spec.build_args("review this", Some("opus"), LaunchMode::Review);
        assert_eq!(
            args,
            vec![
                "--model",
                "opus",
                "--dangerously-skip-permissions",
                "-p",
                "review this"
            ]
        );
    }

    #[test]
    fn codex_modes_differ() {
        let spec = config().agents["codex"].clone();
        let review = spec.build_args("p", None, LaunchMode::Review);
        let auto = spec.build_args("p", None, LaunchMode::Autonomous);
        assert_eq!(review, vec!["--full-auto", "p"]);
        assert_eq!(auto, vec!["--dangerously-bypass-approvals-and-sandbox", "p"]);
    }

    #[test]
    fn explicit_model_wins_and_is_validated() {
        let spec = config().agents["gemini"].clone();
        assert_eq!(
            spec.resolve_model(Some("gemini-2.5-pro"), false).expect("model"),
            Some("gemini-2.5-pro".to_string())
        );
        assert!(spec.resolve_model(Some("x; rm -rf /"), false).is_err());
    }

    #[test]
    fn fast_model_falls_back_to_model() {
        let spec = AgentSpec {
            command: "tool".to_string(),
            model: Some("base".to_string()),
            ..AgentSpec::default()
        };
        assert_eq!(
            spec.resolve_model(None, true).expect("model"),
            Some("base".to_string())
        );
    }

    #[test]
    fn unknown_agent_cannot_be_built() {
        let err = AgentInvocation::build(
            &config(),
            "nope",
            "prompt",
            None,
            LaunchMode::Review,
            Path::new("."),
        )
        .expect_err("unknown");
        assert!(err.to_string().contains("unknown agent"));
    }

    #[test]
    fn unknown_agent_is_unavailable() {
        let runner = ProcessAgentRunner::new(&config());
        assert!(!runner.is_available("definitely-not-an-agent"));
    }
}

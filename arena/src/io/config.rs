//! Arena configuration stored under `<state dir>/config.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::normalize::NormalizeOptions;
use crate::core::similarity::DEFAULT_MATCH_THRESHOLD;
use crate::io::fs_util::write_atomic;

static MODEL_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\w.-]+$").expect("valid model regex"));

/// Arena configuration (TOML).
///
/// Every field is optional in the file. Agent tables are merged over the
/// built-in `claude`, `gemini` and `codex` definitions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ArenaConfig {
    pub review: ReviewConfig,
    pub aggregate: AggregateConfig,
    pub store: StoreConfig,
    pub agents: BTreeMap<String, AgentSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReviewConfig {
    /// Wall-clock budget per agent.
    pub timeout_minutes: u64,
    /// Agents used when a review does not name any.
    pub default_agents: Vec<String>,
    /// Captured stdout/stderr beyond this many bytes is dropped.
    pub output_limit_bytes: usize,
    /// Length of the stderr excerpt kept on a failed result.
    pub error_excerpt_chars: usize,
    /// Review artifact root. Defaults to `<state dir>/reviews`.
    pub output_dir: Option<PathBuf>,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            timeout_minutes: 10,
            default_agents: vec![
                "claude".to_string(),
                "gemini".to_string(),
                "codex".to_string(),
            ],
            output_limit_bytes: 1_000_000,
            error_excerpt_chars: 500,
            output_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AggregateConfig {
    /// Similarity score at or above which two findings match.
    pub match_threshold: f64,
    pub min_block_chars: usize,
    pub max_description_chars: usize,
}

impl Default for AggregateConfig {
    fn default() -> Self {
        let normalize = NormalizeOptions::default();
        Self {
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            min_block_chars: normalize.min_block_chars,
            max_description_chars: normalize.max_description_chars,
        }
    }
}

impl AggregateConfig {
    pub fn normalize_options(&self) -> NormalizeOptions {
        NormalizeOptions {
            min_block_chars: self.min_block_chars,
            max_description_chars: self.max_description_chars,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StoreConfig {
    /// Give up waiting for the store lock after this many seconds.
    /// Unset means wait indefinitely.
    pub lock_timeout_secs: Option<u64>,
}

/// How to invoke one agent CLI.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentSpec {
    /// Executable name or path.
    pub command: String,
    pub model: Option<String>,
    pub fast_model: Option<String>,
    /// Environment variable that overrides `model`.
    pub model_env: Option<String>,
    pub model_flag: Option<String>,
    /// Flag preceding the prompt. Unset means the prompt is positional.
    pub prompt_flag: Option<String>,
    /// Flags for non-interactive review runs.
    pub review_flags: Vec<String>,
    /// Flags for unattended tournament runs.
    pub autonomous_flags: Vec<String>,
    pub install_hint: Option<String>,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Built-in agent definitions.
pub fn builtin_agents() -> BTreeMap<String, AgentSpec> {
    let claude = AgentSpec {
        command: "claude".to_string(),
        model: Some("opus".to_string()),
        fast_model: Some("sonnet".to_string()),
        model_env: Some("ARENA_CLAUDE_MODEL".to_string()),
        model_flag: Some("--model".to_string()),
        prompt_flag: Some("-p".to_string()),
        review_flags: strings(&["--dangerously-skip-permissions"]),
        autonomous_flags: strings(&["--dangerously-skip-permissions"]),
        install_hint: Some("npm install -g @anthropic-ai/claude-code".to_string()),
    };
    let gemini = AgentSpec {
        command: "gemini".to_string(),
        model: Some("gemini-3-pro-preview".to_string()),
        fast_model: Some("gemini-3-flash-preview".to_string()),
        model_env: Some("ARENA_GEMINI_MODEL".to_string()),
        model_flag: Some("--model".to_string()),
        prompt_flag: None,
        review_flags: strings(&["-y"]),
        autonomous_flags: strings(&["-y"]),
        install_hint: Some("npm install -g @google/gemini-cli".to_string()),
    };
    let codex = AgentSpec {
        command: "codex".to_string(),
        model: Some("gpt-5.2-codex".to_string()),
        fast_model: Some("gpt-5.1-codex-mini".to_string()),
        model_env: Some("ARENA_CODEX_MODEL".to_string()),
        model_flag: Some("--model".to_string()),
        prompt_flag: None,
        review_flags: strings(&["--full-auto"]),
        autonomous_flags: strings(&["--dangerously-bypass-approvals-and-sandbox"]),
        install_hint: Some("npm install -g @openai/codex".to_string()),
    };
    BTreeMap::from([
        ("claude".to_string(), claude),
        ("gemini".to_string(), gemini),
        ("codex".to_string(), codex),
    ])
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            review: ReviewConfig::default(),
            aggregate: AggregateConfig::default(),
            store: StoreConfig::default(),
            agents: builtin_agents(),
        }
    }
}

/// Reject model names that could smuggle extra arguments or shell syntax.
pub fn validate_model_name(model: &str) -> Result<()> {
    if MODEL_NAME_RE.is_match(model) {
        Ok(())
    } else {
        Err(anyhow!("invalid model name '{model}'"))
    }
}

impl ArenaConfig {
    pub fn validate(&self) -> Result<()> {
        if self.review.timeout_minutes == 0 {
            return Err(anyhow!("review.timeout_minutes must be > 0"));
        }
        if self.review.output_limit_bytes == 0 {
            return Err(anyhow!("review.output_limit_bytes must be > 0"));
        }
        if self.review.error_excerpt_chars == 0 {
            return Err(anyhow!("review.error_excerpt_chars must be > 0"));
        }
        let threshold = self.aggregate.match_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(anyhow!("aggregate.match_threshold must be in (0, 1]"));
        }
        if self.aggregate.max_description_chars == 0 {
            return Err(anyhow!("aggregate.max_description_chars must be > 0"));
        }
        for (name, spec) in &self.agents {
            if spec.command.trim().is_empty() {
                return Err(anyhow!("agents.{name}.command must be non-empty"));
            }
            for model in [&spec.model, &spec.fast_model].into_iter().flatten() {
                validate_model_name(model).with_context(|| format!("agents.{name}"))?;
            }
        }
        Ok(())
    }

    pub fn agent(&self, name: &str) -> Option<&AgentSpec> {
        self.agents.get(name)
    }

    /// Review artifact root, honoring `review.output_dir`.
    pub fn reviews_dir(&self, state_dir: &Path) -> PathBuf {
        self.review
            .output_dir
            .clone()
            .unwrap_or_else(|| state_dir.join("reviews"))
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `ArenaConfig::default()`.
pub fn load_config(path: &Path) -> Result<ArenaConfig> {
    if !path.exists() {
        let cfg = ArenaConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let mut cfg: ArenaConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    let mut agents = builtin_agents();
    agents.append(&mut cfg.agents);
    cfg.agents = agents;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk.
pub fn write_config(path: &Path, cfg: &ArenaConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, buf.as_bytes())
}

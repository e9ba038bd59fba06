//! On-disk layout of review runs.
//!
//! ```text
//! <reviews dir>/<review id>/metadata.json
//! <reviews dir>/<review id>/<cli>.json
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;
use uuid::Uuid;

use crate::core::types::ExecutionResult;
use crate::io::fs_util::{read_json, write_json};
use crate::io::timestamp::compact_utc;

pub const METADATA_FILE: &str = "metadata.json";

/// Paths for one review run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewPaths {
    pub dir: PathBuf,
    pub metadata_path: PathBuf,
}

impl ReviewPaths {
    pub fn new(reviews_dir: &Path, review_id: &str) -> Self {
        let dir = reviews_dir.join(review_id);
        Self {
            metadata_path: dir.join(METADATA_FILE),
            dir,
        }
    }

    pub fn output_path(&self, cli: &str) -> PathBuf {
        self.dir.join(format!("{cli}.json"))
    }
}

/// Run-level record, written at start and rewritten when every agent finished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewMetadata {
    pub review_id: String,
    pub project_root: PathBuf,
    /// First 16 hex chars of the prompt's SHA-256.
    pub prompt_hash: String,
    pub prompt_length: usize,
    pub requested_clis: Vec<String>,
    pub available_clis: Vec<String>,
    pub missing_clis: Vec<String>,
    pub timeout_minutes: u64,
    pub started_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(default)]
    pub results: Vec<ExecutionResult>,
}

impl ReviewMetadata {
    pub fn result_for(&self, cli: &str) -> Option<&ExecutionResult> {
        self.results.iter().find(|r| r.cli == cli)
    }
}

/// Raw capture of one agent's run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentOutputRecord {
    pub cli: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub stdout: String,
    pub stderr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub timed_out: bool,
    #[serde(default)]
    pub stdout_truncated: usize,
    #[serde(default)]
    pub stderr_truncated: usize,
    pub timestamp: String,
}

/// `review-<UTC yyyymmdd_hhmmss>-<8 hex>`; sorts chronologically.
pub fn generate_review_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("review-{}-{}", compact_utc(), &suffix[..8])
}

pub fn prompt_hash(prompt: &str) -> String {
    let digest = Sha256::digest(prompt.as_bytes());
    hex::encode(&digest[..8])
}

pub fn write_metadata(paths: &ReviewPaths, metadata: &ReviewMetadata) -> Result<()> {
    write_json(&paths.metadata_path, metadata)
}

pub fn load_metadata(paths: &ReviewPaths) -> Result<ReviewMetadata> {
    read_json(&paths.metadata_path)
        .with_context(|| format!("load review metadata {}", paths.metadata_path.display()))
}

pub fn write_agent_output(path: &Path, record: &AgentOutputRecord) -> Result<()> {
    write_json(path, record)
}

pub fn read_agent_output(path: &Path) -> Result<AgentOutputRecord> {
    read_json(path)
}

/// All runs under `reviews_dir`, newest first.
///
/// Directories without readable metadata are skipped and reported as warnings.
pub fn list_reviews(reviews_dir: &Path) -> Result<(Vec<ReviewMetadata>, Vec<String>)> {
    let mut reviews = Vec::new();
    let mut warnings = Vec::new();
    if !reviews_dir.exists() {
        return Ok((reviews, warnings));
    }
    for entry in
        fs::read_dir(reviews_dir).with_context(|| format!("read {}", reviews_dir.display()))?
    {
        let entry = entry.context("read review entry")?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with("review-") || !entry.path().is_dir() {
            continue;
        }
        match load_metadata(&ReviewPaths::new(reviews_dir, &name)) {
            Ok(meta) => reviews.push(meta),
            Err(err) => {
                warn!(review = %name, err = %err, "skipping unreadable review");
                warnings.push(format!("{name}: {err:#}"));
            }
        }
    }
    reviews.sort_by(|a, b| b.review_id.cmp(&a.review_id));
    Ok((reviews, warnings))
}

//! Prompt templates handed to agents.

use std::path::Path;

use anyhow::Result;
use minijinja::{Environment, context};
use serde::Serialize;

use crate::core::types::{Completion, Tournament};

const TOURNAMENT_TASK_TEMPLATE: &str = include_str!("prompts/tournament_task.md");
const TOURNAMENT_REVIEW_TEMPLATE: &str = include_str!("prompts/tournament_review.md");

/// Completion marker agents create in their workspace root.
pub const DONE_FILE: &str = "DONE.md";

/// Task file written into each tournament workspace.
pub const TASK_FILE: &str = "TASK.md";

/// One solution as shown to the reviewing agent.
#[derive(Debug, Clone, Serialize)]
pub struct SolutionView<'a> {
    pub cli: &'a str,
    pub branch: &'a str,
    pub done: bool,
    pub commit_count: Option<u32>,
    pub files_changed: &'a [String],
    pub diff_stat: Option<&'a str>,
    pub done_summary: Option<&'a str>,
    pub errors: &'a [String],
}

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl Default for PromptEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptEngine {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("tournament_task", TOURNAMENT_TASK_TEMPLATE)
            .expect("tournament task template should be valid");
        env.add_template("tournament_review", TOURNAMENT_REVIEW_TEMPLATE)
            .expect("tournament review template should be valid");
        Self { env }
    }

    pub fn render_task(
        &self,
        tournament_id: &str,
        cli: &str,
        task: &str,
        branch: &str,
        workspace: &Path,
    ) -> Result<String> {
        let template = self.env.get_template("tournament_task")?;
        let rendered = template.render(context! {
            tournament_id => tournament_id,
            cli => cli,
            task => task.trim(),
            branch => branch,
            workspace => workspace.display().to_string(),
            done_file => DONE_FILE,
        })?;
        Ok(rendered)
    }

    pub fn render_review(
        &self,
        tournament: &Tournament,
        completion: &Completion,
        solutions: &[SolutionView<'_>],
    ) -> Result<String> {
        let template = self.env.get_template("tournament_review")?;
        let rendered = template.render(context! {
            tournament => tournament,
            completion => completion,
            solutions => solutions,
        })?;
        Ok(rendered)
    }
}

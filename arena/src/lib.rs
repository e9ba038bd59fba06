//! Multi-agent orchestration for AI coding CLIs.
//!
//! Several agent CLIs (claude, gemini, codex, ...) are run side by side either
//! as reviewers of the same prompt or as competitors on the same task. The crate
//! keeps the usual split:
//!
//! - **[`core`]**: Pure, deterministic logic (store snapshot operations, finding
//!   normalization, similarity, aggregation). No I/O.
//! - **[`io`]**: Side effects (store file and lock, subprocesses, git worktrees,
//!   review artifacts, configuration, prompt templates).
//!
//! Orchestration modules ([`review`], [`report`], [`tournament`], [`cli`])
//! combine the two to implement the `arena` commands.

pub mod cli;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod report;
pub mod review;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod tournament;

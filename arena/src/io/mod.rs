//! I/O helpers for arena commands.

pub mod agents;
pub mod config;
pub mod coordination;
pub mod fs_util;
pub mod git;
pub mod paths;
pub mod process;
pub mod prompt;
pub mod review_run;
pub mod timestamp;

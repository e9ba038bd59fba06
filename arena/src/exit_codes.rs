//! Stable exit codes for arena CLI commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Invalid input, unknown ids, or any other hard failure.
pub const INVALID: i32 = 1;
/// None of the requested agents is installed.
pub const NO_AGENTS: i32 = 2;
/// Every agent that ran failed, timed out, or could not be launched.
pub const ALL_FAILED: i32 = 3;
/// The coordination store lock could not be acquired in time.
pub const STORE_BUSY: i32 = 4;

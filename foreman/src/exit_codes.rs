//! Stable exit codes for `foreman` commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Invalid configuration, state or arguments, or any other error.
pub const INVALID: i32 = 1;
/// At least one dispatched task failed.
pub const TASK_FAILED: i32 = 2;

//! Stable exit codes for `coderun` commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Invalid input, config, or an unavailable sandbox environment.
pub const INVALID: i32 = 1;
/// The executed code raised or its result could not be decoded.
pub const EXECUTION_FAILED: i32 = 2;
/// The executed code ran past its time budget.
pub const TIMEOUT: i32 = 3;

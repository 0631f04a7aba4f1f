//! Stable exit codes for modeflow CLI commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Usage, I/O, config, or flow validation failure.
pub const INVALID: i32 = 1;
/// The patch was rejected by the safety checks and never applied.
pub const UNSAFE: i32 = 2;
/// The pipeline ran but the patch did not apply or verification failed.
pub const FAILED: i32 = 3;

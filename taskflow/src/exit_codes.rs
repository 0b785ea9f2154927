//! Stable exit codes for taskflow CLI commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Invalid arguments, config, or task file, or any other error.
pub const INVALID: i32 = 1;
/// A phase could not be constructed: context contract or template failure.
pub const PHASE_CONFIGURATION: i32 = 2;

//! Stable exit codes for rdloop CLI commands.

/// At least one recorded attempt passed the threshold, or a non-run command
/// succeeded.
pub const SOLVED: i32 = 0;
/// Invalid config, challenge, checkpoint or an aborted iteration.
pub const ERROR: i32 = 1;
/// The loop budget ran out (or the step limit hit) without a passing attempt.
pub const EXHAUSTED: i32 = 2;

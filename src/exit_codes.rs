//! Stable exit codes for the `conveyor` binary.

/// Workflow completed, or the command succeeded.
pub const OK: i32 = 0;
/// Any error: invalid input, exhausted resources, a failed phase, an abort.
pub const ERROR: i32 = 1;
/// The analyzer decomposed the issue into sub-issues; the run halted for triage.
pub const DECOMPOSED: i32 = 10;

//! Stable exit codes for `phaseloop` commands.

/// Command succeeded, or the session ended with the plan exhausted or the
/// cycle ceiling reached.
pub const OK: i32 = 0;
/// Invalid input, config or plan; the session never started.
pub const INVALID: i32 = 1;
/// The session was stopped on request.
pub const STOPPED: i32 = 3;
/// The session halted on a violated invariant.
pub const FATAL: i32 = 4;

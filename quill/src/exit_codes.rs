//! Stable exit codes for quill CLI commands.

/// Command succeeded; a run finished with the task completed.
pub const OK: i32 = 0;
/// Command failed due to invalid input, layout, config or other errors.
pub const INVALID: i32 = 1;
/// A run ended with the task failed (resumable with `quill resume`).
pub const FAILED: i32 = 2;
/// A run stopped at a step boundary because the task was paused or cancelled.
pub const STOPPED: i32 = 3;

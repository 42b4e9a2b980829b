//! Task state machine.
//!
//! `Queued -> Running -> {Completed, Failed, Paused, Cancelled}` with
//! `Running <-> Paused` on explicit request. Operator resume may also re-enter a
//! `Failed` task at its checkpoint, or a `Running` task whose process died.

use serde::{Deserialize, Serialize};

use crate::core::types::TaskStatus;

/// A lifecycle action applied to a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Start,
    Resume,
    Pause,
    Cancel,
    Complete,
    Fail,
}

impl Action {
    fn as_str(self) -> &'static str {
        match self {
            Action::Start => "start",
            Action::Resume => "resume",
            Action::Pause => "pause",
            Action::Cancel => "cancel",
            Action::Complete => "complete",
            Action::Fail => "fail",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot {} a task that is {from}", action.as_str())]
pub struct LifecycleError {
    pub action: Action,
    pub from: TaskStatus,
}

/// A pending request from outside the running process, honored at the next step boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlRequest {
    Pause,
    Cancel,
}

/// Compute the status after applying `action` to a task in `from`.
pub fn next_status(from: TaskStatus, action: Action) -> Result<TaskStatus, LifecycleError> {
    use TaskStatus::{Cancelled, Completed, Failed, Paused, Queued, Running};

    let next = match (action, from) {
        (Action::Start, Queued) => Running,
        // `Running` here is a checkpoint left behind by a process that died mid-step.
        (Action::Resume, Paused | Failed | Running | Queued) => Running,
        (Action::Pause, Running | Paused) => Paused,
        (Action::Cancel, Queued | Running | Paused | Failed | Cancelled) => Cancelled,
        (Action::Complete, Running) => Completed,
        (Action::Fail, Running) => Failed,
        _ => return Err(LifecycleError { action, from }),
    };
    Ok(next)
}

/// Whether a pause request can be recorded for a task in `status`.
pub fn accepts_pause_request(status: TaskStatus) -> bool {
    matches!(status, TaskStatus::Running | TaskStatus::Paused)
}

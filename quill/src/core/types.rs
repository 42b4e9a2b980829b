//! Shared deterministic types for the pipeline core.
//!
//! These types define the persisted contracts between the orchestrator, the
//! lifecycle API and the task store. They carry no I/O and serialize to a
//! stable JSON shape.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// Completed, Failed and Cancelled tasks never advance on their own.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Workflow-level fallbacks applied to steps without overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepDefaults {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine: Option<String>,
}

/// One unit of a workflow, bound to a role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Role identifier; selects the base instructions.
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Backend engine selector (key into `[engines]`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine: Option<String>,
    /// Text prepended to the role's base instructions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handoff: Option<String>,
    /// Logical name of the document this step produces. Defaults to the role.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<String>,
}

impl Step {
    pub fn document_name(&self) -> &str {
        self.document.as_deref().unwrap_or(&self.role)
    }
}

/// Ordered list of steps. Tasks snapshot the whole value at creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub defaults: StepDefaults,
    #[serde(default)]
    pub steps: Vec<Step>,
}

/// A named document accumulated on a task.
///
/// `path` is relative to the task directory so checkpoints stay valid when the
/// state directory moves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub path: PathBuf,
    /// Index of the step that produced the document; `None` for the initial request.
    pub produced_by: Option<usize>,
}

/// Outcome of one executed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepOutcome {
    Completed,
    Failed,
}

/// Audit record of one step attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub index: usize,
    pub role: String,
    pub outcome: StepOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Masked id of the credential that served the final backend call.
    pub credential: Option<String>,
    pub succeeded: usize,
    pub failed: usize,
    pub error: Option<String>,
}

/// Persisted task checkpoint (`.quill/tasks/<id>/task.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub workflow: Workflow,
    pub current_step_index: usize,
    pub status: TaskStatus,
    pub working_dir: PathBuf,
    pub documents: BTreeMap<String, Document>,
    #[serde(default)]
    pub steps: Vec<StepRecord>,
    #[serde(default)]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn total_steps(&self) -> usize {
        self.workflow.steps.len()
    }

    /// Documents ordered by the step that produced them; the request comes first.
    pub fn documents_in_step_order(&self) -> Vec<(&str, &Document)> {
        let mut docs: Vec<(&str, &Document)> = self
            .documents
            .iter()
            .map(|(name, doc)| (name.as_str(), doc))
            .collect();
        docs.sort_by(|(a_name, a), (b_name, b)| {
            // `None` sorts before `Some`, which keeps the seeded request first.
            a.produced_by
                .cmp(&b.produced_by)
                .then_with(|| a_name.cmp(b_name))
        });
        docs
    }
}

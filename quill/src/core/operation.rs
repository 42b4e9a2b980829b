//! Canonical file operations and the per-batch report.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One file-system mutation derived from backend output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    /// Target path relative to the working directory.
    pub path: String,
    #[serde(flatten)]
    pub kind: OperationKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum OperationKind {
    Write {
        content: String,
    },
    Append {
        content: String,
    },
    Delete,
    Search {
        text: String,
    },
    CreateDir,
    Replace {
        /// Text to substitute. Required unless `line` is set.
        search: Option<String>,
        replace: String,
        /// 1-based line number for line-targeted mode. Kept signed so that
        /// out-of-range values survive parsing and are reported.
        line: Option<i64>,
    },
}

impl OperationKind {
    pub fn verb(&self) -> &'static str {
        match self {
            OperationKind::Write { .. } => "write",
            OperationKind::Append { .. } => "append",
            OperationKind::Delete => "delete",
            OperationKind::Search { .. } => "search",
            OperationKind::CreateDir => "create_dir",
            OperationKind::Replace { .. } => "replace",
        }
    }

    /// Verbs that create their target when it does not exist.
    pub fn creates_target(&self) -> bool {
        matches!(
            self,
            OperationKind::Write { .. } | OperationKind::Append { .. } | OperationKind::CreateDir
        )
    }

    /// Verbs that may be redirected to a similarly named existing file.
    pub fn resolves_fuzzily(&self) -> bool {
        matches!(
            self,
            OperationKind::Write { .. }
                | OperationKind::Append { .. }
                | OperationKind::Search { .. }
                | OperationKind::Replace { .. }
        )
    }
}

/// Why a single operation failed. Never aborts the batch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OperationError {
    #[error("invalid operation entry: {0}")]
    InvalidEntry(String),
    #[error("path escapes the working directory: {0}")]
    PathEscapesWorkspace(String),
    #[error("target not found: {0}")]
    NotFound(String),
    #[error("invalid line number {0} (lines start at 1)")]
    InvalidLine(i64),
    #[error("line {line} is out of range (file has {len} lines)")]
    LineOutOfRange { line: i64, len: usize },
    #[error("search text not found")]
    SearchNotFound,
    #[error("{0}")]
    Io(String),
}

impl OperationError {
    pub fn kind(&self) -> &'static str {
        match self {
            OperationError::InvalidEntry(_) => "invalid_entry",
            OperationError::PathEscapesWorkspace(_) => "path_escapes_workspace",
            OperationError::NotFound(_) => "not_found",
            OperationError::InvalidLine(_) => "invalid_line",
            OperationError::LineOutOfRange { .. } => "line_out_of_range",
            OperationError::SearchNotFound => "search_not_found",
            OperationError::Io(_) => "io",
        }
    }
}

/// Which shape matcher accepted the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Shape {
    Structured,
    Legacy,
    Fallback,
}

/// Observable effect of a successful operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "effect", rename_all = "snake_case")]
pub enum OperationOutcome {
    Written { bytes: usize },
    Appended { bytes: usize, created: bool },
    Deleted { existed: bool },
    DirCreated { existed: bool },
    Searched { found: bool, occurrences: usize },
    Replaced { replacements: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedOperation {
    /// Position of the operation in the batch (0-based).
    pub index: usize,
    pub operation: Operation,
    /// Path actually touched, relative to the working directory.
    pub resolved_path: String,
    pub outcome: OperationOutcome,
}

/// Ledger entry for one failed operation. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub at: DateTime<Utc>,
    pub index: usize,
    /// The entry as the backend emitted it.
    pub operation: Value,
    pub kind: String,
    pub error: String,
}

impl FailureRecord {
    pub fn new(at: DateTime<Utc>, index: usize, operation: Value, err: &OperationError) -> Self {
        Self {
            at,
            index,
            operation,
            kind: err.kind().to_string(),
            error: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplyReport {
    pub shape: Shape,
    pub succeeded: Vec<AppliedOperation>,
    pub failed: Vec<FailureRecord>,
}

impl ApplyReport {
    pub fn succeeded_indices(&self) -> Vec<usize> {
        self.succeeded.iter().map(|op| op.index).collect()
    }

    pub fn failed_indices(&self) -> Vec<usize> {
        self.failed.iter().map(|f| f.index).collect()
    }
}

//! Apply backend output to a working directory as file operations.
//!
//! Each operation is isolated: a failure becomes a [`FailureRecord`] and the
//! batch continues. Only output with no recognizable JSON shape is an error.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::core::extract::{ParsedBatch, parse_output};
use crate::core::lines::{replace_all, replace_in_line};
use crate::core::operation::{
    AppliedOperation, ApplyReport, FailureRecord, Operation, OperationError, OperationKind,
    OperationOutcome,
};
use crate::io::atomic::write_atomic;
use crate::io::config::ResolveConfig;
use crate::io::resolve::{Resolution, resolve_target};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MutationError {
    #[error("backend output contains no recognizable file operations")]
    UnparseableOutput,
    #[error("working directory {0} does not exist")]
    MissingWorkingDir(String),
}

#[derive(Debug, Clone, Default)]
pub struct MutationEngine {
    resolve: ResolveConfig,
}

impl MutationEngine {
    pub fn new(resolve: ResolveConfig) -> Self {
        Self { resolve }
    }

    /// Parse `raw` and apply every operation it contains, in order.
    #[instrument(skip_all, fields(workdir = %working_dir.display(), bytes = raw.len()))]
    pub fn apply(&self, working_dir: &Path, raw: &str) -> Result<ApplyReport, MutationError> {
        if !working_dir.is_dir() {
            return Err(MutationError::MissingWorkingDir(
                working_dir.display().to_string(),
            ));
        }
        let ParsedBatch { shape, entries } =
            parse_output(raw).ok_or(MutationError::UnparseableOutput)?;
        debug!(?shape, entries = entries.len(), "parsed backend output");

        let mut report = ApplyReport {
            shape,
            succeeded: Vec::new(),
            failed: Vec::new(),
        };
        for entry in entries {
            let result = entry
                .operation
                .clone()
                .and_then(|op| self.apply_one(working_dir, &op).map(|applied| (op, applied)));
            match result {
                Ok((operation, (resolved_path, outcome))) => {
                    report.succeeded.push(AppliedOperation {
                        index: entry.index,
                        operation,
                        resolved_path,
                        outcome,
                    });
                }
                Err(err) => {
                    warn!(index = entry.index, kind = err.kind(), err = %err, "operation failed");
                    report
                        .failed
                        .push(FailureRecord::new(Utc::now(), entry.index, entry.snapshot, &err));
                }
            }
        }
        info!(
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            "applied backend output"
        );
        Ok(report)
    }

    fn apply_one(
        &self,
        root: &Path,
        op: &Operation,
    ) -> Result<(String, OperationOutcome), OperationError> {
        let resolution = resolve_target(root, &op.path, &op.kind, &self.resolve)?;
        if let Resolution::Fuzzy { path, tier } = &resolution {
            info!(requested = %op.path, resolved = %path.display(), ?tier, "using similarly named file");
        }
        let relative = resolution.path().to_path_buf();
        let target = root.join(&relative);

        let outcome = match &op.kind {
            OperationKind::Write { content } => {
                write_file(&target, content.as_bytes())?;
                OperationOutcome::Written {
                    bytes: content.len(),
                }
            }
            OperationKind::Append { content } => {
                let created = !target.exists();
                let mut combined = if created {
                    Vec::new()
                } else {
                    read_bytes(&target)?
                };
                combined.extend_from_slice(content.as_bytes());
                write_file(&target, &combined)?;
                OperationOutcome::Appended {
                    bytes: content.len(),
                    created,
                }
            }
            OperationKind::Delete => OperationOutcome::Deleted {
                existed: delete_path(&target)?,
            },
            OperationKind::CreateDir => {
                if target.exists() && !target.is_dir() {
                    return Err(OperationError::Io(format!(
                        "{} exists and is not a directory",
                        relative.display()
                    )));
                }
                let existed = target.is_dir();
                fs::create_dir_all(&target).map_err(|e| io_error("create directory", &target, &e))?;
                OperationOutcome::DirCreated { existed }
            }
            OperationKind::Search { text } => {
                let contents = read_text(&target)?;
                let occurrences = contents.matches(text.as_str()).count();
                OperationOutcome::Searched {
                    found: occurrences > 0,
                    occurrences,
                }
            }
            OperationKind::Replace {
                search,
                replace,
                line,
            } => {
                let contents = read_text(&target)?;
                let (updated, replacements) = match (line, search) {
                    (Some(line), search) => {
                        replace_in_line(&contents, *line, search.as_deref(), replace)?
                    }
                    (None, Some(search)) => replace_all(&contents, search, replace)?,
                    (None, None) => {
                        return Err(OperationError::InvalidEntry(
                            "replace needs 'search' text or a 'line'".to_string(),
                        ));
                    }
                };
                write_file(&target, updated.as_bytes())?;
                OperationOutcome::Replaced { replacements }
            }
        };
        Ok((relative.display().to_string(), outcome))
    }
}

fn io_error(action: &str, path: &Path, err: &std::io::Error) -> OperationError {
    OperationError::Io(format!("{action} {}: {err}", path.display()))
}

fn read_bytes(path: &Path) -> Result<Vec<u8>, OperationError> {
    fs::read(path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => OperationError::NotFound(path.display().to_string()),
        _ => io_error("read", path, &e),
    })
}

fn read_text(path: &Path) -> Result<String, OperationError> {
    if path.is_dir() {
        return Err(OperationError::Io(format!("{} is a directory", path.display())));
    }
    let bytes = read_bytes(path)?;
    String::from_utf8(bytes)
        .map_err(|_| OperationError::Io(format!("{} is not valid UTF-8", path.display())))
}

fn write_file(path: &Path, contents: &[u8]) -> Result<(), OperationError> {
    if path.is_dir() {
        return Err(OperationError::Io(format!("{} is a directory", path.display())));
    }
    write_atomic(path, contents).map_err(|e| OperationError::Io(format!("{e:#}")))
}

/// Remove a file or directory tree. Returns whether anything existed.
fn delete_path(path: &Path) -> Result<bool, OperationError> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(io_error("stat", path, &e)),
    };
    let result = if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match result {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(io_error("delete", path, &e)),
    }
}

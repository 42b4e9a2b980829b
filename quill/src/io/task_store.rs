//! Task checkpoints, control requests and task documents.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::lifecycle::ControlRequest;
use crate::core::types::{Document, Task};
use crate::io::atomic::{write_atomic, write_json_atomic};
use crate::io::layout::{QuillPaths, TaskPaths};

/// Load a task checkpoint.
pub fn load_task(paths: &TaskPaths) -> Result<Task> {
    let path = &paths.task_path;
    if !path.exists() {
        return Err(anyhow!("task checkpoint {} does not exist", path.display()));
    }
    let contents = fs::read_to_string(path)
        .with_context(|| format!("read task checkpoint {}", path.display()))?;
    let task: Task = serde_json::from_str(&contents)
        .with_context(|| format!("parse task checkpoint {}", path.display()))?;
    debug!(task = %task.id, status = %task.status, step = task.current_step_index, "task loaded");
    Ok(task)
}

/// Atomically write a task checkpoint.
pub fn save_task(paths: &TaskPaths, task: &Task) -> Result<()> {
    debug!(task = %task.id, status = %task.status, step = task.current_step_index, "writing task checkpoint");
    write_json_atomic(&paths.task_path, task)
}

/// Every task under `.quill/tasks/`, oldest first.
pub fn list_tasks(paths: &QuillPaths) -> Result<Vec<Task>> {
    if !paths.tasks_dir.exists() {
        return Ok(Vec::new());
    }
    let mut tasks = Vec::new();
    for entry in fs::read_dir(&paths.tasks_dir)
        .with_context(|| format!("read tasks dir {}", paths.tasks_dir.display()))?
    {
        let entry = entry.context("read tasks dir entry")?;
        let task_paths = TaskPaths::new(entry.path());
        if task_paths.task_path.is_file() {
            tasks.push(load_task(&task_paths)?);
        }
    }
    tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    Ok(tasks)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ControlFile {
    request: ControlRequest,
}

/// Record a pause or cancel request. A cancel is never downgraded to a pause.
pub fn write_control(paths: &TaskPaths, request: ControlRequest) -> Result<()> {
    let effective = match (read_control(paths)?, request) {
        (Some(ControlRequest::Cancel), _) => ControlRequest::Cancel,
        (_, request) => request,
    };
    debug!(path = %paths.control_path.display(), request = ?effective, "writing control request");
    write_json_atomic(&paths.control_path, &ControlFile { request: effective })
}

pub fn read_control(paths: &TaskPaths) -> Result<Option<ControlRequest>> {
    let path = &paths.control_path;
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(path)
        .with_context(|| format!("read control request {}", path.display()))?;
    let file: ControlFile = serde_json::from_str(&contents)
        .with_context(|| format!("parse control request {}", path.display()))?;
    Ok(Some(file.request))
}

pub fn clear_control(paths: &TaskPaths) -> Result<()> {
    let path = &paths.control_path;
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("remove control request {}", path.display())),
    }
}

/// Write a document body under the task directory and return its entry.
pub fn write_document(
    paths: &TaskPaths,
    relative: &Path,
    contents: &str,
    produced_by: Option<usize>,
) -> Result<Document> {
    write_atomic(&paths.dir.join(relative), contents.as_bytes())?;
    Ok(Document {
        path: relative.to_path_buf(),
        produced_by,
    })
}

pub fn read_document(paths: &TaskPaths, document: &Document) -> Result<String> {
    let path = paths.dir.join(&document.path);
    fs::read_to_string(&path).with_context(|| format!("read document {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{StepDefaults, TaskStatus, Workflow};
    use chrono::Utc;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn task(id: &str) -> Task {
        let now = Utc::now();
        Task {
            id: id.to_string(),
            workflow: Workflow {
                id: "wf".to_string(),
                description: None,
                defaults: StepDefaults::default(),
                steps: Vec::new(),
            },
            current_step_index: 2,
            status: TaskStatus::Paused,
            working_dir: PathBuf::from("/tmp/work"),
            documents: BTreeMap::new(),
            steps: Vec::new(),
            last_error: Some("boom".to_string()),
            created_at: now,
            updated_at: now,
        }
    }

    /// Verifies write -> read preserves every checkpoint field.
    #[test]
    fn checkpoint_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = QuillPaths::new(temp.path()).task("t1");
        let mut original = task("t1");
        let doc = write_document(&paths, Path::new("request.md"), "hello", None).expect("doc");
        original.documents.insert("request".to_string(), doc.clone());

        save_task(&paths, &original).expect("save");
        assert_eq!(load_task(&paths).expect("load"), original);
        assert_eq!(read_document(&paths, &doc).expect("read doc"), "hello");
    }

    #[test]
    fn missing_checkpoint_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = QuillPaths::new(temp.path()).task("none");
        let err = load_task(&paths).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn cancel_is_sticky_over_pause() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = QuillPaths::new(temp.path()).task("t1");
        assert_eq!(read_control(&paths).expect("read"), None);

        write_control(&paths, ControlRequest::Cancel).expect("cancel");
        write_control(&paths, ControlRequest::Pause).expect("pause");
        assert_eq!(
            read_control(&paths).expect("read"),
            Some(ControlRequest::Cancel)
        );

        clear_control(&paths).expect("clear");
        clear_control(&paths).expect("clear twice");
        assert_eq!(read_control(&paths).expect("read"), None);
    }

    #[test]
    fn list_tasks_orders_by_creation() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = QuillPaths::new(temp.path());
        let mut older = task("b");
        older.created_at = Utc::now() - chrono::TimeDelta::seconds(60);
        save_task(&root.task("b"), &older).expect("save");
        save_task(&root.task("a"), &task("a")).expect("save");

        let ids: Vec<String> = list_tasks(&root)
            .expect("list")
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ids, vec!["b", "a"]);
    }
}

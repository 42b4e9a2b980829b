//! Canonical paths within `.quill/` and the `init` scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use crate::io::config::{QuillConfig, write_config};

/// All canonical paths within `.quill/` for a project root.
#[derive(Debug, Clone)]
pub struct QuillPaths {
    pub root: PathBuf,
    pub quill_dir: PathBuf,
    pub config_path: PathBuf,
    pub state_dir: PathBuf,
    pub pool_path: PathBuf,
    pub credentials_path: PathBuf,
    pub rotations_path: PathBuf,
    pub workflows_dir: PathBuf,
    pub tasks_dir: PathBuf,
    pub workspaces_dir: PathBuf,
    pub gitignore_path: PathBuf,
}

impl QuillPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let quill_dir = root.join(".quill");
        let state_dir = quill_dir.join("state");
        Self {
            root: root.clone(),
            config_path: quill_dir.join("config.toml"),
            pool_path: state_dir.join("pool.json"),
            credentials_path: state_dir.join("credentials.json"),
            rotations_path: state_dir.join("rotations.jsonl"),
            workflows_dir: quill_dir.join("workflows"),
            tasks_dir: quill_dir.join("tasks"),
            workspaces_dir: quill_dir.join("workspaces"),
            gitignore_path: quill_dir.join(".gitignore"),
            state_dir,
            quill_dir,
        }
    }

    pub fn task(&self, task_id: &str) -> TaskPaths {
        TaskPaths::new(self.tasks_dir.join(task_id))
    }

    pub fn workflow_path(&self, workflow_id: &str) -> PathBuf {
        self.workflows_dir.join(format!("{workflow_id}.toml"))
    }

    pub fn default_workspace(&self, task_id: &str) -> PathBuf {
        self.workspaces_dir.join(task_id)
    }
}

/// Paths for one task directory (`.quill/tasks/<id>/`).
#[derive(Debug, Clone)]
pub struct TaskPaths {
    pub dir: PathBuf,
    pub task_path: PathBuf,
    pub failures_path: PathBuf,
    pub control_path: PathBuf,
    pub request_path: PathBuf,
    pub steps_dir: PathBuf,
}

impl TaskPaths {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            task_path: dir.join("task.json"),
            failures_path: dir.join("failures.jsonl"),
            control_path: dir.join("control.json"),
            request_path: dir.join("request.md"),
            steps_dir: dir.join("steps"),
            dir,
        }
    }

    pub fn step(&self, index: usize) -> StepPaths {
        StepPaths::new(self.steps_dir.join(index.to_string()))
    }
}

/// Audit artefacts for one step (`.quill/tasks/<id>/steps/<i>/`).
#[derive(Debug, Clone)]
pub struct StepPaths {
    pub dir: PathBuf,
    pub prompt_path: PathBuf,
    pub output_path: PathBuf,
    pub report_path: PathBuf,
    pub backend_log_path: PathBuf,
}

impl StepPaths {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            prompt_path: dir.join("prompt.md"),
            output_path: dir.join("output.md"),
            report_path: dir.join("report.json"),
            backend_log_path: dir.join("backend.log"),
            dir,
        }
    }
}

/// Options for `init_quill`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, rewrite the default config and sample workflow.
    pub force: bool,
}

/// Create `.quill/` scaffolding in `root`.
///
/// Fails if `.quill/` already exists unless `options.force` is set. Task and
/// pool state are never touched by a forced init.
pub fn init_quill(root: &Path, options: &InitOptions) -> Result<QuillPaths> {
    let paths = QuillPaths::new(root);
    if paths.quill_dir.exists() && !paths.quill_dir.is_dir() {
        return Err(anyhow!("quill init: .quill exists but is not a directory"));
    }
    if paths.quill_dir.exists() && !options.force {
        return Err(anyhow!(
            "quill init: .quill already exists (use --force to overwrite)"
        ));
    }

    for dir in [
        &paths.quill_dir,
        &paths.state_dir,
        &paths.workflows_dir,
        &paths.tasks_dir,
        &paths.workspaces_dir,
    ] {
        fs::create_dir_all(dir).with_context(|| format!("create directory {}", dir.display()))?;
    }

    write_config(&paths.config_path, &QuillConfig::default())?;
    write_file(&paths.workflow_path("example"), EXAMPLE_WORKFLOW)?;
    write_file(&paths.gitignore_path, QUILL_GITIGNORE)?;
    Ok(paths)
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write file {}", path.display()))
}

const QUILL_GITIGNORE: &str = "state/credentials.json\ntasks/\nworkspaces/\n";

const EXAMPLE_WORKFLOW: &str = r#"description = "Brief, outline, then draft"

[defaults]
temperature = 0.7

[[steps]]
role = "analyst"
document = "brief"

[[steps]]
role = "architect"
document = "outline"
handoff = "Build on the brief; keep the structure flat."

[[steps]]
role = "writer"
document = "draft"
temperature = 0.9
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Workflow;

    /// Verifies `init_quill` creates the directory layout, config and sample workflow.
    #[test]
    fn init_creates_expected_layout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_quill(temp.path(), &InitOptions { force: false }).expect("init");

        assert!(paths.state_dir.is_dir());
        assert!(paths.workflows_dir.is_dir());
        assert!(paths.tasks_dir.is_dir());
        assert!(paths.workspaces_dir.is_dir());
        assert!(paths.config_path.is_file());

        let workflow: Workflow = toml::from_str(
            &fs::read_to_string(paths.workflow_path("example")).expect("read workflow"),
        )
        .expect("parse workflow");
        assert_eq!(workflow.steps.len(), 3);
        assert_eq!(workflow.steps[1].document_name(), "outline");
    }

    #[test]
    fn init_without_force_refuses_existing_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        init_quill(temp.path(), &InitOptions { force: false }).expect("init");
        let err = init_quill(temp.path(), &InitOptions { force: false }).unwrap_err();
        assert!(err.to_string().contains("already exists"));
        init_quill(temp.path(), &InitOptions { force: true }).expect("forced init");
    }

    #[test]
    fn task_paths_nest_under_tasks_dir() {
        let paths = QuillPaths::new("/p");
        let task = paths.task("abc");
        assert_eq!(task.task_path, PathBuf::from("/p/.quill/tasks/abc/task.json"));
        assert_eq!(
            task.step(2).report_path,
            PathBuf::from("/p/.quill/tasks/abc/steps/2/report.json")
        );
    }
}

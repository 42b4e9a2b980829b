//! Task lifecycle API: create, run, pause, resume, cancel, and inspect tasks.
//!
//! A [`Pipeline`] owns the process-wide credential pool and backend. Tasks run
//! either on the caller's thread ([`Pipeline::run`]) or on their own OS thread
//! ([`Pipeline::spawn`]). Pause and cancel work across processes because they
//! are written to the task directory and read at step boundaries.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::core::lifecycle::{
    Action, ControlRequest, LifecycleError, accepts_pause_request, next_status,
};
use crate::core::operation::FailureRecord;
use crate::core::types::{Task, TaskStatus};
use crate::io::backend::{Backend, CommandBackend};
use crate::io::config::{QuillConfig, load_config};
use crate::io::layout::{QuillPaths, TaskPaths};
use crate::io::ledger::read_recent;
use crate::io::prompt::REQUEST_DOCUMENT;
use crate::io::task_store::{
    clear_control, list_tasks, load_task, read_control, save_task, write_control, write_document,
};
use crate::io::workflow_store::load_workflow;
use crate::orchestrator::Orchestrator;
use crate::pool::PoolManager;

const RECENT_FAILURES: usize = 5;
const REQUEST_FILE: &str = "request.md";

/// Result of a pause or cancel call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOutcome {
    /// Recorded; the running task honors it at its next step boundary.
    Requested,
    /// Applied immediately because the task was not running.
    Applied(TaskStatus),
}

/// What `status` reports about one task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskStatusReport {
    pub id: String,
    pub workflow: String,
    pub status: TaskStatus,
    pub current_step: usize,
    pub total_steps: usize,
    pub current_role: Option<String>,
    /// Document names in the order their steps produced them.
    pub documents: Vec<String>,
    pub pending_request: Option<ControlRequest>,
    pub recent_failures: Vec<FailureRecord>,
    pub last_error: Option<String>,
    pub working_dir: PathBuf,
    pub updated_at: DateTime<Utc>,
}

pub struct Pipeline<B: Backend + 'static> {
    paths: QuillPaths,
    config: QuillConfig,
    backend: Arc<B>,
    pool: Arc<PoolManager>,
    running: Arc<Mutex<HashSet<String>>>,
}

impl<B: Backend + 'static> Clone for Pipeline<B> {
    fn clone(&self) -> Self {
        Self {
            paths: self.paths.clone(),
            config: self.config.clone(),
            backend: Arc::clone(&self.backend),
            pool: Arc::clone(&self.pool),
            running: Arc::clone(&self.running),
        }
    }
}

impl Pipeline<CommandBackend> {
    /// Open the pipeline rooted at `root` using the configured engine commands.
    pub fn open(root: &Path) -> Result<Self> {
        let paths = QuillPaths::new(root);
        if !paths.quill_dir.is_dir() {
            return Err(anyhow!(
                "{} is not initialized (run `quill init` first)",
                root.display()
            ));
        }
        let config = load_config(&paths.config_path)?;
        let backend = CommandBackend::from_config(&config);
        Self::with_backend(root, config, backend)
    }
}

impl<B: Backend + 'static> Pipeline<B> {
    pub fn with_backend(root: &Path, config: QuillConfig, backend: B) -> Result<Self> {
        config.validate()?;
        let paths = QuillPaths::new(root);
        let pool = PoolManager::open(&paths)?;
        Ok(Self {
            paths,
            config,
            backend: Arc::new(backend),
            pool: Arc::new(pool),
            running: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    pub fn paths(&self) -> &QuillPaths {
        &self.paths
    }

    pub fn config(&self) -> &QuillConfig {
        &self.config
    }

    pub fn pool(&self) -> &PoolManager {
        &self.pool
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Snapshot `workflow_id` into a new queued task. Returns the task id.
    pub fn create(&self, workflow_id: &str, request: &str) -> Result<String> {
        self.create_with_workdir(workflow_id, request, None)
    }

    /// Like [`Pipeline::create`], but runs in an existing (possibly pre-seeded) directory.
    pub fn create_with_workdir(
        &self,
        workflow_id: &str,
        request: &str,
        working_dir: Option<PathBuf>,
    ) -> Result<String> {
        create_task(&self.paths, workflow_id, request, working_dir).map(|task| task.id)
    }

    /// Run the task on the calling thread until it stops.
    pub fn run(&self, task_id: &str) -> Result<Task> {
        let _guard = self.register(task_id)?;
        self.orchestrator().run_task(task_id)
    }

    /// Run the task on its own thread.
    ///
    /// The task is registered before the thread starts, so a second `spawn`
    /// or `run` of the same id fails immediately.
    pub fn spawn(&self, task_id: &str) -> Result<JoinHandle<Result<Task>>> {
        let guard = self.register(task_id)?;
        let pipeline = self.clone();
        let id = task_id.to_string();
        thread::Builder::new()
            .name(format!("quill-task-{}", short_id(task_id)))
            .spawn(move || {
                let _guard = guard;
                pipeline.orchestrator().run_task(&id)
            })
            .with_context(|| format!("spawn thread for task {task_id}"))
    }

    /// Ask the task to pause at its next step boundary.
    ///
    /// A task registered in this process gets a request even while its
    /// checkpoint still says `Queued`, since its runner may already be starting.
    pub fn pause(&self, task_id: &str) -> Result<ControlOutcome> {
        let task_paths = self.task_paths(task_id)?;
        let running = self.running.lock();
        let task = load_task(&task_paths)?;
        let registered = running.contains(task_id) && accepts_run_request(task.status);
        if !registered {
            if !accepts_pause_request(task.status) {
                return Err(LifecycleError {
                    action: Action::Pause,
                    from: task.status,
                }
                .into());
            }
            if task.status == TaskStatus::Paused {
                return Ok(ControlOutcome::Applied(TaskStatus::Paused));
            }
        }
        write_control(&task_paths, ControlRequest::Pause)?;
        info!(task = %task_id, "pause requested");
        Ok(ControlOutcome::Requested)
    }

    /// Continue a paused, failed or interrupted task from its checkpoint. Blocks.
    pub fn resume(&self, task_id: &str) -> Result<Task> {
        let task = load_task(&self.task_paths(task_id)?)?;
        next_status(task.status, Action::Resume)?;
        self.run(task_id)
    }

    /// Cancel the task. Running tasks stop at their next step boundary.
    ///
    /// The checkpoint is only rewritten directly when no runner in this
    /// process holds the task; otherwise the request goes through the control
    /// file so the runner cannot overwrite it.
    pub fn cancel(&self, task_id: &str) -> Result<ControlOutcome> {
        let task_paths = self.task_paths(task_id)?;
        let running = self.running.lock();
        let mut task = load_task(&task_paths)?;
        let next = next_status(task.status, Action::Cancel)?;
        let registered = running.contains(task_id) && accepts_run_request(task.status);
        if registered || task.status == TaskStatus::Running {
            write_control(&task_paths, ControlRequest::Cancel)?;
            info!(task = %task_id, "cancel requested");
            return Ok(ControlOutcome::Requested);
        }
        task.status = next;
        task.updated_at = Utc::now();
        save_task(&task_paths, &task)?;
        clear_control(&task_paths)?;
        info!(task = %task_id, "task cancelled");
        Ok(ControlOutcome::Applied(next))
    }

    pub fn status(&self, task_id: &str) -> Result<TaskStatusReport> {
        let task_paths = self.task_paths(task_id)?;
        let task = load_task(&task_paths)?;
        report(&self.paths, task)
    }

    /// Every task, oldest first.
    pub fn list(&self) -> Result<Vec<TaskStatusReport>> {
        list_tasks(&self.paths)?
            .into_iter()
            .map(|task| report(&self.paths, task))
            .collect()
    }

    /// Claim `task_id` for a runner in this process.
    ///
    /// Runs under the registry lock, so no pause or cancel can slip between
    /// dropping a stale pause request and the task becoming visible as running.
    fn register(&self, task_id: &str) -> Result<RunGuard> {
        let task_paths = self.task_paths(task_id)?;
        let mut running = self.running.lock();
        if running.contains(task_id) {
            return Err(anyhow!("task {task_id} is already running in this process"));
        }
        if read_control(&task_paths)? == Some(ControlRequest::Pause) {
            debug!(task = %task_id, "dropping pause request left from an earlier run");
            clear_control(&task_paths)?;
        }
        running.insert(task_id.to_string());
        Ok(RunGuard {
            running: Arc::clone(&self.running),
            task_id: task_id.to_string(),
        })
    }

    fn orchestrator(&self) -> Orchestrator<'_, B> {
        Orchestrator::new(&self.paths, &self.config, self.backend.as_ref(), &self.pool)
    }

    fn task_paths(&self, task_id: &str) -> Result<TaskPaths> {
        validate_task_id(task_id)?;
        Ok(self.paths.task(task_id))
    }
}

/// Snapshot a workflow into a new `Queued` task and persist it.
pub fn create_task(
    paths: &QuillPaths,
    workflow_id: &str,
    request: &str,
    working_dir: Option<PathBuf>,
) -> Result<Task> {
    let workflow = load_workflow(paths, workflow_id)?;
    let id = Uuid::new_v4().to_string();
    let task_paths = paths.task(&id);
    let working_dir = match working_dir {
        Some(dir) => paths.root.join(dir),
        None => paths.default_workspace(&id),
    };
    fs::create_dir_all(&working_dir)
        .with_context(|| format!("create working dir {}", working_dir.display()))?;

    let mut documents = BTreeMap::new();
    let request_doc = write_document(&task_paths, Path::new(REQUEST_FILE), request, None)?;
    documents.insert(REQUEST_DOCUMENT.to_string(), request_doc);

    let now = Utc::now();
    let task = Task {
        id,
        workflow,
        current_step_index: 0,
        status: TaskStatus::Queued,
        working_dir,
        documents,
        steps: Vec::new(),
        last_error: None,
        created_at: now,
        updated_at: now,
    };
    save_task(&task_paths, &task)?;
    info!(task = %task.id, workflow = %task.workflow.id, steps = task.total_steps(), "task created");
    Ok(task)
}

fn report(paths: &QuillPaths, task: Task) -> Result<TaskStatusReport> {
    let task_paths = paths.task(&task.id);
    let recent_failures = read_recent(&task_paths.failures_path, RECENT_FAILURES)?;
    let pending_request = read_control(&task_paths)?;
    Ok(TaskStatusReport {
        current_role: task
            .workflow
            .steps
            .get(task.current_step_index)
            .map(|step| step.role.clone()),
        documents: task
            .documents_in_step_order()
            .into_iter()
            .map(|(name, _)| name.to_string())
            .collect(),
        total_steps: task.total_steps(),
        current_step: task.current_step_index,
        workflow: task.workflow.id,
        id: task.id,
        status: task.status,
        pending_request,
        recent_failures,
        last_error: task.last_error,
        working_dir: task.working_dir,
        updated_at: task.updated_at,
    })
}

fn validate_task_id(task_id: &str) -> Result<()> {
    if task_id.is_empty() || task_id.contains(['/', '\\']) || task_id.starts_with('.') {
        return Err(anyhow!("invalid task id '{task_id}'"));
    }
    Ok(())
}

fn short_id(task_id: &str) -> &str {
    task_id.get(..8).unwrap_or(task_id)
}

/// Whether a runner could still pick up a task stored as `status`.
fn accepts_run_request(status: TaskStatus) -> bool {
    !matches!(status, TaskStatus::Completed | TaskStatus::Cancelled)
}

/// Membership in the in-process running set, released on drop.
#[derive(Debug)]
struct RunGuard {
    running: Arc<Mutex<HashSet<String>>>,
    task_id: String,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.running.lock().remove(&self.task_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::backend::BackendReply;
    use crate::test_support::{ScriptedBackend, TestWorkspace, write_op};

    #[test]
    fn create_snapshots_workflow_and_request() {
        let ws = TestWorkspace::new().expect("workspace");
        ws.write_workflow("duo", &["analyst", "writer"]).expect("workflow");
        let pipeline = ws.pipeline(ScriptedBackend::default()).expect("pipeline");
        let id = pipeline.create("duo", "Write about tides").expect("create");

        let status = pipeline.status(&id).expect("status");
        assert_eq!(status.status, TaskStatus::Queued);
        assert_eq!(status.total_steps, 2);
        assert_eq!(status.current_role.as_deref(), Some("analyst"));
        assert_eq!(status.documents, vec!["request"]);
        assert!(status.working_dir.ends_with(Path::new("workspaces").join(&id)));
        assert_eq!(
            fs::read_to_string(pipeline.paths().task(&id).request_path).expect("request"),
            "Write about tides"
        );
    }

    #[test]
    fn unknown_workflow_is_rejected() {
        let ws = TestWorkspace::new().expect("workspace");
        let pipeline = ws.pipeline(ScriptedBackend::default()).expect("pipeline");
        let err = pipeline.create("missing", "x").unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn queued_tasks_cannot_be_paused_but_can_be_cancelled() {
        let ws = TestWorkspace::new().expect("workspace");
        ws.write_workflow("solo", &["writer"]).expect("workflow");
        let pipeline = ws.pipeline(ScriptedBackend::default()).expect("pipeline");
        let id = pipeline.create("solo", "x").expect("create");

        let err = pipeline.pause(&id).unwrap_err();
        assert!(err.to_string().contains("cannot pause a task that is queued"));
        assert_eq!(
            pipeline.cancel(&id).expect("cancel"),
            ControlOutcome::Applied(TaskStatus::Cancelled)
        );
        assert!(pipeline.resume(&id).is_err());
    }

    #[test]
    fn same_task_cannot_run_twice_in_process() {
        let ws = TestWorkspace::new().expect("workspace");
        ws.write_workflow("solo", &["writer"]).expect("workflow");
        let pipeline = ws.pipeline(ScriptedBackend::default()).expect("pipeline");
        let guard = pipeline.register("abc").expect("first");
        assert!(pipeline.register("abc").is_err());
        drop(guard);
        assert!(pipeline.register("abc").is_ok());
    }

    #[test]
    fn spawn_runs_task_to_completion() {
        let ws = TestWorkspace::new().expect("workspace");
        ws.add_credentials(&["key-aaaa-0000-1111"]).expect("pool");
        ws.write_workflow("solo", &["writer"]).expect("workflow");
        let pipeline = ws
            .pipeline(ScriptedBackend::new([BackendReply::ok(write_op("a.md", "A"))]))
            .expect("pipeline");
        let id = pipeline.create("solo", "x").expect("create");

        let task = pipeline
            .spawn(&id)
            .expect("spawn")
            .join()
            .expect("join")
            .expect("run");
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(pipeline.running.lock().is_empty());
    }

    #[test]
    fn path_like_task_ids_are_rejected() {
        let ws = TestWorkspace::new().expect("workspace");
        let pipeline = ws.pipeline(ScriptedBackend::default()).expect("pipeline");
        assert!(pipeline.status("../etc").is_err());
    }
}

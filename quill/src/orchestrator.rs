//! Step orchestration: drive a task through its workflow one step at a time.
//!
//! Every step boundary is a checkpoint. The task file is rewritten after each
//! step so a crashed, paused or failed task re-enters exactly at
//! `current_step_index`, with prompts rebuilt from persisted documents only.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

use crate::core::lifecycle::{Action, ControlRequest, next_status};
use crate::core::settings::resolve_settings;
use crate::core::types::{Document, StepOutcome, StepRecord, Task, TaskStatus};
use crate::io::atomic::{write_atomic, write_json_atomic};
use crate::io::backend::{Backend, BackendRequest};
use crate::io::config::QuillConfig;
use crate::io::layout::{QuillPaths, TaskPaths};
use crate::io::ledger::append_records;
use crate::io::mutation::MutationEngine;
use crate::io::prompt::{PromptBuilder, PromptInputs};
use crate::io::task_store::{clear_control, load_task, read_control, save_task, write_document};
use crate::pool::PoolManager;
use crate::session::SessionClient;

/// Everything a task run needs, borrowed from the pipeline.
pub struct Orchestrator<'a, B: Backend + ?Sized> {
    paths: &'a QuillPaths,
    config: &'a QuillConfig,
    backend: &'a B,
    pool: &'a PoolManager,
}

struct StepResult {
    record: StepRecord,
    /// Set only when the step completed.
    document: Option<Document>,
}

impl<'a, B: Backend + ?Sized> Orchestrator<'a, B> {
    pub fn new(
        paths: &'a QuillPaths,
        config: &'a QuillConfig,
        backend: &'a B,
        pool: &'a PoolManager,
    ) -> Self {
        Self {
            paths,
            config,
            backend,
            pool,
        }
    }

    /// Run (or resume) `task_id` until it completes, fails, or honors a control request.
    ///
    /// Returns the task as last checkpointed. I/O failures are recorded on the
    /// task as `Failed` before being returned as errors.
    #[instrument(skip_all, fields(task = %task_id))]
    pub fn run_task(&self, task_id: &str) -> Result<Task> {
        let task_paths = self.paths.task(task_id);
        let mut task = load_task(&task_paths)?;

        let action = if task.status == TaskStatus::Queued {
            Action::Start
        } else {
            Action::Resume
        };
        task.status = next_status(task.status, action)?;
        fs::create_dir_all(&task.working_dir)
            .with_context(|| format!("create working dir {}", task.working_dir.display()))?;
        task.last_error = None;
        touch_and_save(&task_paths, &mut task)?;
        info!(step = task.current_step_index, total = task.total_steps(), ?action, "task running");

        let mut client = SessionClient::new(self.backend, self.pool, self.config.retry.clone());
        let engine = MutationEngine::new(self.config.resolve.clone());

        while task.current_step_index < task.total_steps() {
            if let Some(request) = read_control(&task_paths)? {
                let action = match request {
                    ControlRequest::Pause => Action::Pause,
                    ControlRequest::Cancel => Action::Cancel,
                };
                task.status = next_status(task.status, action)?;
                clear_control(&task_paths)?;
                touch_and_save(&task_paths, &mut task)?;
                info!(step = task.current_step_index, status = %task.status, "control request honored");
                return Ok(task);
            }

            let index = task.current_step_index;
            let result = match self.run_step(&task, &task_paths, index, &mut client, &engine) {
                Ok(result) => result,
                Err(err) => {
                    task.status = next_status(task.status, Action::Fail)?;
                    task.last_error = Some(format!("{err:#}"));
                    touch_and_save(&task_paths, &mut task)?;
                    return Err(err);
                }
            };

            let failed = result.record.outcome == StepOutcome::Failed;
            task.last_error.clone_from(&result.record.error);
            task.steps.push(result.record);
            if let Some(document) = result.document {
                let name = task.workflow.steps[index].document_name().to_string();
                task.documents.insert(name, document);
            }
            if failed {
                task.status = next_status(task.status, Action::Fail)?;
                touch_and_save(&task_paths, &mut task)?;
                warn!(step = index, error = task.last_error.as_deref().unwrap_or(""), "task failed");
                return Ok(task);
            }
            task.current_step_index += 1;
            touch_and_save(&task_paths, &mut task)?;
        }

        task.status = next_status(task.status, Action::Complete)?;
        touch_and_save(&task_paths, &mut task)?;
        // A request that arrived during the last step has no boundary left.
        clear_control(&task_paths)?;
        info!(steps = task.total_steps(), "task completed");
        Ok(task)
    }

    #[instrument(skip_all, fields(step = index))]
    fn run_step(
        &self,
        task: &Task,
        task_paths: &TaskPaths,
        index: usize,
        client: &mut SessionClient<'_, B>,
        engine: &MutationEngine,
    ) -> Result<StepResult> {
        let started_at = Utc::now();
        let step = task
            .workflow
            .steps
            .get(index)
            .ok_or_else(|| anyhow!("task {} has no step {index}", task.id))?;
        let settings = resolve_settings(step, &task.workflow.defaults, &self.config.defaults);
        info!(role = %step.role, model = %settings.model, engine = %settings.engine, "step started");

        let step_paths = task_paths.step(index);
        fs::create_dir_all(&step_paths.dir)
            .with_context(|| format!("create step dir {}", step_paths.dir.display()))?;
        let inputs = PromptInputs::for_step(task, task_paths, index, self.config)?;
        let prompt = PromptBuilder::new(self.config.prompt_budget_bytes).build(&inputs)?;
        write_atomic(&step_paths.prompt_path, prompt.as_bytes())?;

        let request = BackendRequest {
            workdir: task.working_dir.clone(),
            prompt,
            settings,
            timeout: Duration::from_secs(self.config.backend_timeout_secs),
            output_limit_bytes: self.config.backend_output_limit_bytes,
            log_path: Some(step_paths.backend_log_path.clone()),
        };
        let reply = match client.send(&request) {
            Ok(reply) => reply,
            Err(err) => {
                warn!(kind = err.kind(), err = %err, "backend session failed");
                let mut record = new_record(index, &step.role, started_at);
                record.error = Some(format!("{}: {err}", err.kind()));
                return Ok(StepResult {
                    record,
                    document: None,
                });
            }
        };

        // The raw output is kept even when it cannot be applied.
        let relative = Path::new("steps").join(index.to_string()).join("output.md");
        let document = write_document(task_paths, &relative, &reply.output, Some(index))?;

        let mut record = new_record(index, &step.role, started_at);
        record.credential = Some(reply.credential.clone());
        match engine.apply(&task.working_dir, &reply.output) {
            Ok(report) => {
                write_json_atomic(&step_paths.report_path, &report)?;
                append_records(&task_paths.failures_path, &report.failed)?;
                record.outcome = StepOutcome::Completed;
                record.succeeded = report.succeeded.len();
                record.failed = report.failed.len();
                record.finished_at = Utc::now();
                info!(
                    succeeded = record.succeeded,
                    failed = record.failed,
                    attempts = reply.attempts,
                    "step completed"
                );
                Ok(StepResult {
                    record,
                    document: Some(document),
                })
            }
            Err(err) => {
                warn!(err = %err, "backend output was not applied");
                record.error = Some(err.to_string());
                Ok(StepResult {
                    record,
                    document: None,
                })
            }
        }
    }
}

/// A failed record; callers upgrade it on success.
fn new_record(index: usize, role: &str, started_at: DateTime<Utc>) -> StepRecord {
    StepRecord {
        index,
        role: role.to_string(),
        outcome: StepOutcome::Failed,
        started_at,
        finished_at: Utc::now(),
        credential: None,
        succeeded: 0,
        failed: 0,
        error: None,
    }
}

fn touch_and_save(paths: &TaskPaths, task: &mut Task) -> Result<()> {
    task.updated_at = Utc::now();
    save_task(paths, task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::backend::BackendReply;
    use crate::io::task_store::write_control;
    use crate::test_support::{ScriptedBackend, TestWorkspace, write_op};

    /// Verifies a two-step task completes and records each step's document.
    #[test]
    fn completes_all_steps_in_order() {
        let ws = TestWorkspace::new().expect("workspace");
        ws.add_credentials(&["key-aaaa-0000-1111"]).expect("pool");
        let task = ws.create_task(&["analyst", "writer"], "Write a poem").expect("task");
        let backend = ScriptedBackend::new([
            BackendReply::ok(write_op("brief.md", "short brief")),
            BackendReply::ok(write_op("poem.md", "roses")),
        ]);

        let done = ws.orchestrate(&backend, &task.id).expect("run");
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.current_step_index, 2);
        assert_eq!(done.steps.len(), 2);
        assert!(done.documents.contains_key("analyst"));
        assert!(done.documents.contains_key("writer"));
        assert_eq!(
            fs::read_to_string(done.working_dir.join("poem.md")).expect("poem"),
            "roses"
        );

        let calls = backend.calls();
        assert!(calls[0].prompt.contains("Write a poem"));
        assert!(calls[1].prompt.contains("short brief"), "prior output inlined");
        assert!(ws.paths.task(&task.id).step(1).prompt_path.is_file());
    }

    /// Verifies unparseable output fails the task at the same step.
    #[test]
    fn unparseable_output_fails_at_step() {
        let ws = TestWorkspace::new().expect("workspace");
        ws.add_credentials(&["key-aaaa-0000-1111"]).expect("pool");
        let task = ws.create_task(&["analyst"], "req").expect("task");
        let backend = ScriptedBackend::new([BackendReply::ok("I could not produce JSON, sorry.")]);

        let failed = ws.orchestrate(&backend, &task.id).expect("run");
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.current_step_index, 0);
        assert_eq!(failed.steps[0].outcome, StepOutcome::Failed);
        assert!(failed.last_error.as_deref().unwrap_or("").contains("no recognizable"));
        assert!(ws.paths.task(&task.id).step(0).output_path.is_file());
    }

    /// Verifies a pending cancel is honored before the first step runs.
    #[test]
    fn pending_cancel_stops_before_any_step() {
        let ws = TestWorkspace::new().expect("workspace");
        ws.add_credentials(&["key-aaaa-0000-1111"]).expect("pool");
        let task = ws.create_task(&["analyst"], "req").expect("task");
        write_control(&ws.paths.task(&task.id), ControlRequest::Cancel).expect("control");
        let backend = ScriptedBackend::default();

        let cancelled = ws.orchestrate(&backend, &task.id).expect("run");
        assert_eq!(cancelled.status, TaskStatus::Cancelled);
        assert!(backend.calls().is_empty());
        assert_eq!(read_control(&ws.paths.task(&task.id)).expect("read"), None);
    }

    #[test]
    fn request_during_last_step_is_cleared_on_completion() {
        let ws = TestWorkspace::new().expect("workspace");
        ws.add_credentials(&["key-aaaa-0000-1111"]).expect("pool");
        let task = ws.create_task(&["analyst"], "req").expect("task");
        let backend = ScriptedBackend::new([BackendReply::ok(write_op("a.md", "a"))]);
        let task_paths = ws.paths.task(&task.id);
        let hook_paths = task_paths.clone();
        backend.on_call(move |_| {
            write_control(&hook_paths, ControlRequest::Cancel).expect("control");
        });

        let done = ws.orchestrate(&backend, &task.id).expect("run");
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(read_control(&task_paths).expect("read"), None);
    }

    /// Verifies completed tasks are never run again.
    #[test]
    fn completed_task_rejects_rerun() {
        let ws = TestWorkspace::new().expect("workspace");
        ws.add_credentials(&["key-aaaa-0000-1111"]).expect("pool");
        let task = ws.create_task(&["analyst"], "req").expect("task");
        let backend = ScriptedBackend::new([BackendReply::ok(write_op("a.md", "a"))]);
        ws.orchestrate(&backend, &task.id).expect("run");

        let err = ws.orchestrate(&backend, &task.id).unwrap_err();
        assert!(err.to_string().contains("cannot resume a task that is completed"));
    }
}

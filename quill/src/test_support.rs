//! Test-only helpers: a scripted backend and a throwaway quill workspace.

use std::collections::{HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;
use serde_json::json;
use tempfile::TempDir;
use uuid::Uuid;

use crate::core::backoff::RetryPolicy;
use crate::core::settings::StepSettings;
use crate::core::types::Task;
use crate::io::backend::{
    Backend, BackendError, BackendReply, BackendRequest, Session, append_backend_log,
};
use crate::io::config::{QuillConfig, write_config};
use crate::io::layout::{InitOptions, QuillPaths, init_quill};
use crate::orchestrator::Orchestrator;
use crate::pipeline::{Pipeline, create_task};
use crate::pool::PoolManager;

/// Reply the scripted backend gives for a credential marked with [`ScriptedBackend::exhaust`].
pub const QUOTA_REPLY: &str = "429 RESOURCE_EXHAUSTED: quota exceeded for this key";

/// One observed backend call.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub session: Uuid,
    /// Masked credential id.
    pub credential: String,
    pub prompt: String,
    pub settings: StepSettings,
    pub workdir: PathBuf,
}

type Hook = Arc<dyn Fn(usize) + Send + Sync>;

/// Backend that answers from a queue instead of spawning a process.
///
/// Calls made with an exhausted secret get [`QUOTA_REPLY`] without consuming
/// the queue. An empty queue is reported as a spawn failure.
#[derive(Default)]
pub struct ScriptedBackend {
    replies: Mutex<VecDeque<BackendReply>>,
    exhausted: Mutex<HashSet<String>>,
    calls: Mutex<Vec<RecordedCall>>,
    hook: Mutex<Option<Hook>>,
}

impl ScriptedBackend {
    pub fn new(replies: impl IntoIterator<Item = BackendReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn push(&self, reply: BackendReply) {
        self.replies.lock().push_back(reply);
    }

    /// Answer every later call made with `secret` with a quota error.
    pub fn exhaust(&self, secret: &str) {
        self.exhausted.lock().insert(secret.to_string());
    }

    /// Undo [`ScriptedBackend::exhaust`], as if the quota window reset.
    pub fn restore(&self, secret: &str) {
        self.exhausted.lock().remove(secret);
    }

    /// Run `hook(call_index)` at the start of every call, outside all locks.
    pub fn on_call(&self, hook: impl Fn(usize) + Send + Sync + 'static) {
        *self.hook.lock() = Some(Arc::new(hook));
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    pub fn remaining(&self) -> usize {
        self.replies.lock().len()
    }
}

impl Backend for ScriptedBackend {
    fn invoke(
        &self,
        session: &Session,
        request: &BackendRequest,
    ) -> Result<BackendReply, BackendError> {
        let call_index = {
            let mut calls = self.calls.lock();
            calls.push(RecordedCall {
                session: session.id,
                credential: session.credential.masked_id(),
                prompt: request.prompt.clone(),
                settings: request.settings.clone(),
                workdir: request.workdir.clone(),
            });
            calls.len() - 1
        };
        let hook = self.hook.lock().clone();
        if let Some(hook) = hook {
            hook(call_index);
        }

        let reply = if self.exhausted.lock().contains(&session.credential.secret) {
            BackendReply::failed(1, QUOTA_REPLY)
        } else {
            self.replies
                .lock()
                .pop_front()
                .ok_or_else(|| BackendError::Spawn("scripted backend has no replies left".to_string()))?
        };
        if let Some(path) = &request.log_path {
            append_backend_log(path, session, &reply)?;
        }
        Ok(reply)
    }
}

/// Backend output that writes one file.
pub fn write_op(path: &str, content: &str) -> String {
    json!({
        "file_operations": [
            { "filename": path, "operation": "write", "content": content }
        ]
    })
    .to_string()
}

/// Retry settings that never sleep noticeably.
pub fn fast_config() -> QuillConfig {
    QuillConfig {
        retry: RetryPolicy {
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
            jitter: false,
            ..RetryPolicy::default()
        },
        ..QuillConfig::default()
    }
}

/// An initialized `.quill/` under a temporary directory.
pub struct TestWorkspace {
    _temp: TempDir,
    pub root: PathBuf,
    pub paths: QuillPaths,
    pub config: QuillConfig,
}

impl TestWorkspace {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir()?;
        let root = temp.path().to_path_buf();
        let paths = init_quill(&root, &InitOptions { force: false })?;
        let config = fast_config();
        write_config(&paths.config_path, &config)?;
        Ok(Self {
            _temp: temp,
            root,
            paths,
            config,
        })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Seed the persisted pool, one credential per key, in order.
    pub fn add_credentials(&self, keys: &[&str]) -> Result<()> {
        let pool = PoolManager::open(&self.paths)?;
        for key in keys {
            pool.add(key, None)?;
        }
        Ok(())
    }

    /// Write `.quill/workflows/<id>.toml` with one step per role.
    pub fn write_workflow(&self, id: &str, roles: &[&str]) -> Result<()> {
        let mut body = String::new();
        for role in roles {
            body.push_str(&format!("[[steps]]\nrole = \"{role}\"\n\n"));
        }
        self.write_workflow_toml(id, &body)
    }

    pub fn write_workflow_toml(&self, id: &str, body: &str) -> Result<()> {
        fs::write(self.paths.workflow_path(id), body)?;
        Ok(())
    }

    /// Create a queued task over an ad-hoc workflow of `roles`.
    pub fn create_task(&self, roles: &[&str], request: &str) -> Result<Task> {
        self.write_workflow("adhoc", roles)?;
        create_task(&self.paths, "adhoc", request, None)
    }

    /// Run one task directly through the orchestrator with a fresh pool handle.
    pub fn orchestrate(&self, backend: &ScriptedBackend, task_id: &str) -> Result<Task> {
        let pool = PoolManager::open(&self.paths)?;
        Orchestrator::new(&self.paths, &self.config, backend, &pool).run_task(task_id)
    }

    pub fn pipeline(&self, backend: ScriptedBackend) -> Result<Pipeline<ScriptedBackend>> {
        Pipeline::with_backend(&self.root, self.config.clone(), backend)
    }
}

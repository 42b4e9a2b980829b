//! Backend abstraction for generative-text calls.
//!
//! The [`Backend`] trait decouples the session client from the actual engine
//! process. Tests use scripted backends that return queued replies without
//! spawning anything.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::core::pool::ActiveCredential;
use crate::core::settings::StepSettings;
use crate::io::config::{EngineConfig, QuillConfig};
use crate::io::process::{ProcessError, run_bounded};

/// Conversation state bound to one credential.
///
/// A session is thrown away whenever its credential is rotated out; nothing in
/// it may be needed to rebuild a prompt.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: Uuid,
    pub credential: ActiveCredential,
    pub started_at: DateTime<Utc>,
    pub calls: u32,
}

impl Session {
    pub fn new(credential: ActiveCredential, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            credential,
            started_at: now,
            calls: 0,
        }
    }
}

/// Parameters for one backend call.
#[derive(Debug, Clone)]
pub struct BackendRequest {
    pub workdir: PathBuf,
    pub prompt: String,
    pub settings: StepSettings,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
    /// Attempt transcripts are appended here when set.
    pub log_path: Option<PathBuf>,
}

/// What came back from the engine, successful or not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendReply {
    pub exit_code: Option<i32>,
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl BackendReply {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: Some(0),
            success: true,
            stdout: stdout.into(),
            stderr: String::new(),
            timed_out: false,
        }
    }

    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: Some(exit_code),
            success: false,
            stdout: String::new(),
            stderr: stderr.into(),
            timed_out: false,
        }
    }

    pub fn timed_out() -> Self {
        Self {
            exit_code: None,
            success: false,
            stdout: String::new(),
            stderr: String::new(),
            timed_out: true,
        }
    }
}

/// The call could not be made at all. Failed calls are a [`BackendReply`].
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("unknown engine '{0}'")]
    UnknownEngine(String),
    #[error("engine could not be started: {0}")]
    Spawn(String),
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

/// Abstraction over generative-text engines.
pub trait Backend: Send + Sync {
    fn invoke(&self, session: &Session, request: &BackendRequest)
    -> Result<BackendReply, BackendError>;
}

/// Backend that spawns the configured engine command.
#[derive(Debug, Clone)]
pub struct CommandBackend {
    engines: BTreeMap<String, EngineConfig>,
}

impl CommandBackend {
    pub fn new(engines: BTreeMap<String, EngineConfig>) -> Self {
        Self { engines }
    }

    pub fn from_config(config: &QuillConfig) -> Self {
        Self::new(config.engines.clone())
    }

    fn build_command(&self, session: &Session, request: &BackendRequest) -> Result<Command, BackendError> {
        let engine = self
            .engines
            .get(&request.settings.engine)
            .ok_or_else(|| BackendError::UnknownEngine(request.settings.engine.clone()))?;
        let argv = expand_command(&engine.command, &request.settings);
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| BackendError::Spawn("empty engine command".to_string()))?;
        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&request.workdir)
            .env(&engine.credential_env, &session.credential.secret);
        Ok(cmd)
    }
}

impl Backend for CommandBackend {
    #[instrument(skip_all, fields(engine = %request.settings.engine, model = %request.settings.model, session = %session.id))]
    fn invoke(
        &self,
        session: &Session,
        request: &BackendRequest,
    ) -> Result<BackendReply, BackendError> {
        info!(credential = %session.credential.masked_id(), "invoking backend");
        let cmd = self.build_command(session, request)?;
        let output = match run_bounded(
            cmd,
            Some(request.prompt.as_bytes()),
            request.timeout,
            request.output_limit_bytes,
        ) {
            Ok(output) => output,
            Err(ProcessError::Spawn { program, source }) => {
                return Err(BackendError::Spawn(format!("{program}: {source}")));
            }
            Err(ProcessError::Other(err)) => return Err(BackendError::Io(err)),
        };

        let reply = BackendReply {
            exit_code: output.status.code(),
            success: output.success(),
            stdout: output.stdout_text(),
            stderr: output.stderr_text(),
            timed_out: output.timed_out,
        };
        if let Some(path) = &request.log_path {
            append_backend_log(path, session, &reply)?;
        }
        if reply.success {
            debug!(bytes = reply.stdout.len(), "backend call succeeded");
        } else {
            warn!(exit_code = ?reply.exit_code, timed_out = reply.timed_out, "backend call failed");
        }
        Ok(reply)
    }
}

/// Expand `{model}` and `{temperature}` in every argument.
pub fn expand_command(command: &[String], settings: &StepSettings) -> Vec<String> {
    let temperature = settings.temperature.to_string();
    command
        .iter()
        .map(|arg| {
            arg.replace("{model}", &settings.model)
                .replace("{temperature}", &temperature)
        })
        .collect()
}

/// Append one attempt's transcript to the step's backend log.
pub fn append_backend_log(path: &Path, session: &Session, reply: &BackendReply) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create backend log dir {}", parent.display()))?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open backend log {}", path.display()))?;
    let mut buf = format!(
        "=== session {} credential {} call {} ===\n",
        session.id,
        session.credential.masked_id(),
        session.calls + 1
    );
    buf.push_str(&format!(
        "exit_code: {:?} timed_out: {}\n",
        reply.exit_code, reply.timed_out
    ));
    buf.push_str("--- stdout ---\n");
    buf.push_str(&reply.stdout);
    buf.push_str("\n--- stderr ---\n");
    buf.push_str(&reply.stderr);
    buf.push('\n');
    file.write_all(buf.as_bytes())
        .with_context(|| format!("write backend log {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new(
            ActiveCredential {
                index: 0,
                secret: "sk-test-0123456789abcdef".to_string(),
            },
            Utc::now(),
        )
    }

    fn request(dir: &Path, engine: &str) -> BackendRequest {
        BackendRequest {
            workdir: dir.to_path_buf(),
            prompt: "write something".to_string(),
            settings: StepSettings {
                model: "m-1".to_string(),
                temperature: 0.5,
                engine: engine.to_string(),
            },
            timeout: Duration::from_secs(10),
            output_limit_bytes: 10_000,
            log_path: Some(dir.join("backend.log")),
        }
    }

    #[test]
    fn placeholders_are_expanded() {
        let settings = StepSettings {
            model: "gemini-2.5-flash".to_string(),
            temperature: 0.2,
            engine: "gemini".to_string(),
        };
        let argv = expand_command(
            &[
                "gemini".to_string(),
                "--model={model}".to_string(),
                "-t".to_string(),
                "{temperature}".to_string(),
            ],
            &settings,
        );
        assert_eq!(argv, vec!["gemini", "--model=gemini-2.5-flash", "-t", "0.2"]);
    }

    #[test]
    fn unknown_engine_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let backend = CommandBackend::new(BTreeMap::new());
        let err = backend
            .invoke(&session(), &request(temp.path(), "nope"))
            .unwrap_err();
        assert!(matches!(err, BackendError::UnknownEngine(name) if name == "nope"));
    }

    #[cfg(unix)]
    #[test]
    fn command_receives_prompt_and_credential() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut engines = BTreeMap::new();
        engines.insert(
            "sh".to_string(),
            EngineConfig {
                command: vec![
                    "sh".to_string(),
                    "-c".to_string(),
                    "printf '%s|%s|' \"$QUILL_TEST_KEY\" {model}; cat".to_string(),
                ],
                credential_env: "QUILL_TEST_KEY".to_string(),
            },
        );
        let backend = CommandBackend::new(engines);
        let reply = backend
            .invoke(&session(), &request(temp.path(), "sh"))
            .expect("invoke");
        assert!(reply.success);
        assert_eq!(reply.stdout, "sk-test-0123456789abcdef|m-1|write something");

        let log = fs::read_to_string(temp.path().join("backend.log")).expect("log");
        assert!(log.contains("=== session"));
        assert!(log.contains("credential sk-t…cdef call 1"));
    }

    #[cfg(unix)]
    #[test]
    fn missing_program_is_a_spawn_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut engines = BTreeMap::new();
        engines.insert(
            "ghost".to_string(),
            EngineConfig {
                command: vec!["quill-no-such-engine".to_string()],
                credential_env: "KEY".to_string(),
            },
        );
        let err = CommandBackend::new(engines)
            .invoke(&session(), &request(temp.path(), "ghost"))
            .unwrap_err();
        assert!(matches!(err, BackendError::Spawn(_)));
    }
}

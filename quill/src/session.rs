//! Backend session client: one logical request/response with rotation and retries.

use std::thread;

use chrono::Utc;
use rand::Rng;
use tracing::{debug, info, instrument, warn};

use crate::core::backoff::RetryPolicy;
use crate::core::classify::{FailureClass, FailureSignal, classify_failure, failure_summary};
use crate::core::pool::PoolError;
use crate::io::backend::{Backend, BackendError, BackendReply, BackendRequest, Session};
use crate::pool::PoolManager;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("rate limited after {attempts} attempts: {message}")]
    RateLimited { attempts: u32, message: String },
    #[error("backend failed after {attempts} attempts: {message}")]
    Transient { attempts: u32, message: String },
    #[error("backend failure is not retryable: {0}")]
    Fatal(String),
    #[error("session storage: {0:#}")]
    Storage(anyhow::Error),
}

impl SessionError {
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::Pool(PoolError::Empty) => "no_credentials",
            SessionError::Pool(PoolError::AllExhausted(_)) => "all_exhausted",
            SessionError::RateLimited { .. } => "rate_limited",
            SessionError::Transient { .. } => "transient",
            SessionError::Fatal(_) => "fatal",
            SessionError::Storage(_) => "storage",
        }
    }
}

/// A successful exchange.
#[derive(Debug, Clone)]
pub struct SessionReply {
    pub output: String,
    /// Masked id of the credential that produced the output.
    pub credential: String,
    /// Backend calls made, including failed ones.
    pub attempts: u32,
    /// Credentials marked exhausted while serving this request.
    pub rotations: u32,
}

/// Drives one backend through rotation, backoff and retry.
///
/// The client keeps at most one [`Session`], bound to the pool's current
/// credential. The session is rebuilt whenever the pool moves on, so nothing
/// the backend remembers ever outlives its credential.
pub struct SessionClient<'a, B: Backend + ?Sized> {
    backend: &'a B,
    pool: &'a PoolManager,
    policy: RetryPolicy,
    session: Option<Session>,
}

impl<'a, B: Backend + ?Sized> SessionClient<'a, B> {
    pub fn new(backend: &'a B, pool: &'a PoolManager, policy: RetryPolicy) -> Self {
        Self {
            backend,
            pool,
            policy,
            session: None,
        }
    }

    #[instrument(skip_all, fields(engine = %request.settings.engine, model = %request.settings.model))]
    pub fn send(&mut self, request: &BackendRequest) -> Result<SessionReply, SessionError> {
        let mut attempts = 0u32;
        let mut rotations = 0u32;
        let mut rate_limited = 0u32;
        let mut transient = 0u32;

        loop {
            let session = bind_session(&mut self.session, self.pool)?;
            attempts += 1;
            let reply = match self.backend.invoke(session, request) {
                Ok(reply) => reply,
                Err(BackendError::Io(err)) => return Err(SessionError::Storage(err)),
                Err(err) => return Err(SessionError::Fatal(err.to_string())),
            };
            session.calls += 1;
            if reply.success {
                debug!(attempts, rotations, "backend replied");
                return Ok(SessionReply {
                    output: reply.stdout,
                    credential: session.credential.masked_id(),
                    attempts,
                    rotations,
                });
            }

            let signal = signal_of(&reply);
            let summary = failure_summary(&signal);
            match classify_failure(&signal) {
                FailureClass::QuotaExhausted => {
                    let credential = session.credential.clone();
                    warn!(credential = %credential.masked_id(), reason = %summary, "credential quota exhausted");
                    self.session = None;
                    self.pool
                        .mark_exhausted(&credential, &summary)
                        .map_err(SessionError::Storage)?;
                    rotations += 1;
                    let size = self.pool.size();
                    if rotations as usize >= size {
                        // Every credential was tried for this request; surface whatever the pool says.
                        return Err(match self.pool.current() {
                            Ok(_) => SessionError::Pool(PoolError::AllExhausted(size)),
                            Err(err) => SessionError::Pool(err),
                        });
                    }
                }
                FailureClass::RateLimited => {
                    if rate_limited >= self.policy.rate_limit_retries {
                        return Err(SessionError::RateLimited {
                            attempts,
                            message: summary,
                        });
                    }
                    self.back_off(rate_limited, "rate limited");
                    rate_limited += 1;
                }
                FailureClass::Transient => {
                    if transient >= self.policy.transient_retries {
                        return Err(SessionError::Transient {
                            attempts,
                            message: summary,
                        });
                    }
                    self.back_off(transient, "transient failure");
                    transient += 1;
                }
                FailureClass::Fatal => return Err(SessionError::Fatal(summary)),
            }
        }
    }

    fn back_off(&self, attempt: u32, why: &str) {
        let factor = rand::thread_rng().gen_range(0.0..1.0);
        let delay = self.policy.delay_for(attempt, factor);
        warn!(attempt = attempt + 1, delay_ms = delay.as_millis() as u64, why, "retrying backend call");
        thread::sleep(delay);
    }
}

/// The live session, rebuilt if the pool has moved to another credential.
fn bind_session<'s>(
    slot: &'s mut Option<Session>,
    pool: &PoolManager,
) -> Result<&'s mut Session, SessionError> {
    let active = pool.current()?;
    let session = match slot.take() {
        Some(session) if session.credential == active => session,
        _ => {
            info!(credential = %active.masked_id(), "starting backend session");
            Session::new(active, Utc::now())
        }
    };
    Ok(slot.insert(session))
}

fn signal_of(reply: &BackendReply) -> FailureSignal<'_> {
    FailureSignal {
        timed_out: reply.timed_out,
        exit_code: reply.exit_code,
        stdout: &reply.stdout,
        stderr: &reply.stderr,
    }
}

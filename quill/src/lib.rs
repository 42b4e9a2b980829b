//! Multi-step content-generation pipelines over generative-text backends.
//!
//! Each task runs a workflow of steps. A step builds a prompt from persisted
//! documents, calls a backend engine through a rotating credential pool, and
//! applies the reply to the task's working directory as file operations.
//!
//! - **[`core`]**: pure, deterministic logic (lifecycle, pool ring, failure
//!   classification, output extraction). No I/O.
//! - **[`io`]**: filesystem stores, child processes, prompts, mutation.
//!
//! [`pool`], [`session`], [`orchestrator`] and [`pipeline`] combine the two;
//! [`pipeline::Pipeline`] is the task lifecycle API the CLI wraps.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod orchestrator;
pub mod pipeline;
pub mod pool;
pub mod session;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

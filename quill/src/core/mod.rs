//! Deterministic, pure logic shared by the pipeline.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures, take time as an argument, and return deterministic
//! outputs suitable for tests.

pub mod backoff;
pub mod classify;
pub mod extract;
pub mod lifecycle;
pub mod lines;
pub mod operation;
pub mod pool;
pub mod settings;
pub mod types;

//! Side-effecting helpers: filesystem stores, child processes, prompts.

pub mod atomic;
pub mod backend;
pub mod config;
pub mod layout;
pub mod ledger;
pub mod mutation;
pub mod pool_store;
pub mod process;
pub mod prompt;
pub mod resolve;
pub mod task_store;
pub mod workflow_store;

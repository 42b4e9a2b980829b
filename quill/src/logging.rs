//! Development-time tracing for debugging quill.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: Dev diagnostics via `RUST_LOG`, output to stderr.
//!   Not persisted, not part of quill's product output.
//!
//! - **Task artefacts (`io/ledger`, step directories)**: `failures.jsonl`,
//!   `rotations.jsonl` and `.quill/tasks/<id>/steps/`. Always written,
//!   unaffected by `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the stderr subscriber.
///
/// Filter comes from `RUST_LOG`, falling back to `warn`. Lines carry the
/// thread name, so events from spawned `quill-task-*` threads can be told
/// apart.
///
/// # Example
/// ```bash
/// RUST_LOG=quill=debug quill run <task-id>
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_thread_names(true)
                .compact(),
        )
        .init();
}

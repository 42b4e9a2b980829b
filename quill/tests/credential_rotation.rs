//! Credential pool behavior as seen by running tasks.

use std::sync::{Arc, Barrier};

use quill::core::types::TaskStatus;
use quill::io::backend::BackendReply;
use quill::pool::PoolManager;
use quill::test_support::{ScriptedBackend, TestWorkspace, write_op};

const KEY_A: &str = "key-aaaa-0000-1111";
const KEY_B: &str = "key-bbbb-2222-3333";

fn exhaustion_events(pool: &PoolManager) -> usize {
    pool.recent_rotations(100)
        .expect("rotations")
        .iter()
        .filter(|event| event.reason.starts_with("exhausted"))
        .count()
}

/// Two tasks that hit quota on the same credential at once rotate the pool once.
#[test]
fn concurrent_tasks_rotate_once() {
    let ws = TestWorkspace::new().expect("workspace");
    ws.add_credentials(&[KEY_A, KEY_B]).expect("pool");
    ws.write_workflow("solo", &["writer"]).expect("workflow");
    let pipeline = ws
        .pipeline(ScriptedBackend::new([
            BackendReply::ok(write_op("out.md", "x")),
            BackendReply::ok(write_op("out.md", "x")),
        ]))
        .expect("pipeline");
    pipeline.backend().exhaust(KEY_A);

    // Hold both first calls until each task has bound its session to KEY_A.
    let barrier = Arc::new(Barrier::new(2));
    pipeline.backend().on_call(move |n| {
        if n < 2 {
            barrier.wait();
        }
    });

    let first = pipeline.create("solo", "one").expect("create");
    let second = pipeline.create("solo", "two").expect("create");
    let handles = [
        pipeline.spawn(&first).expect("spawn"),
        pipeline.spawn(&second).expect("spawn"),
    ];
    for handle in handles {
        let task = handle.join().expect("join").expect("run");
        assert_eq!(task.status, TaskStatus::Completed);
    }

    assert_eq!(exhaustion_events(pipeline.pool()), 1);
    assert_eq!(pipeline.pool().current().expect("current").secret, KEY_B);
    let calls = pipeline.backend().calls();
    assert_eq!(calls.len(), 4);
    assert!(calls[2..].iter().all(|call| call.credential == "key-…3333"));
}

/// Exhausting every credential fails the task; after a reset it resumes.
#[test]
fn all_exhausted_fails_then_resumes_after_reset() {
    let ws = TestWorkspace::new().expect("workspace");
    ws.add_credentials(&[KEY_A, KEY_B]).expect("pool");
    ws.write_workflow("solo", &["writer"]).expect("workflow");
    let pipeline = ws
        .pipeline(ScriptedBackend::new([BackendReply::ok(write_op("out.md", "x"))]))
        .expect("pipeline");
    pipeline.backend().exhaust(KEY_A);
    pipeline.backend().exhaust(KEY_B);
    let id = pipeline.create("solo", "req").expect("create");

    let failed = pipeline.run(&id).expect("run");
    assert_eq!(failed.status, TaskStatus::Failed);
    assert_eq!(failed.current_step_index, 0);
    assert!(
        failed
            .last_error
            .as_deref()
            .is_some_and(|e| e.starts_with("all_exhausted"))
    );
    assert_eq!(pipeline.pool().snapshot().usable(), 0);
    assert_eq!(exhaustion_events(pipeline.pool()), 2);

    pipeline.backend().restore(KEY_A);
    pipeline.pool().reset_exhausted().expect("reset");
    let done = pipeline.resume(&id).expect("resume");
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.steps.last().and_then(|s| s.credential.as_deref()), Some("key-…1111"));
}

/// Rotation state survives a restart: a new pipeline starts on the rotated credential.
#[test]
fn rotation_persists_across_pipelines() {
    let ws = TestWorkspace::new().expect("workspace");
    ws.add_credentials(&[KEY_A, KEY_B]).expect("pool");
    ws.write_workflow("solo", &["writer"]).expect("workflow");
    let pipeline = ws
        .pipeline(ScriptedBackend::new([BackendReply::ok(write_op("a.md", "a"))]))
        .expect("pipeline");
    pipeline.backend().exhaust(KEY_A);
    let id = pipeline.create("solo", "req").expect("create");
    pipeline.run(&id).expect("run");
    drop(pipeline);

    let restarted = ws
        .pipeline(ScriptedBackend::new([BackendReply::ok(write_op("b.md", "b"))]))
        .expect("pipeline");
    let snapshot = restarted.pool().snapshot();
    assert_eq!(snapshot.current.as_deref(), Some("key-…3333"));
    assert!(snapshot.credentials[0].exhausted);
    assert!(snapshot.credentials[0].exhausted_at.is_some());

    let id = restarted.create("solo", "again").expect("create");
    restarted.run(&id).expect("run");
    let calls = restarted.backend().calls();
    assert_eq!(calls.len(), 1, "no retry on the exhausted credential");
    assert_eq!(calls[0].credential, "key-…3333");
}

/// A rejected credential is fatal: no rotation, task fails.
#[test]
fn auth_errors_do_not_rotate() {
    let ws = TestWorkspace::new().expect("workspace");
    ws.add_credentials(&[KEY_A, KEY_B]).expect("pool");
    ws.write_workflow("solo", &["writer"]).expect("workflow");
    let pipeline = ws
        .pipeline(ScriptedBackend::new([BackendReply::failed(
            1,
            "API key not valid. Please pass a valid API key.",
        )]))
        .expect("pipeline");
    let id = pipeline.create("solo", "req").expect("create");

    let failed = pipeline.run(&id).expect("run");
    assert_eq!(failed.status, TaskStatus::Failed);
    assert!(failed.last_error.as_deref().is_some_and(|e| e.starts_with("fatal")));
    assert_eq!(exhaustion_events(pipeline.pool()), 0);
    assert_eq!(pipeline.pool().current().expect("current").secret, KEY_A);
}

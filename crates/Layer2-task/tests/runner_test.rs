//! Runner lifecycle tests against a scripted backend
//!
//! `cargo test -p taskbox-task --test runner_test`

mod common;

use common::{fast_config, spec_in, write_file, ScriptedBackend};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use taskbox_task::{
    BackendCapabilities, BackendError, BackendStatus, CollectError, ExecutionState, InputMount,
    LaunchError, MonitorError, ResourceLimits, SpecError, TaskContainer, TaskContainerRunner,
    TerminationReason,
};
use tempfile::tempdir;

fn runner(spec: taskbox_task::TaskContainerSpec, backend: &Arc<ScriptedBackend>) -> TaskContainerRunner {
    TaskContainerRunner::new(spec, backend.clone(), fast_config())
}

#[tokio::test]
async fn test_output_missing_although_exit_zero() {
    let dir = tempdir().unwrap();
    let input = write_file(dir.path(), "in.txt", "hello\n");
    let spec = spec_in(dir.path(), "cat /work/in.txt")
        .with_input(InputMount::new(&input, "/work/in.txt"))
        .with_output("/work/out.txt");
    let backend = Arc::new(ScriptedBackend::exits_with(0));
    let mut runner = runner(spec, &backend);

    runner.prepare().unwrap();
    runner.launch().await.unwrap();
    let outcome = runner.monitor().await.unwrap();
    assert_eq!(outcome.exit_code, 0);
    assert_eq!(outcome.termination_reason, TerminationReason::Completed);

    match runner.collect() {
        Err(CollectError::OutputMissing { container_path, .. }) => {
            assert_eq!(container_path, PathBuf::from("/work/out.txt"));
        }
        other => panic!("expected OutputMissing, got {:?}", other),
    }
    // collect is a pure read
    assert!(matches!(
        runner.collect(),
        Err(CollectError::OutputMissing { .. })
    ));

    runner.cleanup().await.unwrap();
    assert_eq!(runner.state().state(), ExecutionState::Cleaned);
}

#[tokio::test]
async fn test_collect_reports_outputs() {
    let dir = tempdir().unwrap();
    let spec = spec_in(dir.path(), "echo done > /mnt/taskbox/work/out.txt")
        .with_output("/mnt/taskbox/work/out.txt");
    let backend = Arc::new(ScriptedBackend::exits_with(0));
    let mut runner = runner(spec, &backend);

    let mapped = runner.prepare().unwrap();
    let out = mapped
        .output_host_path(Path::new("/mnt/taskbox/work/out.txt"))
        .unwrap()
        .to_path_buf();
    assert_eq!(out, dir.path().join("run/work/out.txt"));

    runner.launch().await.unwrap();
    std::fs::write(&out, "done\n").unwrap();
    runner.monitor().await.unwrap();

    let result = runner.collect().unwrap();
    assert!(result.is_success());
    assert_eq!(result.output("/mnt/taskbox/work/out.txt"), Some(&out));
    assert_eq!(result.stdout_path, dir.path().join("run/stdout.txt"));
    assert_eq!(result.stderr_path, dir.path().join("run/stderr.txt"));
}

#[tokio::test]
async fn test_failed_task_skips_output_check() {
    let dir = tempdir().unwrap();
    let spec = spec_in(dir.path(), "exit 2").with_output("/mnt/taskbox/work/out.txt");
    let backend = Arc::new(ScriptedBackend::exits_with(2));
    let mut runner = runner(spec, &backend);

    runner.prepare().unwrap();
    runner.launch().await.unwrap();
    runner.monitor().await.unwrap();

    let result = runner.collect().unwrap();
    assert_eq!(result.exit_code, 2);
    assert!(!result.is_success());
}

#[tokio::test]
async fn test_duplicate_mount_rejected_before_launch() {
    let dir = tempdir().unwrap();
    let a = write_file(dir.path(), "a.txt", "a");
    let b = write_file(dir.path(), "b.txt", "b");
    let spec = spec_in(dir.path(), "true")
        .with_input(InputMount::new(&a, "/work/in.txt"))
        .with_input(InputMount::new(&b, "/work/in.txt"));
    let backend = Arc::new(ScriptedBackend::exits_with(0));
    let mut runner = runner(spec, &backend);

    assert!(matches!(
        runner.prepare(),
        Err(SpecError::DuplicateMount(_))
    ));
    assert_eq!(runner.state().state(), ExecutionState::Failed);
    assert!(matches!(
        runner.launch().await,
        Err(LaunchError::InvalidState(_))
    ));
    assert_eq!(ScriptedBackend::count(&backend.starts), 0);

    runner.cleanup().await.unwrap();
    assert_eq!(runner.state().state(), ExecutionState::Cleaned);
}

#[tokio::test]
async fn test_start_retried_after_transient_failure() {
    let dir = tempdir().unwrap();
    let backend = Arc::new(ScriptedBackend::new().fail_starts(1));
    let mut runner = runner(spec_in(dir.path(), "sleep 1"), &backend);

    runner.prepare().unwrap();
    let state = runner.launch().await.unwrap();

    assert_eq!(state.state(), ExecutionState::Running);
    assert!(state.handle().is_some());
    assert_eq!(ScriptedBackend::count(&backend.starts), 2);
    assert!(backend.streams_existed.load(std::sync::atomic::Ordering::SeqCst));

    runner.cleanup().await.unwrap();
    assert_eq!(ScriptedBackend::count(&backend.removes), 1);
}

#[tokio::test]
async fn test_start_gives_up_after_retries() {
    let dir = tempdir().unwrap();
    let backend = Arc::new(ScriptedBackend::new().fail_starts(10));
    let mut runner = runner(spec_in(dir.path(), "true"), &backend);

    runner.prepare().unwrap();
    let err = runner.launch().await.unwrap_err();

    assert!(matches!(err, LaunchError::BackendUnavailable(_)));
    assert!(err.is_retryable());
    assert_eq!(ScriptedBackend::count(&backend.starts), 4);
    assert_eq!(runner.state().state(), ExecutionState::Failed);
}

#[tokio::test]
async fn test_cancel_then_cleanup() {
    let dir = tempdir().unwrap();
    let backend = Arc::new(ScriptedBackend::new());
    let mut runner = runner(spec_in(dir.path(), "sleep 3600"), &backend);

    runner.prepare().unwrap();
    runner.launch().await.unwrap();

    let token = runner.cancellation_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        token.cancel();
    });

    let result = tokio::time::timeout(Duration::from_secs(10), runner.monitor())
        .await
        .expect("monitor hung after cancellation");
    assert!(matches!(result, Err(MonitorError::Cancelled)));
    assert_eq!(
        runner.state().termination_reason(),
        Some(TerminationReason::Cancelled)
    );
    assert!(ScriptedBackend::count(&backend.terminates) >= 1);

    runner.cleanup().await.unwrap();
    assert_eq!(runner.state().state(), ExecutionState::Cleaned);
}

#[tokio::test]
async fn test_cancel_interrupts_hanging_poll() {
    let dir = tempdir().unwrap();
    let backend = Arc::new(ScriptedBackend::new().hanging_polls());
    let mut runner = runner(spec_in(dir.path(), "sleep 3600"), &backend);

    runner.prepare().unwrap();
    runner.launch().await.unwrap();

    let token = runner.cancellation_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
    });

    let result = tokio::time::timeout(Duration::from_secs(5), runner.monitor())
        .await
        .expect("monitor stayed blocked in a poll after cancellation");
    assert!(matches!(result, Err(MonitorError::Cancelled)));
    assert_eq!(runner.state().state(), ExecutionState::Failed);

    runner.cleanup().await.unwrap();
    assert_eq!(runner.state().state(), ExecutionState::Cleaned);
}

#[tokio::test]
async fn test_timeout_interrupts_hanging_poll() {
    let dir = tempdir().unwrap();
    let backend = Arc::new(ScriptedBackend::new().hanging_polls());
    let spec = spec_in(dir.path(), "sleep 3600").with_timeout(Duration::from_secs(1));
    let mut runner = runner(spec, &backend);

    runner.prepare().unwrap();
    runner.launch().await.unwrap();
    let outcome = tokio::time::timeout(Duration::from_secs(5), runner.monitor())
        .await
        .expect("monitor stayed blocked in a poll past the deadline")
        .unwrap();

    assert_eq!(outcome.termination_reason, TerminationReason::Killed);
    assert_eq!(outcome.exit_code, 137);
}

#[tokio::test]
async fn test_unanswered_polls_count_as_failures() {
    let dir = tempdir().unwrap();
    let backend = Arc::new(ScriptedBackend::new().hanging_polls());
    let config = fast_config().with_poll_timeout(Duration::from_millis(20));
    let mut runner = TaskContainerRunner::new(spec_in(dir.path(), "true"), backend.clone(), config);

    runner.prepare().unwrap();
    runner.launch().await.unwrap();
    let result = tokio::time::timeout(Duration::from_secs(5), runner.monitor())
        .await
        .unwrap();

    assert!(matches!(result, Err(MonitorError::BackendLost(_))));
    // first attempt plus three retries
    assert_eq!(ScriptedBackend::count(&backend.polls), 4);
    assert_eq!(runner.state().state(), ExecutionState::Failed);
}

#[tokio::test]
async fn test_cleanup_is_idempotent() {
    let dir = tempdir().unwrap();
    let backend = Arc::new(ScriptedBackend::exits_with(0));
    let mut runner = runner(spec_in(dir.path(), "true"), &backend);

    let report = runner.run().await.unwrap();
    assert!(report.result.is_success());
    assert!(report.cleanup_error.is_none());

    runner.cleanup().await.unwrap();
    runner.cleanup().await.unwrap();
    assert_eq!(ScriptedBackend::count(&backend.removes), 1);
}

#[tokio::test]
async fn test_out_of_order_calls_leave_state_unchanged() {
    let dir = tempdir().unwrap();
    let backend = Arc::new(ScriptedBackend::exits_with(0));
    let mut runner = runner(spec_in(dir.path(), "true"), &backend);

    assert!(matches!(
        runner.monitor().await,
        Err(MonitorError::InvalidState(_))
    ));
    assert!(matches!(runner.collect(), Err(CollectError::InvalidState(_))));
    assert_eq!(runner.state().state(), ExecutionState::Created);

    runner.prepare().unwrap();
    assert!(matches!(runner.prepare(), Err(SpecError::InvalidState(_))));
    assert_eq!(runner.state().state(), ExecutionState::Prepared);
}

#[tokio::test]
async fn test_transient_poll_errors_are_retried() {
    let dir = tempdir().unwrap();
    let backend = Arc::new(ScriptedBackend::exits_with(0).with_polls(vec![
        Ok(BackendStatus::Running),
        Err(BackendError::Transient("timeout".into())),
        Err(BackendError::Transient("timeout".into())),
    ]));
    let mut runner = runner(spec_in(dir.path(), "true"), &backend);

    runner.prepare().unwrap();
    runner.launch().await.unwrap();
    let outcome = runner.monitor().await.unwrap();

    assert!(outcome.is_success());
    assert_eq!(ScriptedBackend::count(&backend.polls), 4);
}

#[tokio::test]
async fn test_backend_lost_after_exhausted_retries() {
    let dir = tempdir().unwrap();
    let polls = (0..10)
        .map(|_| Err(BackendError::Transient("connection refused".into())))
        .collect();
    let backend = Arc::new(ScriptedBackend::new().with_polls(polls));
    let mut runner = runner(spec_in(dir.path(), "true"), &backend);

    runner.prepare().unwrap();
    runner.launch().await.unwrap();

    assert!(matches!(
        runner.monitor().await,
        Err(MonitorError::BackendLost(_))
    ));
    assert_eq!(runner.state().state(), ExecutionState::Failed);
    runner.cleanup().await.unwrap();
}

#[tokio::test]
async fn test_oom_kill_reported() {
    let dir = tempdir().unwrap();
    let backend = Arc::new(ScriptedBackend::new().settles(BackendStatus::Exited {
        exit_code: 137,
        oom_killed: true,
    }));
    let mut runner = runner(spec_in(dir.path(), "true"), &backend);

    runner.prepare().unwrap();
    runner.launch().await.unwrap();
    let outcome = runner.monitor().await.unwrap();

    assert_eq!(outcome.termination_reason, TerminationReason::Oom);
    assert_eq!(runner.state().exit_code(), Some(137));
}

#[tokio::test]
async fn test_timeout_kills_container() {
    let dir = tempdir().unwrap();
    let spec = spec_in(dir.path(), "sleep 3600").with_timeout(Duration::from_secs(1));
    let backend = Arc::new(ScriptedBackend::new());
    let mut runner = runner(spec, &backend);

    runner.prepare().unwrap();
    runner.launch().await.unwrap();
    let outcome = tokio::time::timeout(Duration::from_secs(10), runner.monitor())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(outcome.termination_reason, TerminationReason::Killed);
    assert_eq!(outcome.exit_code, 137);
    assert_eq!(runner.state().state(), ExecutionState::Exited);
}

#[tokio::test]
async fn test_strict_unsupported_limit_refuses_launch() {
    let dir = tempdir().unwrap();
    let spec = spec_in(dir.path(), "true").with_limits(ResourceLimits {
        disk_bytes: Some(1 << 30),
        strict: true,
        ..Default::default()
    });
    let backend = Arc::new(ScriptedBackend::exits_with(0));
    let mut runner = runner(spec, &backend);

    runner.prepare().unwrap();
    assert!(matches!(
        runner.launch().await,
        Err(LaunchError::UnsupportedLimit(_))
    ));
    assert_eq!(ScriptedBackend::count(&backend.starts), 0);
}

#[tokio::test]
async fn test_advisory_limits_dropped_and_clamped() {
    let dir = tempdir().unwrap();
    let spec = spec_in(dir.path(), "true").with_limits(ResourceLimits {
        cpus: Some(64.0),
        memory_bytes: Some(1 << 30),
        disk_bytes: Some(1 << 30),
        ..Default::default()
    });
    let backend = Arc::new(ScriptedBackend::exits_with(0));
    let mut runner = runner(spec, &backend);

    runner.prepare().unwrap();
    runner.launch().await.unwrap();

    let limits = backend.invocation().limits;
    assert_eq!(limits.cpus, Some(4.0));
    assert_eq!(limits.memory_bytes, Some(1 << 30));
    assert_eq!(limits.disk_bytes, None);
}

#[tokio::test]
async fn test_unshared_filesystem_is_invalid_mount() {
    let dir = tempdir().unwrap();
    let backend = Arc::new(ScriptedBackend::exits_with(0).with_capabilities(
        BackendCapabilities {
            shared_filesystem: false,
            ..BackendCapabilities::none()
        },
    ));
    let mut runner = runner(spec_in(dir.path(), "true"), &backend);

    runner.prepare().unwrap();
    assert!(matches!(
        runner.launch().await,
        Err(LaunchError::InvalidMount(_))
    ));
}

#[tokio::test]
async fn test_run_failure_carries_diagnostics() {
    let dir = tempdir().unwrap();
    let backend = Arc::new(ScriptedBackend::new().failing_removal());
    let mut runner = runner(spec_in(dir.path(), "sleep 3600"), &backend);
    runner.cancel();

    let failure = runner.run().await.unwrap_err();

    assert!(failure.error.is_cancelled());
    assert_eq!(failure.termination_reason, Some(TerminationReason::Cancelled));
    assert_eq!(
        failure.stderr_path,
        Some(dir.path().join("run/stderr.txt"))
    );
    assert!(failure.cleanup_error.is_some());
    assert_eq!(runner.state().state(), ExecutionState::Cleaned);
}

#[tokio::test]
async fn test_cleanup_error_does_not_mask_success() {
    let dir = tempdir().unwrap();
    let backend = Arc::new(ScriptedBackend::exits_with(0).failing_removal());
    let mut runner = runner(spec_in(dir.path(), "true"), &backend);

    let report = runner.run().await.unwrap();
    assert!(report.result.is_success());
    assert!(report.cleanup_error.is_some());
}

#[tokio::test]
async fn test_invocation_shape() {
    let dir = tempdir().unwrap();
    let spec = spec_in(dir.path(), "true")
        .with_env("LANG", "C")
        .with_image("alpine:3.20");
    let backend = Arc::new(ScriptedBackend::exits_with(0));
    let mut runner = runner(spec, &backend);

    runner.prepare().unwrap();
    runner.launch().await.unwrap();

    let invocation = backend.invocation();
    assert_eq!(invocation.name, runner.id());
    assert_eq!(invocation.image, "alpine:3.20");
    assert_eq!(invocation.env.get("LANG").map(String::as_str), Some("C"));
    assert_eq!(
        invocation.labels.get(taskbox_task::TASK_LABEL).map(String::as_str),
        Some(runner.id())
    );
    assert!(invocation.user.is_none());
    assert_eq!(
        std::fs::read_to_string(dir.path().join("run/command")).unwrap(),
        "true"
    );
}

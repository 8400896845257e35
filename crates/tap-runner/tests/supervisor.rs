//! Process supervision against real child processes
//!
//! Run with: cargo test --package selenium-tap-runner --test supervisor

#![cfg(unix)]

use std::os::unix::process::ExitStatusExt;
use std::time::Duration;

use selenium_tap_runner::supervisor::{next_unexpected_exit, ProcessSupervisor};
use selenium_tap_runner::{KillOutcome, ReadinessPattern, RunnerError};

fn sh(script: &str) -> Vec<String> {
    vec!["-c".to_string(), script.to_string()]
}

#[tokio::test]
async fn readiness_line_on_stdout() {
    let mut supervisor = ProcessSupervisor::new();
    let id = supervisor
        .spawn(
            "sh",
            &sh("echo 'Hosting environment: Development'; \
                 echo 'Now listening on: http://localhost:5000'; exec sleep 30"),
        )
        .unwrap();

    let ready = supervisor
        .wait_for_ready(id, &ReadinessPattern::listening())
        .await
        .unwrap();
    assert_eq!(ready.url(), "http://localhost:5000");
    assert_eq!(ready.line, "Now listening on: http://localhost:5000");

    assert_eq!(supervisor.shutdown().await, 1);
}

#[tokio::test]
async fn readiness_line_on_stderr() {
    let mut supervisor = ProcessSupervisor::new();
    let id = supervisor
        .spawn(
            "sh",
            &sh("echo 'Now listening on: http://localhost:5001' >&2; exec sleep 30"),
        )
        .unwrap();

    let ready = supervisor
        .wait_for_ready(id, &ReadinessPattern::listening())
        .await
        .unwrap();
    assert_eq!(ready.url(), "http://localhost:5001");

    supervisor.shutdown().await;
}

#[tokio::test]
async fn readiness_line_split_across_writes() {
    let mut supervisor = ProcessSupervisor::new();
    let id = supervisor
        .spawn(
            "sh",
            &sh("printf 'Now listening'; sleep 0.2; \
                 printf ' on: http://localhost:5002\\r\\n'; exec sleep 30"),
        )
        .unwrap();

    let ready = supervisor
        .wait_for_ready(id, &ReadinessPattern::listening())
        .await
        .unwrap();
    assert_eq!(ready.url(), "http://localhost:5002");

    supervisor.shutdown().await;
}

#[tokio::test]
async fn exit_before_readiness_fails_the_wait() {
    let mut supervisor = ProcessSupervisor::new();
    let id = supervisor
        .spawn("sh", &sh("echo 'Unhandled exception'; exit 3"))
        .unwrap();

    let err = supervisor
        .wait_for_ready(id, &ReadinessPattern::listening())
        .await
        .unwrap_err();
    match err {
        RunnerError::ReadinessTimeout { command, status } => {
            assert_eq!(command, "sh");
            assert_eq!(status.and_then(|s| s.code()), Some(3));
        }
        other => panic!("unexpected error: {}", other),
    }

    // nothing left to stop
    assert_eq!(supervisor.shutdown().await, 0);
}

#[tokio::test]
async fn exit_status_is_reported_even_when_pipes_close_first() {
    for _ in 0..50 {
        let mut supervisor = ProcessSupervisor::new();
        let id = supervisor.spawn("sh", &sh("echo boom; exit 3")).unwrap();

        match supervisor
            .wait_for_ready(id, &ReadinessPattern::listening())
            .await
        {
            Err(RunnerError::ReadinessTimeout { status, .. }) => {
                assert_eq!(status.and_then(|s| s.code()), Some(3));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }
}

#[tokio::test]
async fn unterminated_readiness_text_never_matches() {
    let mut supervisor = ProcessSupervisor::new();
    let id = supervisor
        .spawn("sh", &sh("printf 'Now listening on: http://localhost:5003'"))
        .unwrap();

    let err = supervisor
        .wait_for_ready(id, &ReadinessPattern::listening())
        .await
        .unwrap_err();
    assert!(matches!(err, RunnerError::ReadinessTimeout { .. }));
}

#[tokio::test]
async fn missing_binary_is_a_spawn_error() {
    let mut supervisor = ProcessSupervisor::new();
    let err = supervisor
        .spawn("definitely-not-an-installed-binary", &[])
        .unwrap_err();
    assert!(matches!(err, RunnerError::ProcessSpawn { .. }));
    assert!(supervisor.is_empty());
}

#[tokio::test]
async fn shutdown_runs_once() {
    let mut supervisor = ProcessSupervisor::new();
    let first = supervisor.spawn("sh", &sh("exec sleep 30")).unwrap();
    let second = supervisor.spawn("sh", &sh("exec sleep 30")).unwrap();

    assert_eq!(supervisor.shutdown().await, 2);
    assert!(supervisor.is_shut_down());
    assert!(supervisor.get(first).has_exited());
    assert!(supervisor.get(second).has_exited());

    assert_eq!(supervisor.shutdown().await, 0);
    assert_eq!(supervisor.kill(first), KillOutcome::AlreadyExited);
}

#[tokio::test]
async fn sigterm_is_escalated_to_sigkill() {
    let mut supervisor = ProcessSupervisor::with_grace(Duration::from_millis(300));
    let id = supervisor
        .spawn(
            "sh",
            &sh("trap '' TERM; echo 'Now listening on: http://localhost:5004'; \
                 while true; do sleep 0.1; done"),
        )
        .unwrap();
    supervisor
        .wait_for_ready(id, &ReadinessPattern::listening())
        .await
        .unwrap();

    assert_eq!(supervisor.shutdown().await, 1);

    let exit = supervisor.get(id).exit().unwrap();
    assert!(exit.requested);
    assert_eq!(exit.status.and_then(|s| s.signal()), Some(9));
}

#[tokio::test]
async fn requested_exits_are_not_reported_as_unexpected() {
    let mut supervisor = ProcessSupervisor::new();
    let mut exits = supervisor.subscribe_exits();

    let stopped = supervisor.spawn("sh", &sh("exec sleep 30")).unwrap();
    supervisor.spawn("sh", &sh("sleep 0.3; exit 4")).unwrap();
    assert_eq!(supervisor.kill(stopped), KillOutcome::Signalled);

    let exit = tokio::time::timeout(Duration::from_secs(10), next_unexpected_exit(&mut exits))
        .await
        .unwrap();
    assert!(!exit.requested);
    assert_eq!(exit.status.and_then(|s| s.code()), Some(4));

    let unexpected = supervisor.unexpected_exit().unwrap();
    assert_eq!(unexpected.pid, exit.pid);

    supervisor.shutdown().await;
}

//! One-shot execution against real commands.

use sandboxd::process::proc_table::is_alive;
use sandboxd::process::{execute, ExecuteRequest, Terminator, DEFAULT_TIMEOUT};
use sandboxd::Error;
use std::time::{Duration, Instant};

#[tokio::test]
async fn stdout_and_stderr_share_one_stream() {
    let request = ExecuteRequest::new("sh -c 'echo out; echo err >&2; echo again'");
    let response = execute(request, &Terminator::new(), DEFAULT_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(response.exit_code, 0);
    assert_eq!(response.result, "out\nerr\nagain\n");
}

#[tokio::test]
async fn timeout_kills_the_whole_tree() {
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("bg.pid");
    let command = format!(
        "sh -c 'sleep 30 & echo $! > {}; wait'",
        pid_file.display()
    );
    let request = ExecuteRequest {
        command,
        cwd: None,
        timeout: Some(1),
    };

    let terminator = Terminator::new().with_check_interval(Duration::from_millis(50));
    let started = Instant::now();
    let err = execute(request, &terminator, DEFAULT_TIMEOUT)
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, Error::Timeout(_)), "{:?}", err);
    assert_eq!(err.status_code().as_u16(), 408);
    assert!(elapsed >= Duration::from_secs(1));
    assert!(elapsed < Duration::from_secs(6), "took {:?}", elapsed);

    let background: i32 = std::fs::read_to_string(&pid_file)
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    let deadline = Instant::now() + Duration::from_secs(2);
    while is_alive(background) && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(!is_alive(background), "background sleep {} survived", background);
}

#[tokio::test]
async fn default_timeout_applies_without_request_timeout() {
    let request = ExecuteRequest::new("sleep 5");
    let err = execute(request, &Terminator::new(), Duration::from_millis(300))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));
}

async fn wait_until_dead(pid: i32, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    while is_alive(pid) && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    !is_alive(pid)
}

#[tokio::test]
async fn dropped_request_terminates_the_child() {
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("child.pid");
    let request = ExecuteRequest {
        command: format!("sh -c 'echo $$ > {}; exec sleep 30'", pid_file.display()),
        cwd: None,
        timeout: Some(30),
    };
    let terminator = Terminator::new().with_check_interval(Duration::from_millis(50));

    let abandoned = tokio::time::timeout(
        Duration::from_millis(500),
        execute(request, &terminator, DEFAULT_TIMEOUT),
    )
    .await;
    assert!(abandoned.is_err(), "command finished before the request was dropped");

    let pid: i32 = std::fs::read_to_string(&pid_file)
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    assert!(
        wait_until_dead(pid, Duration::from_secs(5)).await,
        "child {} outlived its request",
        pid
    );
}

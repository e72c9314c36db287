use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::{Duration, Instant};

use remote_worker::worker::{CommandRunner, ProcessRunner, RunSpec, RunnerError, SandboxBinary};

fn spec(dir: &Path, args: &[&str]) -> RunSpec {
    RunSpec {
        arguments: args.iter().map(|s| s.to_string()).collect(),
        environment: BTreeMap::new(),
        working_directory: dir.to_path_buf(),
        timeout: Duration::from_secs(10),
    }
}

#[tokio::test]
async fn test_run_simple_command() {
    let dir = tempfile::tempdir().unwrap();
    let output = ProcessRunner::direct()
        .run(spec(dir.path(), &["echo", "hello"]))
        .await
        .unwrap();

    assert!(output.success());
    assert_eq!(output.stdout, b"hello\n");
    assert!(output.stderr.is_empty());
}

#[tokio::test]
async fn test_run_large_output() {
    let dir = tempfile::tempdir().unwrap();
    let output = ProcessRunner::direct()
        .run(spec(dir.path(), &["seq", "1", "1000"]))
        .await
        .unwrap();

    assert!(output.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout).lines().count(), 1000);
}

#[tokio::test]
async fn test_run_command_failure() {
    let dir = tempfile::tempdir().unwrap();
    let output = ProcessRunner::direct()
        .run(spec(dir.path(), &["sh", "-c", "echo oops >&2; exit 3"]))
        .await
        .unwrap();

    assert!(!output.success());
    assert_eq!(output.exit_code, Some(3));
    assert_eq!(output.stderr, b"oops\n");
}

#[tokio::test]
async fn test_run_killed_by_signal() {
    let dir = tempfile::tempdir().unwrap();
    let output = ProcessRunner::direct()
        .run(spec(dir.path(), &["sh", "-c", "kill -9 $$"]))
        .await
        .unwrap();

    assert!(!output.success());
    assert_eq!(output.exit_code, None);
}

#[tokio::test]
async fn test_run_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let mut s = spec(dir.path(), &["sleep", "30"]);
    s.timeout = Duration::from_millis(200);

    let start = Instant::now();
    let err = ProcessRunner::direct().run(s).await.unwrap_err();

    assert!(matches!(err, RunnerError::Timeout(t) if t == Duration::from_millis(200)));
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_run_in_working_directory() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("input.txt"), "staged").unwrap();

    let output = ProcessRunner::direct()
        .run(spec(dir.path(), &["cat", "input.txt"]))
        .await
        .unwrap();

    assert_eq!(output.stdout, b"staged");
}

#[tokio::test]
async fn test_run_environment_is_cleared() {
    let dir = tempfile::tempdir().unwrap();
    let mut s = spec(dir.path(), &["sh", "-c", "echo \"$HOME|$FOO|$PATH\""]);
    s.environment.insert("FOO".to_string(), "bar".to_string());

    let output = ProcessRunner::direct().run(s).await.unwrap();

    assert_eq!(
        String::from_utf8_lossy(&output.stdout),
        "|bar|/usr/local/bin:/usr/bin:/bin\n"
    );
}

#[tokio::test]
async fn test_run_explicit_path_is_kept() {
    let dir = tempfile::tempdir().unwrap();
    let mut s = spec(dir.path(), &["/bin/sh", "-c", "echo $PATH"]);
    s.environment.insert("PATH".to_string(), "/bin".to_string());

    let output = ProcessRunner::direct().run(s).await.unwrap();

    assert_eq!(output.stdout, b"/bin\n");
}

#[tokio::test]
async fn test_run_missing_program() {
    let dir = tempfile::tempdir().unwrap();
    let err = ProcessRunner::direct()
        .run(spec(dir.path(), &["definitely-not-a-real-program-xyz"]))
        .await
        .unwrap_err();

    assert!(matches!(err, RunnerError::Spawn { .. }));
}

#[tokio::test]
async fn test_run_empty_command() {
    let dir = tempfile::tempdir().unwrap();
    let err = ProcessRunner::direct()
        .run(spec(dir.path(), &[]))
        .await
        .unwrap_err();

    assert!(matches!(err, RunnerError::EmptyCommand));
}

#[tokio::test]
async fn test_run_through_wrapper() {
    let bin_dir = tempfile::tempdir().unwrap();
    let work_dir = tempfile::tempdir().unwrap();

    // Prints the wrapper arguments, then runs the wrapped command.
    let wrapper = bin_dir.path().join("linux-sandbox");
    std::fs::write(&wrapper, "#!/bin/sh\necho \"$1 $2 $3\"\nshift 3\nexec \"$@\"\n").unwrap();
    std::fs::set_permissions(&wrapper, std::fs::Permissions::from_mode(0o755)).unwrap();

    let runner = ProcessRunner::sandboxed(SandboxBinary::new_unchecked(&wrapper));
    assert!(runner.is_sandboxed());

    let output = runner
        .run(spec(work_dir.path(), &["echo", "inside"]))
        .await
        .unwrap();

    assert!(output.success());
    assert_eq!(
        String::from_utf8_lossy(&output.stdout),
        format!("-W {} --\ninside\n", work_dir.path().display())
    );
}

/// True while `pid` exists and is not a zombie.
fn process_alive(pid: &str) -> bool {
    match std::fs::read_to_string(format!("/proc/{}/stat", pid.trim())) {
        // The state field follows the parenthesised command name.
        Ok(stat) => stat
            .rsplit_once(") ")
            .map(|(_, rest)| !rest.starts_with('Z'))
            .unwrap_or(false),
        Err(_) => false,
    }
}

async fn wait_until_gone(pid: &str) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while process_alive(pid) {
        assert!(Instant::now() < deadline, "background process {} survived", pid.trim());
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_background_child_does_not_hold_the_run_open() {
    let dir = tempfile::tempdir().unwrap();

    let start = Instant::now();
    let output = ProcessRunner::direct()
        .run(spec(
            dir.path(),
            &["sh", "-c", "sleep 30 & echo $! > bg.pid; echo done"],
        ))
        .await
        .unwrap();

    assert!(output.success());
    assert_eq!(output.stdout, b"done\n");
    assert!(start.elapsed() < Duration::from_secs(5));

    let pid = std::fs::read_to_string(dir.path().join("bg.pid")).unwrap();
    wait_until_gone(&pid).await;
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_timeout_kills_background_children() {
    let dir = tempfile::tempdir().unwrap();
    let mut s = spec(
        dir.path(),
        &["sh", "-c", "sleep 30 & echo $! > bg.pid; sleep 30"],
    );
    s.timeout = Duration::from_millis(500);

    let err = ProcessRunner::direct().run(s).await.unwrap_err();
    assert!(matches!(err, RunnerError::Timeout(_)));

    let pid = std::fs::read_to_string(dir.path().join("bg.pid")).unwrap();
    wait_until_gone(&pid).await;
}

//! Process supervision: spawn, exit reporting, SIGTERM/SIGKILL escalation, rollback.

use std::path::Path;
use std::process::Command;
use std::time::Duration;

use tempfile::TempDir;

use hookrelay::error::RelayError;
use hookrelay::supervisor::{AgentCommand, DiffOutcome, RollbackOutcome, Supervisor};

const SIGTERM: i32 = 15;
const SIGKILL: i32 = 9;

fn shell(script: &str) -> AgentCommand {
    AgentCommand::new("sh").args(["-c", script])
}

fn supervisor() -> (Supervisor, tokio::sync::mpsc::UnboundedReceiver<hookrelay::supervisor::ProcessExit>) {
    Supervisor::new("/tmp/hookrelay-test.sock".into(), Duration::from_secs(2))
}

#[tokio::test]
async fn exit_is_reported_with_code_and_stderr_tail() {
    let tmp = TempDir::new().unwrap();
    let (sup, mut exits) = supervisor();

    let handle = sup
        .start("s1", &shell("echo first >&2; echo oops >&2; exit 3"), tmp.path())
        .unwrap();

    let exit = tokio::time::timeout(Duration::from_secs(5), exits.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(exit.task_id, "s1");
    assert_eq!(exit.pid, handle.pid());
    assert_eq!(exit.code, Some(3));
    assert!(exit.signal.is_none());
    assert_eq!(exit.stderr_tail, "first\noops");

    let state = handle.exit_state().unwrap();
    assert!(!state.success());
}

#[tokio::test]
async fn child_sees_session_environment() {
    let tmp = TempDir::new().unwrap();
    let (sup, _exits) = supervisor();

    let handle = sup
        .start(
            "s-env",
            &shell(r#"test "$HOOKRELAY_SESSION_ID" = s-env && test "$HOOKRELAY_SOCKET" = /tmp/hookrelay-test.sock"#),
            tmp.path(),
        )
        .unwrap();
    let state = tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .unwrap()
        .unwrap();
    assert!(state.success());
}

#[tokio::test]
async fn child_runs_in_workspace() {
    let tmp = TempDir::new().unwrap();
    let (sup, _exits) = supervisor();

    let handle = sup.start("s1", &shell("touch marker"), tmp.path()).unwrap();
    handle.wait().await;
    assert!(tmp.path().join("marker").exists());
}

#[tokio::test]
async fn terminate_stops_cooperative_child_with_sigterm() {
    let tmp = TempDir::new().unwrap();
    let (sup, _exits) = supervisor();

    let handle = sup.start("s1", &shell("sleep 30"), tmp.path()).unwrap();
    sup.terminate(&handle, Duration::from_secs(2)).await.unwrap();

    let state = handle.exit_state().unwrap();
    assert_eq!(state.signal, Some(SIGTERM));
    assert!(state.code.is_none());
}

#[tokio::test]
async fn terminate_escalates_to_sigkill() {
    let tmp = TempDir::new().unwrap();
    let (sup, _exits) = supervisor();

    let handle = sup
        .start("s1", &shell("trap '' TERM; sleep 30"), tmp.path())
        .unwrap();
    // Let the shell install its trap.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = std::time::Instant::now();
    sup.terminate(&handle, Duration::from_millis(300)).await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert_eq!(handle.exit_state().unwrap().signal, Some(SIGKILL));
}

#[tokio::test]
async fn terminate_is_idempotent() {
    let tmp = TempDir::new().unwrap();
    let (sup, _exits) = supervisor();

    let handle = sup.start("s1", &shell("exit 0"), tmp.path()).unwrap();
    handle.wait().await;

    sup.terminate(&handle, Duration::from_secs(1)).await.unwrap();
    sup.terminate(&handle, Duration::from_secs(1)).await.unwrap();
    assert!(handle.exit_state().unwrap().success());
}

#[tokio::test]
async fn missing_program_is_a_spawn_error() {
    let tmp = TempDir::new().unwrap();
    let (sup, _exits) = supervisor();

    let err = sup
        .start("s1", &AgentCommand::new("/nonexistent/agent-binary"), tmp.path())
        .unwrap_err();
    assert!(matches!(err, RelayError::Spawn { .. }));
}

// ---------------------------------------------------------------------------
// Rollback
// ---------------------------------------------------------------------------

fn git_available() -> bool {
    Command::new("git").arg("--version").output().is_ok()
}

fn git(dir: &Path, args: &[&str]) {
    let status = Command::new("git")
        .args(["-c", "user.name=test", "-c", "user.email=test@example.com"])
        .args(args)
        .current_dir(dir)
        .status()
        .unwrap();
    assert!(status.success(), "git {:?} failed", args);
}

fn repo_with_commit() -> TempDir {
    let tmp = TempDir::new().unwrap();
    git(tmp.path(), &["init", "-q"]);
    std::fs::write(tmp.path().join("tracked.txt"), "original\n").unwrap();
    git(tmp.path(), &["add", "tracked.txt"]);
    git(tmp.path(), &["commit", "-q", "-m", "initial"]);
    tmp
}

#[tokio::test]
async fn rollback_restores_tracked_and_removes_untracked() {
    if !git_available() {
        return;
    }
    let repo = repo_with_commit();
    std::fs::write(repo.path().join("tracked.txt"), "edited by agent\n").unwrap();
    std::fs::create_dir(repo.path().join("generated")).unwrap();
    std::fs::write(repo.path().join("generated").join("out.txt"), "junk").unwrap();

    let (sup, _exits) = supervisor();
    assert_eq!(sup.rollback(repo.path()).await, RollbackOutcome::RolledBack);

    let content = std::fs::read_to_string(repo.path().join("tracked.txt")).unwrap();
    assert_eq!(content, "original\n");
    assert!(!repo.path().join("generated").exists());
}

#[tokio::test]
async fn rollback_of_only_untracked_files() {
    if !git_available() {
        return;
    }
    let repo = repo_with_commit();
    std::fs::write(repo.path().join("new.txt"), "new").unwrap();

    let (sup, _exits) = supervisor();
    assert_eq!(sup.rollback(repo.path()).await, RollbackOutcome::RolledBack);
    assert!(!repo.path().join("new.txt").exists());
    assert!(repo.path().join("tracked.txt").exists());
}

#[tokio::test]
async fn clean_repository_has_nothing_to_roll_back() {
    if !git_available() {
        return;
    }
    let repo = repo_with_commit();
    let (sup, _exits) = supervisor();
    assert_eq!(sup.rollback(repo.path()).await, RollbackOutcome::NothingToRollBack);
}

#[tokio::test]
async fn plain_directory_is_not_a_repository() {
    if !git_available() {
        return;
    }
    let tmp = TempDir::new().unwrap();
    std::fs::write(tmp.path().join("file.txt"), "x").unwrap();

    let (sup, _exits) = supervisor();
    assert_eq!(sup.rollback(tmp.path()).await, RollbackOutcome::NotARepository);
    assert!(tmp.path().join("file.txt").exists());
}

#[tokio::test]
async fn diff_falls_back_to_staged_changes() {
    if !git_available() {
        return;
    }
    let repo = repo_with_commit();
    let (sup, _exits) = supervisor();
    assert_eq!(sup.diff(repo.path(), None).await, DiffOutcome::Clean);

    std::fs::write(repo.path().join("tracked.txt"), "edited by agent\n").unwrap();
    match sup.diff(repo.path(), None).await {
        DiffOutcome::Changes(diff) => assert!(diff.contains("+edited by agent")),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(sup.diff(repo.path(), Some("nomatch")).await, DiffOutcome::Clean);

    git(repo.path(), &["add", "tracked.txt"]);
    match sup.diff(repo.path(), Some("tracked")).await {
        DiffOutcome::Changes(diff) => assert!(diff.contains("-original")),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn diff_outside_a_repository() {
    if !git_available() {
        return;
    }
    let tmp = TempDir::new().unwrap();
    let (sup, _exits) = supervisor();
    assert_eq!(sup.diff(tmp.path(), None).await, DiffOutcome::NotARepository);
}


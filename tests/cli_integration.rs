//! CLI integration tests using assert_cmd to exercise the actual binary.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::{json, Value};
use tempfile::TempDir;

use hookrelay::error::Result;
use hookrelay::ipc::socket_server::IpcServer;
use hookrelay::ipc::kinds;

/// The binary, isolated from the caller's config and socket.
fn relay_bin(home: &Path) -> Command {
    let mut cmd = Command::cargo_bin("hookrelay").unwrap();
    cmd.current_dir(home)
        .env("HOME", home)
        .env("HOOKRELAY_SOCKET", home.join("relay.sock"))
        .env_remove("HOOKRELAY_WORKSPACE")
        .env_remove("HOOKRELAY_SESSION_ID")
        .env_remove("CLAUDE_SESSION_ID")
        .env_remove("HOOKRELAY_LOG")
        .env_remove("RUST_LOG");
    cmd
}

// ---------------------------------------------------------------------------
// Top-level commands
// ---------------------------------------------------------------------------

#[test]
fn help_lists_subcommands() {
    let tmp = TempDir::new().unwrap();
    relay_bin(tmp.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("hook"))
        .stdout(predicate::str::contains("plugins"));
}

#[test]
fn plugins_lists_builtins() {
    let tmp = TempDir::new().unwrap();
    relay_bin(tmp.path())
        .arg("plugins")
        .assert()
        .success()
        .stdout(predicate::str::contains("  - console"))
        .stdout(predicate::str::contains("  - claude_code"))
        .stdout(predicate::str::contains("  - shell"));
}

#[test]
fn config_prints_effective_values() {
    let tmp = TempDir::new().unwrap();
    std::fs::write(
        tmp.path().join("hookrelay.yml"),
        "max_concurrent_tasks: 7\nlauncher:\n  name: shell\n",
    )
    .unwrap();

    relay_bin(tmp.path())
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("max_concurrent_tasks: 7"))
        .stdout(predicate::str::contains("name: shell"))
        .stdout(predicate::str::contains("relay.sock"));
}

#[test]
fn config_with_invalid_file_fails() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("broken.yml");
    std::fs::write(&path, "max_concurrent_tasks: [oops").unwrap();

    relay_bin(tmp.path())
        .arg("--config")
        .arg(&path)
        .arg("config")
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to load configuration"));
}

#[test]
fn serve_rejects_unknown_launcher() {
    let tmp = TempDir::new().unwrap();
    std::fs::write(tmp.path().join("hookrelay.yml"), "launcher:\n  name: codex\n").unwrap();

    relay_bin(tmp.path())
        .arg("serve")
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown launcher plugin 'codex'"));
}

// ---------------------------------------------------------------------------
// Hooks without an orchestrator
// ---------------------------------------------------------------------------

#[test]
fn permission_hook_denies_when_orchestrator_is_down() {
    let tmp = TempDir::new().unwrap();
    let output = relay_bin(tmp.path())
        .args(["hook", "permission"])
        .write_stdin(r#"{"session_id":"s1","tool_name":"Bash","tool_input":{"command":"ls"}}"#)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let verdict: Value = serde_json::from_slice(&output).unwrap();
    assert_eq!(verdict["decision"], "deny");
    assert_eq!(verdict["reason"], "orchestrator not running");
}

#[test]
fn permission_hook_denies_unparseable_input() {
    let tmp = TempDir::new().unwrap();
    relay_bin(tmp.path())
        .args(["hook", "permission"])
        .write_stdin("{not json")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"decision\":\"deny\""))
        .stdout(predicate::str::contains("invalid input"));
}

#[test]
fn progress_hook_is_silent_without_orchestrator() {
    let tmp = TempDir::new().unwrap();
    relay_bin(tmp.path())
        .args(["hook", "progress"])
        .write_stdin(r#"{"session_id":"s1","tool_name":"Bash","tool_output":{"exit_code":0}}"#)
        .assert()
        .success()
        .stdout(predicate::str::is_empty());
}

#[test]
fn stop_hook_tolerates_bad_input() {
    let tmp = TempDir::new().unwrap();
    relay_bin(tmp.path())
        .args(["hook", "stop"])
        .write_stdin("garbage")
        .assert()
        .success()
        .stdout(predicate::str::is_empty());
}

// ---------------------------------------------------------------------------
// Hooks against a live socket
// ---------------------------------------------------------------------------

async fn instant_verdict(payload: Value) -> Result<Option<Value>> {
    let command = payload["command"].as_str().unwrap_or_default().to_string();
    let decision = if command == "ls" { "approve" } else { "deny" };
    Ok(Some(json!({ "decision": decision, "reason": format!("checked {command}") })))
}

#[tokio::test(flavor = "multi_thread")]
async fn permission_hook_prints_orchestrator_verdict() {
    let tmp = TempDir::new().unwrap();
    let server = Arc::new(IpcServer::new(tmp.path().join("relay.sock")));
    server.on(kinds::PERMISSION_REQUEST, instant_verdict);
    let listener = server.listen().unwrap();
    tokio::spawn(server.clone().serve(listener));

    let home = tmp.path().to_path_buf();
    let stdout = tokio::task::spawn_blocking(move || {
        relay_bin(&home)
            .args(["hook", "permission"])
            .write_stdin(r#"{"session_id":"s1","tool_name":"Bash","tool_input":{"command":"ls"}}"#)
            .timeout(Duration::from_secs(20))
            .assert()
            .success()
            .get_output()
            .stdout
            .clone()
    })
    .await
    .unwrap();

    let verdict: Value = serde_json::from_slice(&stdout).unwrap();
    assert_eq!(verdict["decision"], "approve");
    assert_eq!(verdict["reason"], "checked ls");
    server.shutdown();
}

//! End-to-end orchestrator behaviour with a recording chat and the shell launcher.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::mpsc;

use hookrelay::chat::{ChatPlatform, InboundMessage};
use hookrelay::config::{LauncherConfig, RelayConfig};
use hookrelay::decision::{ConfirmationStatus, Decision};
use hookrelay::error::Result;
use hookrelay::ipc::socket_client::IpcClient;
use hookrelay::ipc::{kinds, Envelope, PollStatus};
use hookrelay::task::CancelOutcome;
use hookrelay::orchestrator::Orchestrator;
use hookrelay::plugins::shell::ShellLauncher;
use hookrelay::session::session_id;
use hookrelay::task::TaskStatus;

const CHAT: &str = "chat-1";
const TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Default)]
struct RecordingChat {
    sent: Mutex<Vec<(String, String)>>,
}

impl RecordingChat {
    fn texts(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(_, text)| text.clone())
            .collect()
    }

    async fn wait_for(&self, needle: &str) -> String {
        for _ in 0..150 {
            if let Some(text) = self.texts().into_iter().find(|t| t.contains(needle)) {
                return text;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("no message containing {needle:?}; got {:?}", self.texts());
    }
}

#[async_trait]
impl ChatPlatform for RecordingChat {
    fn name(&self) -> &str {
        "recording"
    }

    async fn send(&self, chat_id: &str, text: &str) -> bool {
        self.sent
            .lock()
            .unwrap()
            .push((chat_id.to_string(), text.to_string()));
        true
    }

    async fn run(&self, _inbound: mpsc::Sender<InboundMessage>) -> Result<()> {
        Ok(())
    }
}

struct Harness {
    _tmp: TempDir,
    config: RelayConfig,
    chat: Arc<RecordingChat>,
    orch: Arc<Orchestrator>,
    seq: std::sync::atomic::AtomicUsize,
}

impl Harness {
    fn start() -> Self {
        let tmp = TempDir::new().unwrap();
        let workspace = tmp.path().join("workspace");
        std::fs::create_dir(&workspace).unwrap();

        let config = RelayConfig {
            socket_path: tmp.path().join("relay.sock"),
            workspace,
            launcher: LauncherConfig {
                name: "shell".into(),
                ..LauncherConfig::default()
            },
            grace_period_secs: 1,
            reap_timeout_secs: 2,
            auto_rollback: false,
            ..RelayConfig::default()
        };

        let chat = Arc::new(RecordingChat::default());
        let orch = Orchestrator::new(config.clone(), chat.clone(), Arc::new(ShellLauncher));
        orch.start().unwrap();

        Self {
            _tmp: tmp,
            config,
            chat,
            orch,
            seq: Default::default(),
        }
    }

    async fn say(&self, text: &str) {
        let n = self.seq.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.orch
            .handle_inbound(InboundMessage {
                chat_id: CHAT.into(),
                text: text.into(),
                message_id: format!("m-{n}"),
            })
            .await;
    }

    async fn wait_status(&self, status: TaskStatus) {
        let task_id = session_id(CHAT);
        for _ in 0..150 {
            if self.orch.registry().get(&task_id).map(|t| t.status) == Some(status) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!(
            "task never reached {status}; now {:?}",
            self.orch.registry().get(&task_id).map(|t| t.status)
        );
    }

    async fn wait_peers(&self, count: usize) {
        for _ in 0..150 {
            if self.orch.server().client_count() == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!(
            "expected {count} peer(s), have {}",
            self.orch.server().client_count()
        );
    }

    fn workspace(&self) -> &std::path::Path {
        &self.config.workspace
    }

    async fn client(&self) -> IpcClient {
        IpcClient::connect(&self.config.socket_path, TIMEOUT).await.unwrap()
    }

    async fn ask(&self, request_id: &str, command: &str) -> Envelope {
        let mut client = self.client().await;
        client
            .request(
                kinds::PERMISSION_REQUEST,
                json!({
                    "session_id": session_id(CHAT),
                    "request_id": request_id,
                    "tool_name": "Bash",
                    "command": command,
                }),
                request_id,
                TIMEOUT,
            )
            .await
            .unwrap()
    }
}

#[tokio::test]
async fn permission_round_trip_across_connections() {
    let h = Harness::start();
    h.say("sleep 30").await;
    h.wait_status(TaskStatus::Running).await;
    h.chat.wait_for("Working on it").await;

    let ack = h.ask("perm-1", "rm -rf build").await;
    assert_eq!(ack.kind, "permission_request_response");
    assert_eq!(ack.payload["status"], "pending");
    h.wait_status(TaskStatus::WaitingConfirm).await;

    let prompt = h.chat.wait_for("rm -rf build").await;
    assert!(prompt.contains("Tool: Bash"));

    // Poll from a fresh connection, as a later hook invocation would.
    let pending = h
        .client()
        .await
        .poll_permission("perm-1", TIMEOUT)
        .await
        .unwrap();
    assert_eq!(pending.status, PollStatus::Pending);

    h.say("ok go ahead").await;
    h.chat.wait_for("Approved").await;

    let answered = h
        .client()
        .await
        .poll_permission("perm-1", TIMEOUT)
        .await
        .unwrap();
    assert_eq!(answered.status, PollStatus::Responded);
    assert_eq!(answered.decision, Some(Decision::Approve));
    assert_eq!(answered.reason.as_deref(), Some("go ahead"));
    h.wait_status(TaskStatus::Running).await;

    h.orch.shutdown().await;
    h.wait_status(TaskStatus::Cancelled).await;
}

#[tokio::test]
async fn permission_for_unknown_session_is_denied_at_once() {
    let h = Harness::start();
    let mut client = h.client().await;
    let reply = client
        .request(
            kinds::PERMISSION_REQUEST,
            json!({
                "session_id": "no-such-session",
                "request_id": "perm-x",
                "tool_name": "Bash",
                "command": "ls",
            }),
            "perm-x",
            TIMEOUT,
        )
        .await
        .unwrap();
    assert_eq!(reply.payload["decision"], "deny");
    assert_eq!(reply.payload["reason"], "task not found");
    assert!(h.orch.broker().get("perm-x").is_none());

    let poll = h
        .client()
        .await
        .poll_permission("perm-x", TIMEOUT)
        .await
        .unwrap();
    assert_eq!(poll.status, PollStatus::NotFound);
    h.orch.shutdown().await;
}

#[tokio::test]
async fn deny_with_reason() {
    let h = Harness::start();
    h.say("sleep 30").await;
    h.wait_status(TaskStatus::Running).await;
    h.ask("perm-1", "git push --force").await;
    h.chat.wait_for("git push --force").await;

    h.say("no not on main").await;
    h.chat.wait_for("Denied").await;

    let request = h.orch.broker().get("perm-1").unwrap();
    assert_eq!(request.decision, Some(Decision::Deny));
    assert_eq!(request.reason.as_deref(), Some("not on main"));
    h.orch.shutdown().await;
}

#[tokio::test]
async fn cancel_denies_pending_and_broadcasts() {
    let h = Harness::start();
    h.say("sleep 30").await;
    h.wait_status(TaskStatus::Running).await;
    h.ask("perm-1", "make deploy").await;
    h.wait_status(TaskStatus::WaitingConfirm).await;

    // The asking hook has hung up; the listener must be the only peer.
    h.wait_peers(0).await;
    let listener = UnixStream::connect(&h.config.socket_path).await.unwrap();
    h.wait_peers(1).await;

    h.say("cancel").await;
    h.chat.wait_for("Task cancelled").await;
    h.wait_status(TaskStatus::Cancelled).await;

    let request = h.orch.broker().get("perm-1").unwrap();
    assert_eq!(request.status, ConfirmationStatus::Cancelled);
    assert_eq!(request.reason.as_deref(), Some("task cancelled"));

    let (reader, _writer) = listener.into_split();
    let mut lines = BufReader::new(reader).lines();
    let line = tokio::time::timeout(TIMEOUT, lines.next_line())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let envelope: Envelope = serde_json::from_str(&line).unwrap();
    assert_eq!(envelope.kind, kinds::CANCEL_TASK);
    assert_eq!(envelope.payload["session_id"], session_id(CHAT));

    h.orch.shutdown().await;
}

#[tokio::test]
async fn cancel_without_task() {
    let h = Harness::start();
    h.say("cancel").await;
    h.chat.wait_for("Nothing to cancel").await;
    h.orch.shutdown().await;
}

#[tokio::test]
async fn status_reports_latest_task() {
    let h = Harness::start();
    h.say("status").await;
    h.chat.wait_for("No tasks yet").await;

    h.say("sleep 30").await;
    h.wait_status(TaskStatus::Running).await;
    h.say("status").await;
    let status = h.chat.wait_for("Task status").await;
    assert!(status.contains("running"));
    assert!(status.contains("sleep 30"));
    h.orch.shutdown().await;
}

#[tokio::test]
async fn second_instruction_while_busy_is_refused() {
    let h = Harness::start();
    h.say("sleep 30").await;
    h.wait_status(TaskStatus::Running).await;

    h.say("echo another").await;
    h.chat.wait_for("already running").await;
    assert_eq!(h.orch.registry().get(&session_id(CHAT)).unwrap().prompt, "sleep 30");
    h.orch.shutdown().await;
}

#[tokio::test]
async fn clean_exit_completes_the_task() {
    let h = Harness::start();
    h.say("exit 0").await;
    h.wait_status(TaskStatus::Completed).await;
    h.chat.wait_for("Task finished").await;

    // The chat can start a new task on the same session.
    h.say("exit 0").await;
    h.chat.wait_for("Working on it").await;
    h.orch.shutdown().await;
}

#[tokio::test]
async fn failing_exit_fails_the_task_with_stderr() {
    let h = Harness::start();
    h.say("echo kaboom >&2; exit 2").await;
    h.wait_status(TaskStatus::Failed).await;

    let message = h.chat.wait_for("Task failed").await;
    assert!(message.contains("exit code 2"));
    assert!(message.contains("kaboom"));
    h.orch.shutdown().await;
}

#[tokio::test]
async fn progress_and_completion_events_reach_chat() {
    let h = Harness::start();
    h.say("sleep 3").await;
    h.wait_status(TaskStatus::Running).await;

    let mut client = h.client().await;
    client
        .send(
            kinds::TASK_PROGRESS,
            json!({"session_id": session_id(CHAT), "tool_name": "Bash", "status": "success", "output": "3 passed"}),
            None,
        )
        .await
        .unwrap();
    let progress = h.chat.wait_for("📍 Bash").await;
    assert!(progress.contains("3 passed"));

    client
        .send(
            kinds::TASK_COMPLETE,
            json!({"session_id": session_id(CHAT), "summary": "All done", "files_changed": ["a.rs"]}),
            None,
        )
        .await
        .unwrap();
    let done = h.chat.wait_for("All done").await;
    assert!(done.contains("a.rs"));
    h.wait_status(TaskStatus::Completed).await;
    h.orch.shutdown().await;
}

#[tokio::test]
async fn shutdown_denies_pending_and_removes_socket() {
    let h = Harness::start();
    h.say("sleep 30").await;
    h.wait_status(TaskStatus::Running).await;
    h.ask("perm-1", "rm -rf /tmp/x").await;

    h.orch.shutdown().await;
    assert_eq!(h.orch.broker().pending_count(), 0);
    assert_eq!(
        h.orch.broker().get("perm-1").unwrap().reason.as_deref(),
        Some("orchestrator shutting down")
    );
    assert_eq!(
        h.orch.registry().get(&session_id(CHAT)).unwrap().status,
        TaskStatus::Cancelled
    );

    for _ in 0..100 {
        if !h.config.socket_path.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(!h.config.socket_path.exists());

    // A second shutdown is a no-op.
    h.orch.shutdown().await;
}

#[tokio::test]
async fn stalled_peer_does_not_hold_up_cancel() {
    let h = Harness::start();
    h.say("sleep 30").await;
    h.wait_status(TaskStatus::Running).await;

    let _stalled = UnixStream::connect(&h.config.socket_path).await.unwrap();
    h.wait_peers(1).await;
    let bulky = Envelope::new(kinds::NOTIFICATION, None, json!({"message": "x".repeat(1 << 20)}));
    for _ in 0..200 {
        h.orch.server().broadcast(&bulky);
    }

    let outcome: CancelOutcome = tokio::time::timeout(
        Duration::from_secs(5),
        h.orch.cancel(&session_id(CHAT)),
    )
    .await
    .expect("cancel completed")
    .unwrap();
    assert!(outcome.terminated);
    h.wait_status(TaskStatus::Cancelled).await;
    h.orch.shutdown().await;
}

#[tokio::test]
async fn permission_asked_during_cancel_is_denied_and_not_kept() {
    let h = Harness::start();
    h.say("trap '' TERM; sleep 30").await;
    h.wait_status(TaskStatus::Running).await;

    // SIGTERM is ignored, so the task sits in cancelling for the grace period.
    h.say("cancel").await;
    h.wait_status(TaskStatus::Cancelling).await;

    let reply = h.ask("late-1", "rm -rf build").await;
    assert_eq!(reply.payload["decision"], "deny");
    assert!(h.orch.broker().get("late-1").is_none());
    assert_eq!(h.orch.broker().pending_count(), 0);

    h.wait_status(TaskStatus::Cancelled).await;
    h.chat.wait_for("Task cancelled").await;
    assert_eq!(h.orch.broker().pending_count(), 0);
    h.orch.shutdown().await;
}

fn git_available() -> bool {
    std::process::Command::new("git").arg("--version").output().is_ok()
}

fn git(dir: &std::path::Path, args: &[&str]) {
    let status = std::process::Command::new("git")
        .args(["-c", "user.name=test", "-c", "user.email=test@example.com"])
        .args(args)
        .current_dir(dir)
        .status()
        .unwrap();
    assert!(status.success(), "git {:?} failed", args);
}

fn init_repo(dir: &std::path::Path) {
    git(dir, &["init", "-q"]);
    std::fs::write(dir.join("handler.rs"), "fn handle() {}\n").unwrap();
    std::fs::write(dir.join("other.rs"), "fn other() {}\n").unwrap();
    git(dir, &["add", "."]);
    git(dir, &["commit", "-q", "-m", "initial"]);
}

#[tokio::test]
async fn diff_shows_uncommitted_changes() {
    if !git_available() {
        return;
    }
    let h = Harness::start();
    init_repo(h.workspace());

    h.say("diff").await;
    h.chat.wait_for("No uncommitted changes").await;

    std::fs::write(h.workspace().join("handler.rs"), "fn handle() { todo!() }\n").unwrap();
    h.say("diff").await;
    let diff = h.chat.wait_for("📄 Changes").await;
    assert!(diff.contains("+fn handle() { todo!() }"));

    h.say("diff other").await;
    for _ in 0..50 {
        if h.chat.texts().iter().filter(|t| t.contains("No uncommitted changes")).count() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(
        h.chat.texts().iter().filter(|t| t.contains("No uncommitted changes")).count(),
        2
    );
    h.orch.shutdown().await;
}

#[tokio::test]
async fn rollback_command_restores_the_workspace() {
    if !git_available() {
        return;
    }
    let h = Harness::start();
    init_repo(h.workspace());
    std::fs::write(h.workspace().join("handler.rs"), "broken\n").unwrap();
    std::fs::write(h.workspace().join("scratch.txt"), "junk").unwrap();

    h.say("rollback").await;
    h.chat.wait_for("rolled back").await;
    assert_eq!(
        std::fs::read_to_string(h.workspace().join("handler.rs")).unwrap(),
        "fn handle() {}\n"
    );
    assert!(!h.workspace().join("scratch.txt").exists());
    h.orch.shutdown().await;
}

#[tokio::test]
async fn rollback_is_refused_while_a_task_runs() {
    let h = Harness::start();
    h.say("sleep 30").await;
    h.wait_status(TaskStatus::Running).await;

    h.say("rollback").await;
    h.chat.wait_for("still running").await;
    h.wait_status(TaskStatus::Running).await;
    h.orch.shutdown().await;
}

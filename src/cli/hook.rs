//! Hook helpers invoked by the agent tool at its lifecycle points.
//!
//! Each one reads the tool's JSON event from stdin, forwards it to the
//! orchestrator and exits 0. Only `permission` writes to stdout.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncReadExt;
use uuid::Uuid;

use crate::config::RelayConfig;
use crate::decision::Decision;
use crate::error::{RelayError, Result};
use crate::ipc::socket_client::IpcClient;
use crate::ipc::{kinds, Notification, PermissionRequest, TaskComplete, TaskProgress};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const ACK_TIMEOUT: Duration = Duration::from_secs(10);
const PREVIEW_CHARS: usize = 200;
const SUMMARY_CHARS: usize = 500;

/// The subset of the agent tool's hook event we use.
#[derive(Debug, Default, Deserialize)]
pub struct HookInput {
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub tool_name: String,
    #[serde(default)]
    pub tool_input: Value,
    #[serde(default)]
    pub tool_output: Value,
    #[serde(default)]
    pub transcript_path: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl HookInput {
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_str(raw)?)
    }

    /// The session id from the event, else from the environment the
    /// supervisor gave the agent.
    pub fn session_id(&self) -> String {
        if !self.session_id.is_empty() {
            return self.session_id.clone();
        }
        ["CLAUDE_SESSION_ID", "HOOKRELAY_SESSION_ID"]
            .iter()
            .find_map(|key| std::env::var(key).ok().filter(|v| !v.is_empty()))
            .unwrap_or_default()
    }
}

/// What the permission hook prints for the agent tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HookDecision {
    pub decision: Decision,
    pub reason: String,
}

impl HookDecision {
    fn deny(reason: impl Into<String>) -> Self {
        Self {
            decision: Decision::Deny,
            reason: reason.into(),
        }
    }
}

async fn read_input() -> Result<HookInput> {
    let mut raw = String::new();
    tokio::io::stdin().read_to_string(&mut raw).await?;
    HookInput::parse(&raw)
}

/// Human-readable description of what a tool call is about to do.
pub fn describe_operation(tool_name: &str, tool_input: &Value) -> String {
    let field = |name: &str| {
        tool_input
            .get(name)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };

    match tool_name {
        "Bash" => match tool_input.get("command").and_then(Value::as_str) {
            Some(command) => command.to_string(),
            None => tool_input.to_string(),
        },
        "Edit" | "Write" | "Read" => format!("{}: {}", tool_name, field("file_path")),
        _ => take_chars(&tool_input.to_string(), PREVIEW_CHARS),
    }
}

/// `success`/`failed` from the tool's exit code, `completed` when there is none.
pub fn progress_status(tool_output: &Value) -> &'static str {
    match tool_output.get("exit_code").and_then(Value::as_i64) {
        Some(0) => "success",
        Some(_) => "failed",
        None => "completed",
    }
}

pub fn output_preview(tool_output: &Value) -> String {
    let stream = |name: &str| {
        tool_output
            .get(name)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    };

    let preview = match (stream("stderr"), stream("stdout")) {
        (Some(stderr), _) => format!("stderr: {}", stderr),
        (None, Some(stdout)) => stdout.to_string(),
        (None, None) => "(no output)".to_string(),
    };
    if preview.chars().count() > PREVIEW_CHARS {
        format!("{}...", take_chars(&preview, PREVIEW_CHARS))
    } else {
        preview
    }
}

/// The tail of the transcript, used as the completion summary.
pub fn transcript_summary(path: &Path) -> String {
    match std::fs::read_to_string(path) {
        Ok(content) => {
            let total = content.chars().count();
            content.chars().skip(total.saturating_sub(SUMMARY_CHARS)).collect()
        }
        Err(e) => {
            tracing::warn!("could not read transcript {}: {}", path.display(), e);
            String::new()
        }
    }
}

fn take_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

/// Connect and send one fire-and-forget event. A missing orchestrator is not an error.
async fn send_event(socket_path: &Path, kind: &str, payload: Value) -> Result<()> {
    let mut client = match IpcClient::connect(socket_path, CONNECT_TIMEOUT).await {
        Ok(client) => client,
        Err(RelayError::SocketNotFound { .. }) => {
            tracing::debug!("orchestrator not running, dropping {}", kind);
            return Ok(());
        }
        Err(e) => return Err(e),
    };
    client.send(kind, payload, None).await?;
    client.close().await
}

/// `hookrelay hook progress`
pub async fn run_progress(config: &RelayConfig) -> Result<()> {
    let input = read_input().await?;
    let progress = TaskProgress {
        session_id: input.session_id(),
        tool_name: input.tool_name.clone(),
        status: progress_status(&input.tool_output).to_string(),
        output: Some(output_preview(&input.tool_output)),
    };
    send_event(
        &config.socket_path,
        kinds::TASK_PROGRESS,
        serde_json::to_value(progress)?,
    )
    .await
}

/// `hookrelay hook stop`
pub async fn run_stop(config: &RelayConfig) -> Result<()> {
    let input = read_input().await?;
    let summary = input
        .transcript_path
        .as_deref()
        .filter(|p| !p.is_empty())
        .map(|p| transcript_summary(Path::new(p)))
        .unwrap_or_default();
    let complete = TaskComplete {
        session_id: input.session_id(),
        summary,
        files_changed: Vec::new(),
    };
    send_event(
        &config.socket_path,
        kinds::TASK_COMPLETE,
        serde_json::to_value(complete)?,
    )
    .await
}

/// `hookrelay hook notify`
pub async fn run_notify(config: &RelayConfig) -> Result<()> {
    let input = read_input().await?;
    let Some(message) = input.message.clone().filter(|m| !m.trim().is_empty()) else {
        return Ok(());
    };
    let notification = Notification {
        session_id: input.session_id(),
        message,
    };
    send_event(
        &config.socket_path,
        kinds::NOTIFICATION,
        serde_json::to_value(notification)?,
    )
    .await
}

/// `hookrelay hook permission`: always prints a decision, denying on any failure.
pub async fn run_permission(config: &RelayConfig) -> Result<()> {
    let verdict = match read_input().await {
        Ok(input) => match ask(config, &input).await {
            Ok(verdict) => verdict,
            Err(RelayError::SocketNotFound { .. }) => HookDecision::deny("orchestrator not running"),
            Err(e) => {
                tracing::warn!("permission request failed: {}", e);
                HookDecision::deny(format!("error: {}", e))
            }
        },
        Err(e) => HookDecision::deny(format!("invalid input: {}", e)),
    };
    println!("{}", serde_json::to_string(&verdict)?);
    Ok(())
}

async fn ask(config: &RelayConfig, input: &HookInput) -> Result<HookDecision> {
    let mut client = IpcClient::connect(&config.socket_path, CONNECT_TIMEOUT).await?;
    let request_id = Uuid::new_v4().to_string();

    let request = PermissionRequest {
        session_id: input.session_id(),
        request_id: request_id.clone(),
        tool_name: input.tool_name.clone(),
        command: describe_operation(&input.tool_name, &input.tool_input),
        reason: None,
    };
    let ack = client
        .request(
            kinds::PERMISSION_REQUEST,
            serde_json::to_value(request)?,
            &request_id,
            ACK_TIMEOUT,
        )
        .await?;
    if ack.kind == kinds::ERROR {
        return Err(RelayError::Ipc {
            reason: format!("orchestrator rejected request: {}", ack.payload),
        });
    }

    // An immediate verdict, e.g. no task for this session.
    if let Some(decision) = ack.payload.get("decision").and_then(Value::as_str) {
        let reason = ack
            .payload
            .get("reason")
            .and_then(Value::as_str)
            .unwrap_or_default();
        return Ok(HookDecision {
            decision: decision.parse().unwrap_or(Decision::Deny),
            reason: reason.to_string(),
        });
    }

    let response = client
        .poll_for_decision(&request_id, config.poll_interval(), config.permission_timeout())
        .await?;
    let _ = client.close().await;

    Ok(match response {
        Some(response) => HookDecision {
            decision: response.effective_decision(),
            reason: response.reason.unwrap_or_default(),
        },
        None => HookDecision::deny("confirmation timeout"),
    })
}

use std::sync::LazyLock;

use regex::Regex;

use crate::broker::ConfirmationRequest;
use crate::supervisor::{DiffOutcome, RollbackOutcome};
use crate::task::{CancelOutcome, TaskSnapshot};

/// Longest tool output shown inline with a progress line.
const PROGRESS_PREVIEW_CHARS: usize = 100;

static ANSI_ESCAPE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(\x07|\x1b\\)|\x1b[@-Z\\-_]").ok()
});

pub fn strip_ansi(text: &str) -> String {
    match ANSI_ESCAPE.as_ref() {
        Some(re) => re.replace_all(text, "").into_owned(),
        None => text.to_string(),
    }
}

/// Cut `text` to at most `max_chars` characters, marking the cut.
pub fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}\n\n... (truncated)", &text[..cut]),
        None => text.to_string(),
    }
}

pub fn progress(tool_name: &str, status: &str, output: Option<&str>) -> String {
    let mut message = format!("📍 {}: {}", tool_name, status);
    if let Some(output) = output {
        let output = strip_ansi(output);
        let output = output.trim();
        if !output.is_empty() && output.chars().count() < PROGRESS_PREVIEW_CHARS {
            message.push('\n');
            message.push_str(output);
        }
    }
    message
}

pub fn completion(summary: &str, files_changed: &[String], max_chars: usize) -> String {
    let summary = strip_ansi(summary);
    let summary = summary.trim();
    let mut message = if summary.is_empty() {
        "✅ Task completed.".to_string()
    } else {
        format!("✅ Agent:\n\n{}", truncate(summary, max_chars))
    };
    if !files_changed.is_empty() {
        message.push_str(&format!("\n\n📝 Files changed: {}", files_changed.join(", ")));
    }
    message
}

pub fn permission_prompt(request: &ConfirmationRequest, reason: Option<&str>) -> String {
    let mut lines = vec![
        "⚠️ The agent wants to run:".to_string(),
        String::new(),
        format!("Tool: {}", request.tool_name),
        format!("Operation: {}", request.operation_descriptor),
    ];
    if let Some(reason) = reason.filter(|r| !r.is_empty()) {
        lines.push(format!("Why: {}", reason));
    }
    lines.extend([
        String::new(),
        "Reply:".to_string(),
        "- \"ok\" or \"y\" to approve".to_string(),
        "- \"no\" or \"n\" to deny".to_string(),
        "- \"cancel\" to stop the whole task".to_string(),
    ]);
    lines.join("\n")
}

pub fn status(task: &TaskSnapshot, pending_confirmations: usize) -> String {
    let prompt: String = task.prompt.chars().take(50).collect();
    let mut lines = vec![
        format!("Task status: {}", task.status.label()),
        format!("📝 {}", prompt),
        format!("🕐 Started {}", task.created_at.format("%H:%M:%S")),
    ];
    if pending_confirmations > 0 {
        lines.push(format!("⚠️ {} confirmation(s) waiting", pending_confirmations));
    }
    if let Some(error) = &task.error_message {
        lines.push(format!("❌ {}", error));
    }
    lines.join("\n")
}

pub fn cancelled(outcome: &CancelOutcome) -> String {
    let mut message = "⏹️ Task cancelled.".to_string();
    match &outcome.rollback {
        Some(RollbackOutcome::RolledBack) => message.push_str("\n↩️ Workspace changes were rolled back."),
        Some(RollbackOutcome::Failed(reason)) => {
            message.push_str(&format!("\n⚠️ Rollback failed, check the workspace: {}", reason))
        }
        _ => {}
    }
    if outcome.warning.is_some() {
        message.push_str("\n⚠️ The agent process did not exit cleanly.");
    }
    message
}

pub fn diff(outcome: &DiffOutcome, max_chars: usize) -> String {
    match outcome {
        DiffOutcome::Changes(diff) => {
            format!("📄 Changes:\n\n```diff\n{}\n```", truncate(diff, max_chars))
        }
        DiffOutcome::Clean => "No uncommitted changes.".to_string(),
        DiffOutcome::NotARepository => "⚠️ The workspace is not a git repository.".to_string(),
        DiffOutcome::Failed(reason) => format!("❌ {}", reason),
    }
}

pub fn rollback(outcome: &RollbackOutcome) -> String {
    match outcome {
        RollbackOutcome::RolledBack => "↩️ Workspace changes were rolled back.".to_string(),
        RollbackOutcome::NothingToRollBack => "No changes to roll back.".to_string(),
        RollbackOutcome::NotARepository => "⚠️ The workspace is not a git repository.".to_string(),
        RollbackOutcome::Failed(reason) => format!("❌ Rollback failed: {}", reason),
    }
}

pub fn failed(reason: &str, stderr_tail: &str, max_chars: usize) -> String {
    let stderr = strip_ansi(stderr_tail);
    let stderr = stderr.trim();
    if stderr.is_empty() {
        format!("❌ Task failed: {}", reason)
    } else {
        format!("❌ Task failed: {}\n\n{}", reason, truncate(stderr, max_chars))
    }
}

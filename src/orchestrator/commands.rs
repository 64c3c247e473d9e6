//! What a chat reply means. Only the first word is inspected.

const APPROVE: &[&str] = &["ok", "y", "yes", "approve", "批准", "确认", "同意", "好", "行"];
const DENY: &[&str] = &["no", "n", "deny", "reject", "拒绝", "不", "不行"];
const CANCEL: &[&str] = &["cancel", "stop", "abort", "取消", "停止"];
const STATUS: &[&str] = &["status", "状态", "进度"];
const DIFF: &[&str] = &["diff", "查看", "改动", "变更"];
const ROLLBACK: &[&str] = &["rollback", "revert", "回滚", "撤销", "还原"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Anything after the keyword is passed on as the reason.
    Approve { reason: Option<String> },
    Deny { reason: Option<String> },
    Cancel,
    Status,
    /// Show uncommitted changes, optionally only paths matching the pattern.
    Diff { pattern: Option<String> },
    /// Discard uncommitted changes in the workspace.
    Rollback,
    /// Not a command: an instruction for the agent.
    Message(String),
}

pub fn parse(text: &str) -> Command {
    let text = text.trim();
    let mut parts = text.splitn(2, char::is_whitespace);
    let first = parts.next().unwrap_or_default().to_lowercase();
    let rest = parts
        .next()
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(String::from);

    let first = first.as_str();
    if APPROVE.contains(&first) {
        Command::Approve { reason: rest }
    } else if DENY.contains(&first) {
        Command::Deny { reason: rest }
    } else if CANCEL.contains(&first) {
        Command::Cancel
    } else if STATUS.contains(&first) {
        Command::Status
    } else if DIFF.contains(&first) {
        Command::Diff { pattern: rest }
    } else if ROLLBACK.contains(&first) {
        Command::Rollback
    } else {
        Command::Message(text.to_string())
    }
}

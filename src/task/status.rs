use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    WaitingConfirm,
    /// Cancel accepted, child not yet reaped.
    Cancelling,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::WaitingConfirm => "waiting_confirm",
            TaskStatus::Cancelling => "cancelling",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// Short label with an emoji, for chat messages.
    pub fn label(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "⏳ pending",
            TaskStatus::Running => "🔄 running",
            TaskStatus::WaitingConfirm => "⏸️ waiting for confirmation",
            TaskStatus::Cancelling => "🛑 cancelling",
            TaskStatus::Completed => "✅ completed",
            TaskStatus::Failed => "❌ failed",
            TaskStatus::Cancelled => "🚫 cancelled",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

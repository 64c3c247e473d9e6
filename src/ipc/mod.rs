pub mod socket_client;
pub mod socket_server;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::decision::{ConfirmationStatus, Decision};

/// Upper bound on a single frame, in either direction.
pub const MAX_FRAME_BYTES: u64 = 1_048_576;

/// Message types carried in the envelope `type` field.
pub mod kinds {
    pub const TASK_PROGRESS: &str = "task_progress";
    pub const TASK_COMPLETE: &str = "task_complete";
    pub const PERMISSION_REQUEST: &str = "permission_request";
    pub const GET_PERMISSION_RESPONSE: &str = "get_permission_response";
    pub const NOTIFICATION: &str = "notification";
    pub const CANCEL_TASK: &str = "cancel_task";
    pub const ERROR: &str = "error";
}

/// One newline-delimited JSON frame on the socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default)]
    pub request_id: Option<String>,

    #[serde(default = "empty_payload")]
    pub payload: Value,
}

fn empty_payload() -> Value {
    Value::Object(serde_json::Map::new())
}

impl Envelope {
    pub fn new(kind: impl Into<String>, request_id: Option<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            request_id,
            payload,
        }
    }

    /// The reply to a handled message: same correlation id, `<type>_response`.
    pub fn reply_to(request: &Envelope, payload: Value) -> Self {
        Self {
            kind: format!("{}_response", request.kind),
            request_id: request.request_id.clone(),
            payload,
        }
    }
}

/// `task_progress`: a tool finished inside the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskProgress {
    pub session_id: String,
    pub tool_name: String,
    pub status: String,
    #[serde(default, alias = "output_preview")]
    pub output: Option<String>,
}

/// `task_complete`: the agent stopped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskComplete {
    pub session_id: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub files_changed: Vec<String>,
}

/// `permission_request`: the agent wants to run a sensitive operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub session_id: String,
    pub request_id: String,
    pub tool_name: String,
    pub command: String,
    #[serde(default)]
    pub reason: Option<String>,
}

/// `get_permission_response`: a hook polling for the human's answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionPoll {
    pub request_id: String,
}

/// Status as seen by a polling hook. `NotFound` has no broker-side counterpart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollStatus {
    Pending,
    Responded,
    Cancelled,
    TimedOut,
    NotFound,
}

impl PollStatus {
    pub fn is_final(&self) -> bool {
        !matches!(self, PollStatus::Pending)
    }
}

impl From<ConfirmationStatus> for PollStatus {
    fn from(status: ConfirmationStatus) -> Self {
        match status {
            ConfirmationStatus::Pending => PollStatus::Pending,
            ConfirmationStatus::Responded => PollStatus::Responded,
            ConfirmationStatus::Cancelled => PollStatus::Cancelled,
            ConfirmationStatus::TimedOut => PollStatus::TimedOut,
        }
    }
}

/// Payload of the reply to `get_permission_response`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionResponse {
    pub request_id: String,
    pub status: PollStatus,
    #[serde(default)]
    pub decision: Option<Decision>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl PermissionResponse {
    /// The decision a hook should act on. Anything unresolved or unknown denies.
    pub fn effective_decision(&self) -> Decision {
        match (self.status, self.decision) {
            (PollStatus::Pending, _) | (PollStatus::NotFound, _) => Decision::Deny,
            (_, Some(decision)) => decision,
            (_, None) => Decision::Deny,
        }
    }
}

/// `notification`: free-form text the agent wants the user to see.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub session_id: String,
    pub message: String,
}

/// `cancel_task`: broadcast to every connected hook when a task is cancelled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelTask {
    pub session_id: String,
}

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("socket {path} is already served by a live orchestrator")]
    TransportBind { path: PathBuf },

    #[error("no reply for {request_id} within {timeout_ms}ms")]
    TransportTimeout { request_id: String, timeout_ms: u64 },

    #[error("confirmation request already exists: {request_id}")]
    DuplicateRequest { request_id: String },

    #[error("task {task_id} already finished ({status})")]
    TaskAlreadyTerminal { task_id: String, status: String },

    #[error("task not found: {task_id}")]
    TaskNotFound { task_id: String },

    #[error("task {task_id} is still active ({status})")]
    TaskActive { task_id: String, status: String },

    #[error("too many active tasks (limit {limit})")]
    TaskCapacity { limit: usize },

    #[error("task {task_id} cannot move from {from} to {to}")]
    InvalidTransition {
        task_id: String,
        from: String,
        to: String,
    },

    #[error("task {task_id} is already being cancelled")]
    CancelInProgress { task_id: String },

    #[error("process {pid} was not reaped within {waited_ms}ms of SIGKILL")]
    ProcessReapTimeout { pid: u32, waited_ms: u64 },

    #[error("failed to spawn {program}: {reason}")]
    Spawn { program: String, reason: String },

    #[error("ipc error: {reason}")]
    Ipc { reason: String },

    #[error("socket not found at {path}")]
    SocketNotFound { path: PathBuf },

    #[error("config parse error in {path}: {reason}")]
    ConfigParse { path: PathBuf, reason: String },

    #[error("unknown {kind} plugin '{name}' (available: {available})")]
    UnknownPlugin {
        kind: &'static str,
        name: String,
        available: String,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, RelayError>;

//! Per-session task state machine.
//!
//! ```text
//! pending -> running <-> waiting_confirm -> completed | failed
//!     \__________\___________\____ cancelling -> cancelled
//! ```

pub mod status;

pub use status::TaskStatus;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{RelayError, Result};
use crate::supervisor::{AgentCommand, ProcessHandle, RollbackOutcome, Supervisor};

/// One unit of agent work. `task_id` is the agent session id.
#[derive(Debug)]
pub struct Task {
    pub task_id: String,
    pub chat_id: String,
    pub prompt: String,
    pub workspace: PathBuf,
    pub status: TaskStatus,
    process: Option<ProcessHandle>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub summary: Option<String>,
    pub files_changed: Vec<String>,
}

impl Task {
    fn new(task_id: &str, chat_id: &str, prompt: &str, workspace: &Path) -> Self {
        let now = Utc::now();
        Self {
            task_id: task_id.to_string(),
            chat_id: chat_id.to_string(),
            prompt: prompt.to_string(),
            workspace: workspace.to_path_buf(),
            status: TaskStatus::Pending,
            process: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            error_message: None,
            summary: None,
            files_changed: Vec::new(),
        }
    }

    fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            task_id: self.task_id.clone(),
            chat_id: self.chat_id.clone(),
            prompt: self.prompt.clone(),
            workspace: self.workspace.clone(),
            status: self.status,
            pid: self.process.as_ref().map(ProcessHandle::pid),
            created_at: self.created_at,
            updated_at: self.updated_at,
            completed_at: self.completed_at,
            error_message: self.error_message.clone(),
            summary: self.summary.clone(),
            files_changed: self.files_changed.clone(),
        }
    }

    fn finish(&mut self, status: TaskStatus) {
        let now = Utc::now();
        self.status = status;
        self.updated_at = now;
        self.completed_at = Some(now);
    }
}

/// Read-only copy of a task, everything except the process handle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskSnapshot {
    pub task_id: String,
    pub chat_id: String,
    pub prompt: String,
    pub workspace: PathBuf,
    pub status: TaskStatus,
    pub pid: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub summary: Option<String>,
    pub files_changed: Vec<String>,
}

/// Result of a cancel. The task is `cancelled` whatever the fields say.
#[derive(Debug, Clone, PartialEq)]
pub struct CancelOutcome {
    pub task_id: String,
    pub previous_status: TaskStatus,
    /// A child was running and has been signalled.
    pub terminated: bool,
    /// Set when the child could not be reaped in time.
    pub warning: Option<String>,
    pub rollback: Option<RollbackOutcome>,
}

/// A task that `begin_cancel` moved to `cancelling`. Hand it to `finish_cancel`.
#[derive(Debug)]
#[must_use]
pub struct PendingCancel {
    task_id: String,
    previous_status: TaskStatus,
    process: Option<ProcessHandle>,
    workspace: PathBuf,
}

impl PendingCancel {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }
}

pub struct TaskRegistry {
    tasks: Mutex<HashMap<String, Task>>,
    supervisor: Arc<Supervisor>,
    grace_period: Duration,
    max_concurrent: usize,
}

impl TaskRegistry {
    pub fn new(supervisor: Arc<Supervisor>, grace_period: Duration, max_concurrent: usize) -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            supervisor,
            grace_period,
            max_concurrent,
        }
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Task>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a new pending task. A terminal entry with the same id is replaced.
    pub fn create_task(
        &self,
        task_id: &str,
        chat_id: &str,
        prompt: &str,
        workspace: &Path,
    ) -> Result<TaskSnapshot> {
        let mut tasks = self.lock();

        if let Some(existing) = tasks.get(task_id) {
            if existing.status.is_active() {
                return Err(RelayError::TaskActive {
                    task_id: task_id.to_string(),
                    status: existing.status.to_string(),
                });
            }
        }

        let active = tasks.values().filter(|t| t.status.is_active()).count();
        if active >= self.max_concurrent {
            return Err(RelayError::TaskCapacity {
                limit: self.max_concurrent,
            });
        }

        let task = Task::new(task_id, chat_id, prompt, workspace);
        let snapshot = task.snapshot();
        tasks.insert(task_id.to_string(), task);
        tracing::info!("created task {} for chat {}", task_id, chat_id);
        Ok(snapshot)
    }

    /// pending -> running, taking ownership of the child.
    pub fn start_task(&self, task_id: &str, process: ProcessHandle) -> Result<TaskSnapshot> {
        self.transition(task_id, &[TaskStatus::Pending], TaskStatus::Running, |task| {
            task.process = Some(process);
        })
    }

    /// Spawn the agent and attach it in one step. The lock is held across the
    /// spawn so the exit watcher never sees a child its task does not know.
    pub fn launch(
        &self,
        task_id: &str,
        command: &AgentCommand,
        workspace: &Path,
    ) -> Result<TaskSnapshot> {
        let mut tasks = self.lock();
        let task = tasks.get_mut(task_id).ok_or_else(|| RelayError::TaskNotFound {
            task_id: task_id.to_string(),
        })?;
        if task.status != TaskStatus::Pending {
            return Err(RelayError::InvalidTransition {
                task_id: task_id.to_string(),
                from: task.status.to_string(),
                to: TaskStatus::Running.to_string(),
            });
        }

        let process = self.supervisor.start(task_id, command, workspace)?;
        task.process = Some(process);
        task.status = TaskStatus::Running;
        task.updated_at = Utc::now();
        Ok(task.snapshot())
    }

    pub fn mark_waiting_confirm(&self, task_id: &str) -> Result<TaskSnapshot> {
        self.transition(
            task_id,
            &[TaskStatus::Running, TaskStatus::WaitingConfirm],
            TaskStatus::WaitingConfirm,
            |_| {},
        )
    }

    pub fn mark_running(&self, task_id: &str) -> Result<TaskSnapshot> {
        self.transition(
            task_id,
            &[TaskStatus::Running, TaskStatus::WaitingConfirm],
            TaskStatus::Running,
            |_| {},
        )
    }

    /// Touch `updated_at` without changing state.
    pub fn record_activity(&self, task_id: &str) -> Result<TaskSnapshot> {
        let mut tasks = self.lock();
        let task = tasks.get_mut(task_id).ok_or_else(|| RelayError::TaskNotFound {
            task_id: task_id.to_string(),
        })?;
        if task.status.is_terminal() {
            return Err(already_terminal(task));
        }
        task.updated_at = Utc::now();
        Ok(task.snapshot())
    }

    pub fn complete_task(
        &self,
        task_id: &str,
        summary: &str,
        files_changed: Vec<String>,
    ) -> Result<TaskSnapshot> {
        let snapshot = self.transition(
            task_id,
            &[TaskStatus::Running, TaskStatus::WaitingConfirm],
            TaskStatus::Completed,
            |task| {
                task.summary = Some(summary.to_string());
                task.files_changed = files_changed;
            },
        )?;
        tracing::info!("task {} completed", task_id);
        Ok(snapshot)
    }

    pub fn fail_task(&self, task_id: &str, reason: &str) -> Result<TaskSnapshot> {
        let snapshot = self.transition(
            task_id,
            &[
                TaskStatus::Pending,
                TaskStatus::Running,
                TaskStatus::WaitingConfirm,
            ],
            TaskStatus::Failed,
            |task| task.error_message = Some(reason.to_string()),
        )?;
        tracing::warn!("task {} failed: {}", task_id, reason);
        Ok(snapshot)
    }

    /// Cancel a non-terminal task: terminate its child, optionally roll back
    /// the workspace, and always end in `cancelled`.
    pub async fn cancel_task(&self, task_id: &str, rollback: bool) -> Result<CancelOutcome> {
        let pending = self.begin_cancel(task_id)?;
        Ok(self.finish_cancel(pending, rollback).await)
    }

    /// First half of a cancel: move the task to `cancelling` and take its
    /// child. From here on no transition other than `finish_cancel` applies.
    pub fn begin_cancel(&self, task_id: &str) -> Result<PendingCancel> {
        let mut tasks = self.lock();
        let task = tasks.get_mut(task_id).ok_or_else(|| RelayError::TaskNotFound {
            task_id: task_id.to_string(),
        })?;
        match task.status {
            status if status.is_terminal() => return Err(already_terminal(task)),
            TaskStatus::Cancelling => {
                return Err(RelayError::CancelInProgress {
                    task_id: task_id.to_string(),
                })
            }
            _ => {}
        }

        let previous_status = task.status;
        task.status = TaskStatus::Cancelling;
        task.updated_at = Utc::now();
        tracing::info!("cancelling task {} (was {})", task_id, previous_status);

        Ok(PendingCancel {
            task_id: task_id.to_string(),
            previous_status,
            process: task.process.take(),
            workspace: task.workspace.clone(),
        })
    }

    /// Second half of a cancel: terminate, optionally roll back, mark `cancelled`.
    pub async fn finish_cancel(&self, pending: PendingCancel, rollback: bool) -> CancelOutcome {
        let PendingCancel {
            task_id,
            previous_status,
            process,
            workspace,
        } = pending;

        let mut warning = None;
        let terminated = match &process {
            Some(handle) if !handle.has_exited() => {
                if let Err(e) = self.supervisor.terminate(handle, self.grace_period).await {
                    tracing::warn!("task {}: {}", task_id, e);
                    warning = Some(e.to_string());
                }
                true
            }
            _ => false,
        };

        let rollback = if rollback {
            Some(self.supervisor.rollback(&workspace).await)
        } else {
            None
        };

        {
            let mut tasks = self.lock();
            if let Some(task) = tasks.get_mut(&task_id) {
                task.process = process;
                task.finish(TaskStatus::Cancelled);
                if let Some(warning) = &warning {
                    task.error_message = Some(warning.clone());
                }
            }
        }
        tracing::info!("task {} cancelled", task_id);

        CancelOutcome {
            task_id,
            previous_status,
            terminated,
            warning,
            rollback,
        }
    }

    pub fn get(&self, task_id: &str) -> Option<TaskSnapshot> {
        self.lock().get(task_id).map(Task::snapshot)
    }

    /// The newest non-terminal task of a chat.
    pub fn active_for_chat(&self, chat_id: &str) -> Option<TaskSnapshot> {
        self.lock()
            .values()
            .filter(|t| t.chat_id == chat_id && t.status.is_active())
            .max_by_key(|t| t.created_at)
            .map(Task::snapshot)
    }

    /// The newest task of a chat, finished or not.
    pub fn latest_for_chat(&self, chat_id: &str) -> Option<TaskSnapshot> {
        self.lock()
            .values()
            .filter(|t| t.chat_id == chat_id)
            .max_by_key(|t| t.created_at)
            .map(Task::snapshot)
    }

    pub fn active_tasks(&self) -> Vec<TaskSnapshot> {
        let mut active: Vec<TaskSnapshot> = self
            .lock()
            .values()
            .filter(|t| t.status.is_active())
            .map(Task::snapshot)
            .collect();
        active.sort_by_key(|t| t.created_at);
        active
    }

    pub fn remove_task(&self, task_id: &str) -> Option<TaskSnapshot> {
        self.lock().remove(task_id).map(|t| t.snapshot())
    }

    /// Drop terminal tasks that finished more than `max_age` ago.
    pub fn cleanup_finished(&self, max_age: Duration) -> usize {
        let now = Utc::now();
        let mut tasks = self.lock();
        let before = tasks.len();
        tasks.retain(|_, task| {
            let expired = task.status.is_terminal()
                && task
                    .completed_at
                    .and_then(|at| (now - at).to_std().ok())
                    .is_some_and(|age| age > max_age);
            !expired
        });
        before - tasks.len()
    }

    /// Terminate every live child and mark its task cancelled. Used on shutdown.
    pub async fn terminate_all(&self) -> usize {
        let live: Vec<(String, ProcessHandle)> = {
            let mut tasks = self.lock();
            tasks
                .values_mut()
                .filter(|t| t.status.is_active() && t.status != TaskStatus::Cancelling)
                .filter_map(|t| {
                    t.status = TaskStatus::Cancelling;
                    t.process.take().map(|p| (t.task_id.clone(), p))
                })
                .collect()
        };

        let mut terminated = 0;
        for (task_id, handle) in &live {
            if let Err(e) = self.supervisor.terminate(handle, self.grace_period).await {
                tracing::warn!("task {}: {}", task_id, e);
            }
            terminated += 1;
        }

        let mut tasks = self.lock();
        for (task_id, handle) in live {
            if let Some(task) = tasks.get_mut(&task_id) {
                task.process = Some(handle);
            }
        }
        for task in tasks.values_mut() {
            if task.status == TaskStatus::Cancelling {
                task.finish(TaskStatus::Cancelled);
                task.error_message = Some("orchestrator shutting down".into());
            }
        }
        terminated
    }

    fn transition<F>(
        &self,
        task_id: &str,
        allowed: &[TaskStatus],
        to: TaskStatus,
        apply: F,
    ) -> Result<TaskSnapshot>
    where
        F: FnOnce(&mut Task),
    {
        let mut tasks = self.lock();
        let task = tasks.get_mut(task_id).ok_or_else(|| RelayError::TaskNotFound {
            task_id: task_id.to_string(),
        })?;

        if task.status.is_terminal() {
            return Err(already_terminal(task));
        }
        if !allowed.contains(&task.status) {
            return Err(RelayError::InvalidTransition {
                task_id: task_id.to_string(),
                from: task.status.to_string(),
                to: to.to_string(),
            });
        }

        apply(task);
        if to.is_terminal() {
            task.finish(to);
        } else {
            task.status = to;
            task.updated_at = Utc::now();
        }
        Ok(task.snapshot())
    }
}

fn already_terminal(task: &Task) -> RelayError {
    RelayError::TaskAlreadyTerminal {
        task_id: task.task_id.clone(),
        status: task.status.to_string(),
    }
}

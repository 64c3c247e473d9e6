//! Wires the transport, broker, registry and supervisor to a chat platform.

pub mod commands;
pub mod messages;
pub mod notifier;

use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};

use crate::broker::{ConfirmationBroker, PollOutcome, REASON_TASK_CANCELLED};
use crate::chat::{ChatPlatform, InboundMessage};
use crate::config::RelayConfig;
use crate::decision::Decision;
use crate::error::{RelayError, Result};
use crate::ipc::socket_server::IpcServer;
use crate::ipc::{
    kinds, CancelTask, Envelope, Notification, PermissionPoll, PermissionRequest,
    PermissionResponse, PollStatus, TaskComplete, TaskProgress,
};
use crate::session::SessionMapper;
use crate::supervisor::{AgentLauncher, ProcessExit, Supervisor};
use crate::task::{CancelOutcome, TaskRegistry, TaskStatus};

use commands::Command;
use notifier::Notifier;

pub struct Orchestrator {
    config: RelayConfig,
    chat: Arc<dyn ChatPlatform>,
    launcher: Arc<dyn AgentLauncher>,
    server: Arc<IpcServer>,
    broker: Arc<ConfirmationBroker>,
    registry: Arc<TaskRegistry>,
    sessions: SessionMapper,
    notifier: Notifier,
    exits: Mutex<Option<mpsc::UnboundedReceiver<ProcessExit>>>,
    stop: watch::Sender<bool>,
}

impl Orchestrator {
    pub fn new(
        config: RelayConfig,
        chat: Arc<dyn ChatPlatform>,
        launcher: Arc<dyn AgentLauncher>,
    ) -> Arc<Self> {
        let (supervisor, exits) = Supervisor::new(config.socket_path.clone(), config.reap_timeout());
        let registry = TaskRegistry::new(
            Arc::new(supervisor),
            config.grace_period(),
            config.max_concurrent_tasks,
        );
        let (stop, _) = watch::channel(false);

        Arc::new(Self {
            server: Arc::new(IpcServer::new(config.socket_path.clone())),
            broker: Arc::new(ConfirmationBroker::new(config.permission_timeout())),
            registry: Arc::new(registry),
            sessions: SessionMapper::new(config.session_ttl()),
            notifier: Notifier::new(),
            exits: Mutex::new(Some(exits)),
            stop,
            config,
            chat,
            launcher,
        })
    }

    pub fn broker(&self) -> &ConfirmationBroker {
        &self.broker
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn sessions(&self) -> &SessionMapper {
        &self.sessions
    }

    pub fn server(&self) -> &Arc<IpcServer> {
        &self.server
    }

    /// Bind the socket and start the background workers: transport, notifier,
    /// process-exit watcher and housekeeping.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        self.register_handlers();
        let listener = self.server.listen()?;

        let server = self.server.clone();
        tokio::spawn(async move {
            if let Err(e) = server.serve(listener).await {
                tracing::error!("ipc server stopped: {}", e);
            }
        });

        self.notifier.spawn(self.chat.clone());

        let exits = self.exits.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(mut exits) = exits {
            let this = Arc::downgrade(self);
            tokio::spawn(async move {
                while let Some(exit) = exits.recv().await {
                    let Some(this) = this.upgrade() else { break };
                    this.handle_exit(exit);
                }
            });
        }

        let this = self.clone();
        tokio::spawn(async move { this.housekeeping().await });

        tracing::info!(
            "orchestrator started (chat: {}, launcher: {})",
            self.chat.name(),
            self.launcher.name()
        );
        Ok(())
    }

    /// Start, feed chat input to `handle_inbound` until interrupted, then shut down.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        self.start()?;

        let (inbound_tx, mut inbound_rx) = mpsc::channel(64);
        let chat = self.chat.clone();
        tokio::spawn(async move {
            if let Err(e) = chat.run(inbound_tx).await {
                tracing::error!("{} intake failed: {}", chat.name(), e);
            }
        });

        let this = self.clone();
        let dispatcher = tokio::spawn(async move {
            while let Some(message) = inbound_rx.recv().await {
                this.handle_inbound(message).await;
            }
        });

        wait_for_signal().await;
        dispatcher.abort();
        self.shutdown().await;
        Ok(())
    }

    /// Deny everything pending, stop every child and close the socket.
    pub async fn shutdown(&self) {
        if self.stop.send_replace(true) {
            return;
        }
        tracing::info!("shutting down");

        let cancelled = self.broker.shutdown();
        if cancelled > 0 {
            tracing::info!("cancelled {} pending confirmation(s)", cancelled);
        }
        let terminated = self.registry.terminate_all().await;
        if terminated > 0 {
            tracing::info!("terminated {} agent process(es)", terminated);
        }
        self.server.shutdown();
    }

    fn register_handlers(self: &Arc<Self>) {
        self.route(kinds::TASK_PROGRESS, Self::on_task_progress);
        self.route(kinds::TASK_COMPLETE, Self::on_task_complete);
        self.route(kinds::PERMISSION_REQUEST, Self::on_permission_request);
        self.route(kinds::GET_PERMISSION_RESPONSE, Self::on_get_permission_response);
        self.route(kinds::NOTIFICATION, Self::on_notification);
    }

    /// Register a typed handler. The server only holds a weak reference back.
    fn route<T, F>(self: &Arc<Self>, kind: &str, handler: F)
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(&Self, T) -> Result<Option<Value>> + Send + Sync + 'static,
    {
        let this = Arc::downgrade(self);
        let handler = Arc::new(handler);
        self.server.on(kind, move |payload| {
            let this = this.clone();
            let handler = handler.clone();
            async move {
                let Some(this) = this.upgrade() else {
                    return Ok(None);
                };
                parse(payload).and_then(|message| handler(&this, message))
            }
        });
    }

    fn on_task_progress(&self, progress: TaskProgress) -> Result<Option<Value>> {
        let Some(task) = self.registry.get(&progress.session_id) else {
            tracing::debug!("progress for unknown session {}", progress.session_id);
            return Ok(None);
        };
        if let Err(e) = self.registry.record_activity(&task.task_id) {
            tracing::debug!("ignoring progress: {}", e);
            return Ok(None);
        }

        self.notifier.notify(
            &task.chat_id,
            messages::progress(&progress.tool_name, &progress.status, progress.output.as_deref()),
        );
        Ok(None)
    }

    fn on_task_complete(&self, complete: TaskComplete) -> Result<Option<Value>> {
        let Some(task) = self.registry.get(&complete.session_id) else {
            tracing::debug!("completion for unknown session {}", complete.session_id);
            return Ok(None);
        };

        match self.registry.complete_task(
            &task.task_id,
            &complete.summary,
            complete.files_changed.clone(),
        ) {
            Ok(_) => {}
            // The process exit can be observed before the hook's message.
            Err(RelayError::TaskAlreadyTerminal { .. }) if task.status == TaskStatus::Completed => {}
            Err(e) => {
                tracing::debug!("ignoring completion: {}", e);
                return Ok(None);
            }
        }

        self.notifier.notify(
            &task.chat_id,
            messages::completion(
                &complete.summary,
                &complete.files_changed,
                self.config.max_output_length,
            ),
        );
        Ok(None)
    }

    fn on_permission_request(&self, request: PermissionRequest) -> Result<Option<Value>> {
        let task = match self.registry.get(&request.session_id) {
            Some(task) if task.status.is_active() && task.status != TaskStatus::Cancelling => task,
            _ => {
                tracing::info!(
                    "denying {} for inactive session {}",
                    request.request_id,
                    request.session_id
                );
                return Ok(Some(json!({ "decision": "deny", "reason": "task not found" })));
            }
        };

        let created = match self.broker.create(
            &request.request_id,
            &task.task_id,
            &request.tool_name,
            &request.command,
        ) {
            Ok(created) => created,
            // A later hook invocation resuming its wait.
            Err(RelayError::DuplicateRequest { .. }) => {
                return Ok(Some(json!({ "status": "pending", "request_id": request.request_id })));
            }
            Err(e) => return Err(e),
        };

        if let Err(e) = self.registry.mark_waiting_confirm(&task.task_id) {
            // Cancelled or finished since the lookup above.
            tracing::info!("task {} no longer takes confirmations: {}", task.task_id, e);
            self.broker.cancel_all_for_task(&task.task_id);
            return Ok(Some(json!({ "decision": "deny", "reason": REASON_TASK_CANCELLED })));
        }
        self.notifier.notify(
            &task.chat_id,
            messages::permission_prompt(&created, request.reason.as_deref()),
        );
        Ok(Some(json!({ "status": "pending", "request_id": request.request_id })))
    }

    fn on_get_permission_response(&self, poll: PermissionPoll) -> Result<Option<Value>> {
        let response = match self.broker.poll(&poll.request_id) {
            PollOutcome::NotFound => PermissionResponse {
                request_id: poll.request_id,
                status: PollStatus::NotFound,
                decision: None,
                reason: None,
            },
            PollOutcome::Found {
                status,
                decision,
                reason,
            } => {
                if status.is_resolved() {
                    if let Some(request) = self.broker.get(&poll.request_id) {
                        self.resume_if_unblocked(&request.task_id);
                    }
                }
                PermissionResponse {
                    request_id: poll.request_id,
                    status: status.into(),
                    decision,
                    reason,
                }
            }
        };
        Ok(Some(serde_json::to_value(response)?))
    }

    fn on_notification(&self, notification: Notification) -> Result<Option<Value>> {
        match self.registry.get(&notification.session_id) {
            Some(task) => self.notifier.notify(&task.chat_id, notification.message),
            None => tracing::debug!("notification for unknown session {}", notification.session_id),
        }
        Ok(None)
    }

    /// Back to running once the last pending confirmation is answered.
    fn resume_if_unblocked(&self, task_id: &str) {
        let waiting = self
            .registry
            .get(task_id)
            .is_some_and(|t| t.status == TaskStatus::WaitingConfirm);
        if waiting && self.broker.pending_for_task(task_id).is_empty() {
            if let Err(e) = self.registry.mark_running(task_id) {
                tracing::debug!("task {} not resumed: {}", task_id, e);
            }
        }
    }

    /// React to one message typed by a human.
    pub async fn handle_inbound(self: &Arc<Self>, message: InboundMessage) {
        let chat_id = message.chat_id.as_str();
        let command = commands::parse(&message.text);
        let active = self.registry.active_for_chat(chat_id);
        tracing::debug!("chat {} sent {:?}", chat_id, command);

        match (command, active) {
            (Command::Approve { reason }, Some(task)) => {
                self.decide(chat_id, &task.task_id, Decision::Approve, reason, &message.text)
                    .await
            }
            (Command::Deny { reason }, Some(task)) => {
                self.decide(chat_id, &task.task_id, Decision::Deny, reason, &message.text)
                    .await
            }
            (Command::Cancel, Some(task)) => {
                let this = self.clone();
                let chat_id = chat_id.to_string();
                tokio::spawn(async move {
                    match this.cancel(&task.task_id).await {
                        Ok(outcome) => this.notifier.notify(&chat_id, messages::cancelled(&outcome)),
                        Err(RelayError::CancelInProgress { .. }) => {
                            this.notifier.notify(&chat_id, "⏹️ Already cancelling.")
                        }
                        Err(e) => this.notifier.notify(&chat_id, format!("❌ Cancel failed: {}", e)),
                    }
                });
            }
            (Command::Cancel, None) => self.notifier.notify(chat_id, "Nothing to cancel."),
            (Command::Diff { pattern }, _) => {
                let this = self.clone();
                let chat_id = chat_id.to_string();
                let workspace = self.workspace_for(&chat_id);
                tokio::spawn(async move {
                    let outcome = this
                        .registry
                        .supervisor()
                        .diff(&workspace, pattern.as_deref())
                        .await;
                    this.notifier
                        .notify(&chat_id, messages::diff(&outcome, this.config.max_output_length));
                });
            }
            (Command::Rollback, Some(_)) => self
                .notifier
                .notify(chat_id, "⚠️ A task is still running. Reply \"cancel\" first."),
            (Command::Rollback, None) => {
                let this = self.clone();
                let chat_id = chat_id.to_string();
                let workspace = self.workspace_for(&chat_id);
                tokio::spawn(async move {
                    let outcome = this.registry.supervisor().rollback(&workspace).await;
                    this.notifier.notify(&chat_id, messages::rollback(&outcome));
                });
            }
            (Command::Status, _) => {
                let text = match self.registry.latest_for_chat(chat_id) {
                    Some(task) => {
                        messages::status(&task, self.broker.pending_for_task(&task.task_id).len())
                    }
                    None => "No tasks yet.".to_string(),
                };
                self.notifier.notify(chat_id, text);
            }
            (Command::Message(text), _) => self.start_task(chat_id, &text),
            (_, None) => self.start_task(chat_id, message.text.trim()),
        }
    }

    async fn decide(
        &self,
        chat_id: &str,
        task_id: &str,
        decision: Decision,
        reason: Option<String>,
        raw: &str,
    ) {
        let Some(pending) = self.broker.latest_pending_for_task(task_id) else {
            // Nothing to answer; the words are an instruction after all.
            self.start_task(chat_id, raw.trim());
            return;
        };

        if self
            .broker
            .respond(&pending.request_id, decision, reason.as_deref())
        {
            self.resume_if_unblocked(task_id);
            let text = match decision {
                Decision::Approve => "✅ Approved",
                Decision::Deny => "❌ Denied",
            };
            self.notifier.notify(chat_id, text);
        }
    }

    /// Stop the task taking confirmations, deny the pending ones, tell its
    /// hooks to stop, then terminate and optionally roll back.
    pub async fn cancel(&self, task_id: &str) -> Result<CancelOutcome> {
        let notice = Envelope::new(
            kinds::CANCEL_TASK,
            None,
            serde_json::to_value(CancelTask {
                session_id: task_id.to_string(),
            })?,
        );

        let pending = self.registry.begin_cancel(task_id)?;
        let denied = self.broker.cancel_all_for_task(task_id);
        let reached = self.server.broadcast(&notice);
        tracing::debug!(
            "cancel of {}: denied {} confirmation(s), told {} peer(s)",
            task_id,
            denied,
            reached
        );

        Ok(self
            .registry
            .finish_cancel(pending, self.config.auto_rollback)
            .await)
    }

    /// Where git commands from a chat run: its latest task's workspace.
    fn workspace_for(&self, chat_id: &str) -> std::path::PathBuf {
        self.registry
            .latest_for_chat(chat_id)
            .map(|task| task.workspace)
            .unwrap_or_else(|| self.config.workspace.clone())
    }

    /// Create and launch a task for a chat.
    pub fn start_task(&self, chat_id: &str, prompt: &str) {
        if prompt.is_empty() {
            return;
        }

        let session_id = self.sessions.session_for(chat_id);
        let resume = self.registry.get(&session_id).is_some();

        if let Err(e) = self
            .registry
            .create_task(&session_id, chat_id, prompt, &self.config.workspace)
        {
            let text = match e {
                RelayError::TaskActive { .. } => {
                    "⚠️ A task is already running here. Reply \"status\" or \"cancel\".".to_string()
                }
                RelayError::TaskCapacity { limit } => {
                    format!("⚠️ Too many tasks running (limit {}), try again later.", limit)
                }
                other => format!("❌ Could not create the task: {}", other),
            };
            self.notifier.notify(chat_id, text);
            return;
        }
        self.notifier.notify(chat_id, "🤔 Working on it...");

        let command = self.launcher.command(prompt, &session_id, resume);
        if let Err(e) = self
            .registry
            .launch(&session_id, &command, &self.config.workspace)
        {
            tracing::error!("failed to launch task {}: {}", session_id, e);
            let _ = self.registry.fail_task(&session_id, &e.to_string());
            self.notifier
                .notify(chat_id, format!("❌ Failed to start the agent: {}", e));
        }
    }

    fn handle_exit(&self, exit: ProcessExit) {
        let Some(task) = self.registry.get(&exit.task_id) else {
            return;
        };
        // A late exit from an earlier turn of the same session.
        if task.pid != Some(exit.pid) {
            tracing::debug!("ignoring exit of stale pid {} for {}", exit.pid, exit.task_id);
            return;
        }
        if !matches!(task.status, TaskStatus::Running | TaskStatus::WaitingConfirm) {
            return;
        }

        if exit.code == Some(0) {
            if self.registry.complete_task(&task.task_id, "", Vec::new()).is_ok() {
                self.notifier.notify(&task.chat_id, "✅ Task finished.");
            }
            return;
        }

        let reason = match (exit.code, exit.signal) {
            (Some(code), _) => format!("exit code {}", code),
            (None, Some(signal)) => format!("killed by signal {}", signal),
            (None, None) => "agent exited abnormally".to_string(),
        };
        self.broker.cancel_all_for_task(&task.task_id);
        if self.registry.fail_task(&task.task_id, &reason).is_ok() {
            self.notifier.notify(
                &task.chat_id,
                messages::failed(&reason, &exit.stderr_tail, self.config.max_output_length),
            );
        }
    }

    async fn housekeeping(&self) {
        let mut stop = self.stop.subscribe();
        let mut ticker = tokio::time::interval(self.config.sweep_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let expired = self.broker.expire_stale();
                    let purged = self.broker.purge_resolved(self.config.retention());
                    let tasks = self.registry.cleanup_finished(self.config.retention());
                    let chats = self.sessions.cleanup_expired();
                    if expired + purged + tasks + chats > 0 {
                        tracing::debug!(
                            "housekeeping: {} expired, {} purged, {} tasks, {} chats",
                            expired, purged, tasks, chats
                        );
                    }
                }
                _ = async { let _ = stop.wait_for(|stopped| *stopped).await; } => break,
            }
        }
    }
}

fn parse<T: DeserializeOwned>(payload: Value) -> Result<T> {
    Ok(serde_json::from_value(payload)?)
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => tracing::info!("received Ctrl+C"),
                    _ = sigterm.recv() => tracing::info!("received SIGTERM"),
                }
                return;
            }
            Err(e) => tracing::warn!("failed to install SIGTERM handler: {}", e),
        }
    }
    let _ = tokio::signal::ctrl_c().await;
}

//! Pending human approvals, keyed by correlation id.
//!
//! The asker is a short-lived hook process that polls across many separate
//! connections, so "a confirmation is needed" and "a confirmation is
//! answered" are decoupled here. Every entry is resolved exactly once.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::decision::{ConfirmationStatus, Decision};
use crate::error::{RelayError, Result};

pub const REASON_TIMEOUT: &str = "confirmation timeout";
pub const REASON_TASK_CANCELLED: &str = "task cancelled";
pub const REASON_SHUTDOWN: &str = "orchestrator shutting down";

/// One outstanding (or resolved) approval.
#[derive(Debug, Clone, Serialize)]
pub struct ConfirmationRequest {
    pub request_id: String,
    pub task_id: String,
    pub tool_name: String,
    /// What the agent wants to do: a shell command, a file path, ...
    pub operation_descriptor: String,
    pub status: ConfirmationStatus,
    pub decision: Option<Decision>,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    created: Instant,
    #[serde(skip)]
    settled: Option<Instant>,
}

impl ConfirmationRequest {
    fn resolve(&mut self, status: ConfirmationStatus, decision: Decision, reason: Option<String>) {
        self.status = status;
        self.decision = Some(decision);
        self.reason = reason;
        self.resolved_at = Some(Utc::now());
        self.settled = Some(Instant::now());
    }
}

/// Non-blocking view of a request, as returned by `poll`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    NotFound,
    Found {
        status: ConfirmationStatus,
        decision: Option<Decision>,
        reason: Option<String>,
    },
}

impl PollOutcome {
    pub fn is_resolved(&self) -> bool {
        match self {
            PollOutcome::NotFound => false,
            PollOutcome::Found { status, .. } => status.is_resolved(),
        }
    }
}

#[derive(Default)]
struct BrokerState {
    requests: HashMap<String, ConfirmationRequest>,
    by_task: HashMap<String, Vec<String>>,
}

/// All mutations go through one lock that is never held across an await.
pub struct ConfirmationBroker {
    state: Mutex<BrokerState>,
    resolved: Notify,
    default_timeout: Duration,
}

impl ConfirmationBroker {
    /// `default_timeout` bounds how long an entry may stay pending before a
    /// poll or sweep denies it.
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(BrokerState::default()),
            resolved: Notify::new(),
            default_timeout,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn create(
        &self,
        request_id: &str,
        task_id: &str,
        tool_name: &str,
        operation_descriptor: &str,
    ) -> Result<ConfirmationRequest> {
        let mut state = self.lock();
        if state.requests.contains_key(request_id) {
            return Err(RelayError::DuplicateRequest {
                request_id: request_id.to_string(),
            });
        }

        let request = ConfirmationRequest {
            request_id: request_id.to_string(),
            task_id: task_id.to_string(),
            tool_name: tool_name.to_string(),
            operation_descriptor: operation_descriptor.to_string(),
            status: ConfirmationStatus::Pending,
            decision: None,
            reason: None,
            created_at: Utc::now(),
            resolved_at: None,
            created: Instant::now(),
            settled: None,
        };
        state
            .requests
            .insert(request_id.to_string(), request.clone());
        state
            .by_task
            .entry(task_id.to_string())
            .or_default()
            .push(request_id.to_string());
        Ok(request)
    }

    /// Record the human's answer. Returns false if the id is unknown or was
    /// already resolved (for instance by a timeout sweep).
    pub fn respond(&self, request_id: &str, decision: Decision, reason: Option<&str>) -> bool {
        let updated = {
            let mut state = self.lock();
            match state.requests.get_mut(request_id) {
                Some(request) if request.status == ConfirmationStatus::Pending => {
                    request.resolve(
                        ConfirmationStatus::Responded,
                        decision,
                        reason.map(String::from),
                    );
                    true
                }
                _ => false,
            }
        };
        if updated {
            self.resolved.notify_waiters();
        }
        updated
    }

    /// Current state of a request. Never blocks on the human.
    pub fn poll(&self, request_id: &str) -> PollOutcome {
        let (outcome, expired) = {
            let mut state = self.lock();
            let Some(request) = state.requests.get_mut(request_id) else {
                return PollOutcome::NotFound;
            };

            let expired = request.status == ConfirmationStatus::Pending
                && request.created.elapsed() > self.default_timeout;
            if expired {
                request.resolve(
                    ConfirmationStatus::TimedOut,
                    Decision::Deny,
                    Some(REASON_TIMEOUT.into()),
                );
            }

            (
                PollOutcome::Found {
                    status: request.status,
                    decision: request.decision,
                    reason: request.reason.clone(),
                },
                expired,
            )
        };
        if expired {
            self.resolved.notify_waiters();
        }
        outcome
    }

    /// Wait for the answer. On timeout the request is denied with
    /// "confirmation timeout" so that a late reply becomes a no-op.
    pub async fn await_response(&self, request_id: &str, timeout: Duration) -> Decision {
        let deadline = Instant::now() + timeout;

        loop {
            // Register interest before checking, so a respond() between the
            // check and the await still wakes us.
            let notified = self.resolved.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.poll(request_id) {
                PollOutcome::NotFound => return Decision::Deny,
                PollOutcome::Found {
                    status, decision, ..
                } if status.is_resolved() => return decision.unwrap_or(Decision::Deny),
                PollOutcome::Found { .. } => {}
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.expire(request_id);
            }
        }
    }

    /// Deny a pending request on timeout, or report what it was resolved to.
    fn expire(&self, request_id: &str) -> Decision {
        let (decision, changed) = {
            let mut state = self.lock();
            match state.requests.get_mut(request_id) {
                Some(request) if request.status == ConfirmationStatus::Pending => {
                    request.resolve(
                        ConfirmationStatus::TimedOut,
                        Decision::Deny,
                        Some(REASON_TIMEOUT.into()),
                    );
                    (Decision::Deny, true)
                }
                Some(request) => (request.decision.unwrap_or(Decision::Deny), false),
                None => (Decision::Deny, false),
            }
        };
        if changed {
            tracing::info!("confirmation {} timed out, denied", request_id);
            self.resolved.notify_waiters();
        }
        decision
    }

    /// Deny every pending request of a task. Returns how many were pending.
    pub fn cancel_all_for_task(&self, task_id: &str) -> usize {
        let count = self.resolve_pending_where(
            |request| request.task_id == task_id,
            ConfirmationStatus::Cancelled,
            REASON_TASK_CANCELLED,
        );
        if count > 0 {
            tracing::info!("cancelled {} pending confirmation(s) for task {}", count, task_id);
        }
        count
    }

    /// Resolve every pending request to `cancelled`. Called on orchestrator shutdown.
    pub fn shutdown(&self) -> usize {
        self.resolve_pending_where(|_| true, ConfirmationStatus::Cancelled, REASON_SHUTDOWN)
    }

    /// Deny every request pending longer than the default timeout.
    pub fn expire_stale(&self) -> usize {
        let timeout = self.default_timeout;
        self.resolve_pending_where(
            |request| request.created.elapsed() > timeout,
            ConfirmationStatus::TimedOut,
            REASON_TIMEOUT,
        )
    }

    fn resolve_pending_where<F>(&self, predicate: F, status: ConfirmationStatus, reason: &str) -> usize
    where
        F: Fn(&ConfirmationRequest) -> bool,
    {
        let count = {
            let mut state = self.lock();
            let mut count = 0;
            for request in state.requests.values_mut() {
                if request.status == ConfirmationStatus::Pending && predicate(request) {
                    request.resolve(status, Decision::Deny, Some(reason.to_string()));
                    count += 1;
                }
            }
            count
        };
        if count > 0 {
            self.resolved.notify_waiters();
        }
        count
    }

    /// Forget requests resolved more than `max_age` ago. Pending ones are kept.
    pub fn purge_resolved(&self, max_age: Duration) -> usize {
        let mut state = self.lock();
        let stale: Vec<(String, String)> = state
            .requests
            .values()
            .filter(|r| r.settled.is_some_and(|at| at.elapsed() > max_age))
            .map(|r| (r.request_id.clone(), r.task_id.clone()))
            .collect();

        for (request_id, task_id) in &stale {
            state.requests.remove(request_id);
            if let Some(ids) = state.by_task.get_mut(task_id) {
                ids.retain(|id| id != request_id);
                if ids.is_empty() {
                    state.by_task.remove(task_id);
                }
            }
        }
        stale.len()
    }

    pub fn get(&self, request_id: &str) -> Option<ConfirmationRequest> {
        self.lock().requests.get(request_id).cloned()
    }

    /// Pending requests of a task, oldest first.
    pub fn pending_for_task(&self, task_id: &str) -> Vec<ConfirmationRequest> {
        let state = self.lock();
        state
            .by_task
            .get(task_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.requests.get(id))
                    .filter(|r| r.status == ConfirmationStatus::Pending)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The most recent pending request of a task. This is what a bare "ok" answers.
    pub fn latest_pending_for_task(&self, task_id: &str) -> Option<ConfirmationRequest> {
        self.pending_for_task(task_id).pop()
    }

    pub fn pending_count(&self) -> usize {
        self.lock()
            .requests
            .values()
            .filter(|r| r.status == ConfirmationStatus::Pending)
            .count()
    }
}

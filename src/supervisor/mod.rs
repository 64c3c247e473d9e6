//! Agent process lifecycle: spawn into a private process group, reap, and
//! escalate from SIGTERM to SIGKILL on cancellation.

pub mod git;
pub mod launcher;

pub use git::{DiffOutcome, RollbackOutcome};
pub use launcher::{AgentCommand, AgentLauncher};

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};

use crate::error::{RelayError, Result};

/// Lines of stderr kept for the exit report.
const STDERR_TAIL_LINES: usize = 20;

/// How a child ended. Both fields are `None` if the wait itself failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitState {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitState {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Sent on the supervisor's exit channel once a child has been reaped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExit {
    pub task_id: String,
    pub pid: u32,
    pub code: Option<i32>,
    pub signal: Option<i32>,
    pub stderr_tail: String,
}

/// The task's view of its child. The child itself is owned by a monitor task.
#[derive(Debug)]
pub struct ProcessHandle {
    task_id: String,
    pid: u32,
    exit: watch::Receiver<Option<ExitState>>,
}

impl ProcessHandle {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn exit_state(&self) -> Option<ExitState> {
        *self.exit.borrow()
    }

    pub fn has_exited(&self) -> bool {
        self.exit_state().is_some()
    }

    /// Wait until the child is reaped.
    pub async fn wait(&self) -> Option<ExitState> {
        let mut exit = self.exit.clone();
        let state = match exit.wait_for(|state| state.is_some()).await {
            Ok(state) => *state,
            // Monitor gone without publishing; treat as exited.
            Err(_) => None,
        };
        state
    }

    /// Returns false if the child is still running after `timeout`.
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait()).await.is_ok()
    }
}

pub struct Supervisor {
    socket_path: PathBuf,
    reap_timeout: Duration,
    exits: mpsc::UnboundedSender<ProcessExit>,
}

impl Supervisor {
    /// Returns the supervisor and the receiving end of its exit channel.
    pub fn new(
        socket_path: PathBuf,
        reap_timeout: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<ProcessExit>) {
        let (exits, exit_rx) = mpsc::unbounded_channel();
        (
            Self {
                socket_path,
                reap_timeout,
                exits,
            },
            exit_rx,
        )
    }

    /// Spawn the agent for `task_id` in its own process group.
    pub fn start(&self, task_id: &str, command: &AgentCommand, workspace: &Path) -> Result<ProcessHandle> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .current_dir(workspace)
            .env("HOOKRELAY_SESSION_ID", task_id)
            .env("CLAUDE_SESSION_ID", task_id)
            .env("HOOKRELAY_SOCKET", &self.socket_path)
            .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| RelayError::Spawn {
            program: command.program.clone(),
            reason: e.to_string(),
        })?;
        let pid = child.id().ok_or_else(|| RelayError::Spawn {
            program: command.program.clone(),
            reason: "child exited before its pid could be read".into(),
        })?;
        tracing::info!("started task {} as pid {}: {}", task_id, pid, command.display());

        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        let stdout_drain = child
            .stdout
            .take()
            .map(|out| drain(task_id.to_string(), "stdout", out, None));
        let stderr_drain = child
            .stderr
            .take()
            .map(|err| drain(task_id.to_string(), "stderr", err, Some(stderr_tail.clone())));

        let (exit_tx, exit_rx) = watch::channel(None);
        let exits = self.exits.clone();
        let monitor_task_id = task_id.to_string();

        tokio::spawn(async move {
            let state = match child.wait().await {
                Ok(status) => ExitState {
                    code: status.code(),
                    signal: exit_signal(&status),
                },
                Err(e) => {
                    tracing::warn!("waiting on task {} failed: {}", monitor_task_id, e);
                    ExitState {
                        code: None,
                        signal: None,
                    }
                }
            };
            exit_tx.send_replace(Some(state));

            // The pipes close with the process group; give the drains a moment.
            for drain in [stdout_drain, stderr_drain].into_iter().flatten() {
                let _ = tokio::time::timeout(Duration::from_secs(1), drain).await;
            }
            let stderr_tail = stderr_tail
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .iter()
                .cloned()
                .collect::<Vec<String>>()
                .join("\n");

            tracing::info!(
                "task {} exited (code={:?}, signal={:?})",
                monitor_task_id,
                state.code,
                state.signal
            );
            let _ = exits.send(ProcessExit {
                task_id: monitor_task_id,
                pid,
                code: state.code,
                signal: state.signal,
                stderr_tail,
            });
        });

        Ok(ProcessHandle {
            task_id: task_id.to_string(),
            pid,
            exit: exit_rx,
        })
    }

    /// SIGTERM the group, wait `grace_period`, then SIGKILL and wait the reap
    /// timeout. A child that is already gone is a no-op.
    pub async fn terminate(&self, handle: &ProcessHandle, grace_period: Duration) -> Result<()> {
        if handle.has_exited() {
            return Ok(());
        }

        tracing::info!("terminating task {} (pid {})", handle.task_id, handle.pid);
        if !signal_group(handle.pid, Signal::Term) {
            return Ok(());
        }
        if handle.wait_timeout(grace_period).await {
            return Ok(());
        }

        tracing::warn!(
            "task {} ignored SIGTERM for {}s, sending SIGKILL",
            handle.task_id,
            grace_period.as_secs_f64()
        );
        if !signal_group(handle.pid, Signal::Kill) {
            return Ok(());
        }
        if handle.wait_timeout(self.reap_timeout).await {
            return Ok(());
        }

        Err(RelayError::ProcessReapTimeout {
            pid: handle.pid,
            waited_ms: (grace_period + self.reap_timeout).as_millis() as u64,
        })
    }

    /// Discard uncommitted changes in `workspace`.
    pub async fn rollback(&self, workspace: &Path) -> RollbackOutcome {
        git::rollback(workspace).await
    }

    /// Show uncommitted changes in `workspace`.
    pub async fn diff(&self, workspace: &Path, pattern: Option<&str>) -> DiffOutcome {
        git::diff(workspace, pattern).await
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

/// Signal the whole process group led by `pid`. False if the group is gone.
#[cfg(unix)]
fn signal_group(pid: u32, signal: Signal) -> bool {
    let sig = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // Negative pid addresses the process group.
    let ret = unsafe { libc::kill(-(pid as i32), sig) };
    if ret == 0 {
        return true;
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() != Some(libc::ESRCH) {
        tracing::warn!("kill({:?}) on group {} failed: {}", signal, pid, err);
    }
    false
}

#[cfg(not(unix))]
fn signal_group(_pid: u32, _signal: Signal) -> bool {
    false
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

fn drain<R>(
    task_id: String,
    stream: &'static str,
    reader: R,
    tail: Option<Arc<Mutex<VecDeque<String>>>>,
) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!("task {} {}: {}", task_id, stream, line);
            if let Some(tail) = &tail {
                let mut tail = tail.lock().unwrap_or_else(|e| e.into_inner());
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
        }
    })
}

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{RelayError, Result};

/// Top-level orchestrator configuration, loaded from `hookrelay.yml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Unix socket the hooks connect to. Default: `$XDG_RUNTIME_DIR/hookrelay.sock`.
    pub socket_path: PathBuf,

    /// Directory the agent runs in, and the target of rollbacks.
    pub workspace: PathBuf,

    /// Name of the chat plugin to drive the orchestrator with.
    pub chat: String,

    /// Agent launcher plugin and its options.
    pub launcher: LauncherConfig,

    /// How long a confirmation may stay pending. Default: 3600 (one hour).
    pub permission_timeout_secs: u64,

    /// Hook-side sleep between permission polls. Default: 2000.
    pub poll_interval_ms: u64,

    /// Grace period between SIGTERM and SIGKILL. Default: 10.
    pub grace_period_secs: u64,

    /// How long to wait for the reap after SIGKILL. Default: 5.
    pub reap_timeout_secs: u64,

    /// Tasks allowed to be pending, running or waiting at once. Default: 3.
    pub max_concurrent_tasks: usize,

    /// Revert workspace changes when a task is cancelled. Default: true.
    pub auto_rollback: bool,

    /// Longest agent summary forwarded to chat. Default: 3000.
    pub max_output_length: usize,

    /// Idle time after which a chat forgets its agent session. Default: 24.
    pub session_ttl_hours: u64,

    /// How long finished tasks and resolved confirmations stay queryable. Default: 24.
    pub retention_hours: u64,

    /// Housekeeping cadence. Default: 60.
    pub sweep_interval_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            socket_path: super::default_socket_path(),
            workspace: PathBuf::from("."),
            chat: "console".into(),
            launcher: LauncherConfig::default(),
            permission_timeout_secs: 3600,
            poll_interval_ms: 2000,
            grace_period_secs: 10,
            reap_timeout_secs: 5,
            max_concurrent_tasks: 3,
            auto_rollback: true,
            max_output_length: 3000,
            session_ttl_hours: 24,
            retention_hours: 24,
            sweep_interval_secs: 60,
        }
    }
}

/// Which launcher builds the agent command line, and how.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LauncherConfig {
    pub name: String,

    /// Agent executable. Only used by launchers that run a fixed binary.
    pub path: String,

    /// Extra arguments appended after the prompt.
    pub default_args: Vec<String>,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            name: "claude_code".into(),
            path: "claude".into(),
            default_args: Vec::new(),
        }
    }
}

impl RelayConfig {
    /// Load config from a YAML file. Returns defaults if the file doesn't exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&contents).map_err(|e| RelayError::ConfigParse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Resolve the config file and apply env overrides.
    /// Checks the explicit path, then `./hookrelay.yml`, then `~/.config/hookrelay/config.yml`.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut config = match explicit {
            Some(path) => Self::load_from(path)?,
            None => {
                let local = PathBuf::from("hookrelay.yml");
                if local.exists() {
                    Self::load_from(&local)?
                } else {
                    Self::load_from(&super::dirs_global().join("config.yml"))?
                }
            }
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// `HOOKRELAY_SOCKET` and `HOOKRELAY_WORKSPACE` win over the file.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(socket) = std::env::var("HOOKRELAY_SOCKET") {
            self.socket_path = PathBuf::from(socket);
        }
        if let Ok(workspace) = std::env::var("HOOKRELAY_WORKSPACE") {
            self.workspace = PathBuf::from(workspace);
        }
    }

    pub fn permission_timeout(&self) -> Duration {
        Duration::from_secs(self.permission_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn reap_timeout(&self) -> Duration {
        Duration::from_secs(self.reap_timeout_secs)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_hours * 3600)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_hours * 3600)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

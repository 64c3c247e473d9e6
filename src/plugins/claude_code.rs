use crate::config::LauncherConfig;
use crate::supervisor::{AgentCommand, AgentLauncher};

/// Runs one non-interactive turn of the `claude` CLI.
pub struct ClaudeCodeLauncher {
    path: String,
    default_args: Vec<String>,
}

impl ClaudeCodeLauncher {
    pub fn new(config: &LauncherConfig) -> Self {
        Self {
            path: config.path.clone(),
            default_args: config.default_args.clone(),
        }
    }
}

impl AgentLauncher for ClaudeCodeLauncher {
    fn name(&self) -> &str {
        "claude_code"
    }

    fn command(&self, prompt: &str, session_id: &str, resume: bool) -> AgentCommand {
        let session_flag = if resume { "--resume" } else { "--session-id" };
        AgentCommand::new(&self.path)
            .arg("--print")
            .arg(prompt)
            .args(self.default_args.iter().cloned())
            .arg(session_flag)
            .arg(session_id)
    }
}

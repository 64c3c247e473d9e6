use crate::supervisor::{AgentCommand, AgentLauncher};

/// Treats the instruction itself as a shell script. Handy for trying the
/// relay without an agent tool installed.
pub struct ShellLauncher;

impl AgentLauncher for ShellLauncher {
    fn name(&self) -> &str {
        "shell"
    }

    fn command(&self, prompt: &str, _session_id: &str, _resume: bool) -> AgentCommand {
        AgentCommand::new("sh").arg("-c").arg(prompt)
    }
}

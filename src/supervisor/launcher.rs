/// A fully resolved command line for the agent process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentCommand {
    pub program: String,
    pub args: Vec<String>,
    /// Extra environment on top of the session variables the supervisor sets.
    pub env: Vec<(String, String)>,
}

impl AgentCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// `program arg1 arg2`, for logs.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Builds the command line that runs one turn of the agent tool.
pub trait AgentLauncher: Send + Sync {
    fn name(&self) -> &str;

    /// `resume` is true when the session already has history and the tool
    /// should continue it instead of starting fresh.
    fn command(&self, prompt: &str, session_id: &str, resume: bool) -> AgentCommand;
}

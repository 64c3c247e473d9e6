pub mod claude_code;
pub mod console;
pub mod shell;

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::chat::ChatPlatform;
use crate::config::{LauncherConfig, RelayConfig};
use crate::error::{RelayError, Result};
use crate::supervisor::AgentLauncher;

pub type ChatFactory = fn(&RelayConfig) -> Arc<dyn ChatPlatform>;
pub type LauncherFactory = fn(&LauncherConfig) -> Arc<dyn AgentLauncher>;

/// Named chat platforms and agent launchers the binary can be configured with.
pub struct PluginRegistry {
    chats: BTreeMap<&'static str, ChatFactory>,
    launchers: BTreeMap<&'static str, LauncherFactory>,
}

impl PluginRegistry {
    pub fn empty() -> Self {
        Self {
            chats: BTreeMap::new(),
            launchers: BTreeMap::new(),
        }
    }

    /// Everything that ships with the crate.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register_chat("console", console_chat);
        registry.register_launcher("claude_code", claude_code_launcher);
        registry.register_launcher("shell", shell_launcher);
        registry
    }

    pub fn register_chat(&mut self, name: &'static str, factory: ChatFactory) {
        self.chats.insert(name, factory);
    }

    pub fn register_launcher(&mut self, name: &'static str, factory: LauncherFactory) {
        self.launchers.insert(name, factory);
    }

    pub fn chat(&self, config: &RelayConfig) -> Result<Arc<dyn ChatPlatform>> {
        let factory = self
            .chats
            .get(config.chat.as_str())
            .ok_or_else(|| unknown("chat", &config.chat, self.chat_names()))?;
        Ok(factory(config))
    }

    pub fn launcher(&self, config: &LauncherConfig) -> Result<Arc<dyn AgentLauncher>> {
        let factory = self
            .launchers
            .get(config.name.as_str())
            .ok_or_else(|| unknown("launcher", &config.name, self.launcher_names()))?;
        Ok(factory(config))
    }

    pub fn chat_names(&self) -> Vec<&'static str> {
        self.chats.keys().copied().collect()
    }

    pub fn launcher_names(&self) -> Vec<&'static str> {
        self.launchers.keys().copied().collect()
    }
}

fn console_chat(_: &RelayConfig) -> Arc<dyn ChatPlatform> {
    Arc::new(console::ConsoleChat::new())
}

fn claude_code_launcher(config: &LauncherConfig) -> Arc<dyn AgentLauncher> {
    Arc::new(claude_code::ClaudeCodeLauncher::new(config))
}

fn shell_launcher(_: &LauncherConfig) -> Arc<dyn AgentLauncher> {
    Arc::new(shell::ShellLauncher)
}

fn unknown(kind: &'static str, name: &str, available: Vec<&'static str>) -> RelayError {
    RelayError::UnknownPlugin {
        kind,
        name: name.to_string(),
        available: available.join(", "),
    }
}

use crate::config::RelayConfig;
use crate::error::Result;
use crate::orchestrator::Orchestrator;
use crate::plugins::PluginRegistry;

/// Run the orchestrator in the foreground until interrupted.
pub async fn run_serve(config: RelayConfig) -> Result<()> {
    let plugins = PluginRegistry::builtin();
    let chat = plugins.chat(&config)?;
    let launcher = plugins.launcher(&config.launcher)?;

    eprintln!(
        "hookrelay: serving on {} (workspace {})",
        config.socket_path.display(),
        config.workspace.display()
    );
    Orchestrator::new(config, chat, launcher).run().await
}

/// List the registered chat platforms and launchers.
pub fn run_plugins() {
    let plugins = PluginRegistry::builtin();
    println!("chat:");
    for name in plugins.chat_names() {
        println!("  - {}", name);
    }
    println!("launchers:");
    for name in plugins.launcher_names() {
        println!("  - {}", name);
    }
}

/// Print the effective configuration as YAML.
pub fn run_config(config: &RelayConfig) -> Result<()> {
    print!("{}", serde_yaml::to_string(config)?);
    Ok(())
}

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use hookrelay::cli;
use hookrelay::config::RelayConfig;

#[derive(Parser)]
#[command(
    name = "hookrelay",
    version,
    about = "Drive a coding agent from chat, approving sensitive operations remotely"
)]
struct Cli {
    /// Config file (default: ./hookrelay.yml, then ~/.config/hookrelay/config.yml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the orchestrator
    Serve {
        /// Override the socket path
        #[arg(long)]
        socket: Option<PathBuf>,
        /// Override the agent workspace
        #[arg(long)]
        workspace: Option<PathBuf>,
    },
    /// Hook entry points for the agent tool
    Hook {
        #[command(subcommand)]
        event: HookEvent,
    },
    /// List built-in chat platforms and launchers
    Plugins,
    /// Print the effective configuration
    Config,
}

#[derive(Subcommand)]
enum HookEvent {
    /// A tool finished (PostToolUse)
    Progress,
    /// The agent stopped (Stop)
    Stop,
    /// The agent needs approval (PermissionRequest)
    Permission,
    /// The agent wants to tell the user something (Notification)
    Notify,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { socket, workspace } => {
            init_tracing(LevelFilter::INFO);
            let mut config = RelayConfig::load(cli.config.as_deref())
                .context("failed to load configuration")?;
            if let Some(socket) = socket {
                config.socket_path = socket;
            }
            if let Some(workspace) = workspace {
                config.workspace = workspace;
            }
            cli::serve::run_serve(config).await?;
        }
        Commands::Hook { event } => {
            // stdout belongs to the agent tool; keep logging quiet.
            init_tracing(LevelFilter::WARN);
            let config = hook_config(cli.config.as_deref());
            let result = match event {
                HookEvent::Progress => cli::hook::run_progress(&config).await,
                HookEvent::Stop => cli::hook::run_stop(&config).await,
                HookEvent::Permission => cli::hook::run_permission(&config).await,
                HookEvent::Notify => cli::hook::run_notify(&config).await,
            };
            // A failing hook must not break the agent run.
            if let Err(e) = result {
                tracing::warn!("hook failed: {}", e);
            }
        }
        Commands::Plugins => cli::serve::run_plugins(),
        Commands::Config => {
            init_tracing(LevelFilter::WARN);
            let config = RelayConfig::load(cli.config.as_deref())
                .context("failed to load configuration")?;
            cli::serve::run_config(&config)?;
        }
    }

    Ok(())
}

/// Hooks must never fail on a bad config file; fall back to defaults.
fn hook_config(explicit: Option<&std::path::Path>) -> RelayConfig {
    RelayConfig::load(explicit).unwrap_or_else(|e| {
        tracing::warn!("using default config: {}", e);
        let mut config = RelayConfig::default();
        config.apply_env_overrides();
        config
    })
}

/// Logs go to stderr. `HOOKRELAY_LOG` wins over `RUST_LOG`.
fn init_tracing(default: LevelFilter) {
    let builder = EnvFilter::builder().with_default_directive(default.into());
    let env_filter = match std::env::var("HOOKRELAY_LOG") {
        Ok(directives) => builder.parse_lossy(directives),
        Err(_) => builder.from_env_lossy(),
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
}

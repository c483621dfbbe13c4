use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::prelude::*;

use agent_sync::{SyncConfig, SyncPaths};

mod cli;

#[derive(Parser)]
#[command(name = "agent-sync")]
#[command(about = "Stay attached to a long-running agent conversation")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Custom data directory (defaults to ~/.agent-sync)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to a conversation: stdin lines are sent as messages, events
    /// are printed to stdout as JSON lines
    Connect(cli::ConnectArgs),

    /// Inspect or discard stored sessions
    #[command(subcommand)]
    Session(SessionCommand),

    /// Print the effective configuration as TOML
    Config,
}

#[derive(Subcommand)]
enum SessionCommand {
    /// Show a stored session (default: the most recent)
    Show {
        /// Conversation id
        conversation: Option<String>,
    },

    /// Delete a stored session and its queued actions
    Forget {
        /// Conversation id (default: the most recent)
        conversation: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // stdout carries the event stream, so logs go to stderr
    let default_directive = if cli.debug {
        "agent_sync=debug,agent_sync_cli=debug,info"
    } else {
        "agent_sync=info,agent_sync_cli=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    let paths = SyncPaths::new(cli.data_dir).context("failed to prepare data directory")?;
    let (file_config, config) =
        SyncConfig::load(&paths.data_dir).context("failed to load configuration")?;

    match cli.command {
        Commands::Connect(args) => cli::connect_command(&paths, &file_config, config, args).await,
        Commands::Session(SessionCommand::Show { conversation }) => {
            cli::session_show_command(&paths, conversation).await
        }
        Commands::Session(SessionCommand::Forget { conversation }) => {
            cli::session_forget_command(&paths, config, conversation).await
        }
        Commands::Config => cli::config_command(&paths, &file_config),
    }
}

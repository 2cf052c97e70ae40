use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use console::style;
use halyard_core::{agent, config, providers, session};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

mod chat;

const DEFAULT_LOG_FILTER: &str = "warn,halyard_core=info";

#[derive(Parser)]
#[command(name = "halyard")]
#[command(about = "halyard - ask questions about local configs and run helper scripts", long_about = None)]
struct Cli {
    /// Config file (default: ~/.halyard/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start or resume a conversation
    Chat {
        /// Resume this session id instead of starting a new one
        #[arg(short, long)]
        session: Option<String>,

        /// Run a single query and exit
        #[arg(short, long)]
        message: Option<String>,

        /// Keep the conversation in memory only
        #[arg(long)]
        ephemeral: bool,
    },
    /// List stored sessions
    Sessions,
    /// List the tools the agent can call
    Tools,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| DEFAULT_LOG_FILTER.to_string());
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(config::get_config_path);
    let config = config::Config::load_or_default(&config_path)?;

    let command = cli.command.unwrap_or(Commands::Chat {
        session: None,
        message: None,
        ephemeral: false,
    });

    match command {
        Commands::Chat {
            session,
            message,
            ephemeral,
        } => run_chat(&config, session, message, ephemeral).await,
        Commands::Sessions => list_sessions(&config).await.map(|()| ExitCode::SUCCESS),
        Commands::Tools => list_tools(&config).map(|()| ExitCode::SUCCESS),
    }
}

async fn run_chat(
    config: &config::Config,
    session_id: Option<String>,
    message: Option<String>,
    ephemeral: bool,
) -> Result<ExitCode> {
    config.validate().context("Invalid configuration")?;

    let provider = providers::create_provider(config)?;
    let tool_registry = Arc::new(agent::ToolRegistry::discover(config)?);
    let session_store = session::create_session_store(config, ephemeral);

    let context_builder = agent::ContextBuilder::new(&config.configs_dir, &config.scripts_dir)
        .with_max_history(config.max_history);

    let agent_loop = agent::AgentLoop::new(provider, context_builder, tool_registry, session_store)
        .with_model(config.model.clone())
        .with_temperature(config.temperature)
        .with_max_turns(config.max_turns)
        .with_model_timeout(config.model_timeout());

    let session_id = session_id.unwrap_or_else(halyard_core::Session::generate_id);
    let mut session = agent_loop
        .load_session(&session_id)
        .await
        .with_context(|| format!("Could not open session {session_id}"))?;

    match message {
        Some(msg) => {
            if chat::run_once(&agent_loop, &mut session, &msg).await {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::FAILURE)
            }
        }
        None => {
            chat::run_interactive(&agent_loop, &mut session, ephemeral).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn list_sessions(config: &config::Config) -> Result<()> {
    let store = session::create_session_store(config, false);
    let sessions = store.list().await?;

    if sessions.is_empty() {
        println!(
            "{} No sessions in {}",
            style("!").yellow(),
            config.sessions_dir.display()
        );
        return Ok(());
    }

    for info in sessions {
        println!(
            "{}  {}  {}",
            style(&info.id).white().bold(),
            style(info.updated_at.format("%Y-%m-%d %H:%M")).dim(),
            style(format!("{} messages", info.message_count)).dim()
        );
    }
    Ok(())
}

fn list_tools(config: &config::Config) -> Result<()> {
    config.validate().context("Invalid configuration")?;
    let registry = agent::ToolRegistry::discover(config)?;

    for spec in registry.list_tools() {
        println!(
            "{} {}",
            style(&spec.name).white().bold(),
            style(&spec.description).dim()
        );
    }
    Ok(())
}

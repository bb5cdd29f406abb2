// Amber run orchestrator
// Main entry point for the amber binary

use amber_engine::cli::{AgentAction, Cli, Command, WorkspaceAction};
use amber_engine::config::Config;
use amber_engine::handlers::{
    agent_card, handle_agents_add, handle_agents_list, handle_agents_remove,
    handle_agents_run_all, handle_chain, handle_models, handle_run, handle_status,
    handle_workspace_create, handle_workspace_list, handle_workspace_sessions, OutputFormat,
};
use amber_engine::telemetry::init_telemetry_with_level;
use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Determine output format
    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };

    // Load configuration (or use custom path if provided)
    let config = if let Some(config_path) = &cli.config {
        Config::load_from_path(config_path)?
    } else {
        Config::load_or_create()?
    };

    // --log wins over the configured level; RUST_LOG wins over both
    init_telemetry_with_level(cli.log.as_deref().unwrap_or(&config.core.log_level));

    let version = env!("CARGO_PKG_VERSION");
    let commit = env!("GIT_COMMIT_HASH");
    let timestamp = env!("BUILD_TIMESTAMP");

    tracing::info!("Amber v{} ({} - {})", version, commit, timestamp);

    // Handle commands
    match cli.command {
        Command::Run {
            prompt,
            models,
            args,
        } => {
            tracing::info!("Running prompt on {} model(s)", models.len().max(1));
            handle_run(prompt, models, args, &config, format).await
        }

        Command::Chain {
            prompt,
            steps,
            save,
            args,
        } => {
            tracing::info!("Running chain");
            handle_chain(prompt, steps, save, args, &config, format).await
        }

        Command::Agents { action } => {
            tracing::info!("Agent management: {:?}", action);
            match action {
                AgentAction::RunAll { prompt, args } => {
                    handle_agents_run_all(prompt, args, &config, format).await
                }
                AgentAction::List => handle_agents_list(&config, format).await,
                AgentAction::Add {
                    name,
                    model,
                    system,
                    parallel,
                    feed,
                    template,
                } => {
                    let card = agent_card(name, model, system, parallel, feed.into(), template);
                    handle_agents_add(card, &config, format).await
                }
                AgentAction::Remove { name } => handle_agents_remove(name, &config, format).await,
            }
        }

        Command::Models => {
            tracing::info!("Listing models...");
            handle_models(&config, format).await
        }

        Command::Status => {
            tracing::info!("Checking backend status...");
            handle_status(&config, format).await
        }

        Command::Workspace { action } => {
            tracing::info!("Workspace management: {:?}", action);
            match action {
                WorkspaceAction::Create { name, description } => {
                    handle_workspace_create(name, description, &config, format).await
                }
                WorkspaceAction::List => handle_workspace_list(&config, format).await,
                WorkspaceAction::Sessions { name } => {
                    handle_workspace_sessions(name, &config, format).await
                }
            }
        }
    }
}

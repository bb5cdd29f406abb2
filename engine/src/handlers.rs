//! Command handlers for CLI operations
//!
//! Each handler wires configuration, session, backend and orchestrator
//! together for one command and prints the result as text or JSON:
//! - run / chain / agents run-all: execute a request and print its report
//! - agents list / add / remove: manage the saved agent cards
//! - models / status: inspect the backend and saved definitions
//! - workspace create / list / sessions: manage workspaces and saved runs

use anyhow::{bail, Context, Result};
use serde_json::json;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use sdk::types::{AgentCard, AgentExecMode, ChainStep, FeedTarget, RetrievalParams, RunRequest};

use crate::cli::RunArgs;
use crate::config::Config;
use crate::context::{KeywordOverlapScorer, RelevanceScorer};
use crate::llm::ollama::OllamaBackend;
use crate::llm::scripted::ScriptedBackend;
use crate::llm::ModelBackend;
use crate::message_bus::{Event, EventType, MessageBus};
use crate::run::{Orchestrator, RunOutcome, RunReport, RunState, StopSignal, Transcript};
use crate::session::Session;
use crate::store::{DefinitionStore, JsonDefinitionStore, JsonWorkspaceStore};

/// Output format for command results
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output for machine consumption
    Json,
}

/// Run a prompt on one model, or on several side by side
pub async fn handle_run(
    prompt: String,
    models: Vec<String>,
    args: RunArgs,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let models = if models.is_empty() {
        vec![config.backend.default_model.clone()]
    } else {
        models
    };
    let ctx = args.ctx.unwrap_or(config.runs.default_ctx_window);

    let request = if models.len() == 1 {
        RunRequest::single(models[0].clone(), prompt, ctx)
    } else {
        RunRequest::parallel(models, prompt, ctx)
    };
    let loops = args.loops.unwrap_or(config.runs.default_loop_count);

    execute(apply_args(request, &args, config, loops), &args, config, format).await
}

/// Run a prompt through the given pipeline, or the saved one
pub async fn handle_chain(
    prompt: String,
    steps: Vec<ChainStep>,
    save: bool,
    args: RunArgs,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let store = JsonDefinitionStore::new(config.definitions_path());
    let definitions = store.load().context("Failed to load saved definitions")?;

    let steps = if steps.is_empty() {
        definitions.chain_steps.clone()
    } else {
        if save {
            store
                .set_chain(steps.clone())
                .context("Failed to save chain steps")?;
            tracing::info!("Saved {} chain steps", steps.len());
        }
        steps
    };
    if steps.is_empty() {
        bail!("No chain steps given and none saved. Pass --step LABEL=MODEL");
    }

    let ctx = args.ctx.unwrap_or(config.runs.default_ctx_window);
    let loops = resolve_loops(&args, definitions.loop_count, config);
    let request = RunRequest::chain(steps, prompt, ctx);

    execute(apply_args(request, &args, config, loops), &args, config, format).await
}

/// Run every saved agent in registration order
pub async fn handle_agents_run_all(
    prompt: String,
    args: RunArgs,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let store = JsonDefinitionStore::new(config.definitions_path());
    let definitions = store.load().context("Failed to load saved definitions")?;
    if definitions.agents.is_empty() {
        bail!("No agents registered. Add one with 'amber agents add'");
    }

    let ctx = args.ctx.unwrap_or(config.runs.default_ctx_window);
    let loops = resolve_loops(&args, definitions.loop_count, config);
    let request = RunRequest::agents(definitions.agents, prompt, ctx);

    execute(apply_args(request, &args, config, loops), &args, config, format).await
}

/// List saved agent cards
pub async fn handle_agents_list(config: &Config, format: OutputFormat) -> Result<()> {
    let store = JsonDefinitionStore::new(config.definitions_path());
    let definitions = store.load().context("Failed to load saved definitions")?;

    match format {
        OutputFormat::Text => {
            if definitions.agents.is_empty() {
                println!("No agents registered.");
                return Ok(());
            }
            println!("Agents ({}):", definitions.agents.len());
            println!();
            for (i, card) in definitions.agents.iter().enumerate() {
                println!(
                    "  {}. {} [{}] {}, feed: {}",
                    i + 1,
                    card.name,
                    card.model,
                    exec_mode_label(card.mode),
                    feed_label(card.feed)
                );
                if !card.system_prompt.is_empty() {
                    println!("     {}", card.system_prompt);
                }
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&definitions.agents)?);
        }
    }
    Ok(())
}

/// Register an agent card, replacing one with the same name
pub async fn handle_agents_add(card: AgentCard, config: &Config, format: OutputFormat) -> Result<()> {
    let store = JsonDefinitionStore::new(config.definitions_path());
    let name = card.name.clone();
    let definitions = store
        .upsert_agent(card)
        .with_context(|| format!("Failed to save agent '{}'", name))?;

    match format {
        OutputFormat::Text => {
            println!("✓ Agent '{}' saved ({} registered)", name, definitions.agents.len());
        }
        OutputFormat::Json => {
            let output = json!({
                "status": "saved",
                "agent": name,
                "registered": definitions.agents.len()
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }
    Ok(())
}

/// Remove a saved agent card
pub async fn handle_agents_remove(name: String, config: &Config, format: OutputFormat) -> Result<()> {
    let store = JsonDefinitionStore::new(config.definitions_path());
    let removed = store
        .remove_agent(&name)
        .with_context(|| format!("Failed to remove agent '{}'", name))?;

    match format {
        OutputFormat::Text => {
            if removed {
                println!("✓ Agent '{}' removed", name);
            } else {
                println!("No agent named '{}'", name);
            }
        }
        OutputFormat::Json => {
            let output = json!({ "agent": name, "removed": removed });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }
    Ok(())
}

/// List models on the backend
pub async fn handle_models(config: &Config, format: OutputFormat) -> Result<()> {
    let backend = ollama_backend(config)?;
    let models = backend
        .list_models()
        .await
        .with_context(|| format!("Failed to list models at {}", backend.base_url()))?;

    match format {
        OutputFormat::Text => {
            if models.is_empty() {
                println!("No models installed. Pull one with 'ollama pull <model>'.");
            } else {
                println!("Models ({}):", models.len());
                for model in &models {
                    let marker = if *model == config.backend.default_model {
                        " (default)"
                    } else {
                        ""
                    };
                    println!("  {}{}", model, marker);
                }
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&models)?);
        }
    }
    Ok(())
}

/// Show backend health, configuration and saved definitions
pub async fn handle_status(config: &Config, format: OutputFormat) -> Result<()> {
    let backend = ollama_backend(config)?;
    let healthy = backend.check_health().await;

    let definitions_path = config.definitions_path();
    let definitions = JsonDefinitionStore::new(&definitions_path)
        .load()
        .context("Failed to load saved definitions")?;

    match format {
        OutputFormat::Text => {
            println!("Amber Status");
            println!("============================");
            println!();
            println!(
                "  {:<20} {} ({})",
                "Backend:",
                config.backend.base_url,
                if healthy { "reachable" } else { "unreachable" }
            );
            println!("  {:<20} {}", "Default model:", config.backend.default_model);
            println!("  {:<20} {}", "Context window:", config.runs.default_ctx_window);
            println!("  {:<20} {}", "Data directory:", config.core.data_dir.display());
            println!("  {:<20} {}", "Agents:", definitions.agents.len());
            println!("  {:<20} {}", "Chain steps:", definitions.chain_steps.len());

            if !healthy {
                println!();
                println!("⚠ Model server is not reachable. Is Ollama running?");
            }
        }
        OutputFormat::Json => {
            let output = json!({
                "backend": {
                    "url": config.backend.base_url,
                    "healthy": healthy,
                    "default_model": config.backend.default_model
                },
                "default_ctx_window": config.runs.default_ctx_window,
                "data_dir": config.core.data_dir,
                "definitions": definitions_path,
                "agents": definitions.agents.len(),
                "chain_steps": definitions.chain_steps.len()
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }
    Ok(())
}

/// Create a workspace for saving runs
pub async fn handle_workspace_create(
    name: String,
    description: Option<String>,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let store = JsonWorkspaceStore::new(config.workspaces_path());
    let meta = store
        .create(&name, description)
        .with_context(|| format!("Failed to create workspace '{}'", name))?;

    match format {
        OutputFormat::Text => {
            println!("✓ Workspace '{}' created", meta.name);
            println!("  {}", store.root().join(&meta.name).display());
        }
        OutputFormat::Json => {
            let output = json!({
                "status": "created",
                "workspace": meta,
                "path": store.root().join(&meta.name)
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }
    Ok(())
}

/// List workspaces
pub async fn handle_workspace_list(config: &Config, format: OutputFormat) -> Result<()> {
    let store = JsonWorkspaceStore::new(config.workspaces_path());
    let workspaces = store.list().context("Failed to list workspaces")?;

    match format {
        OutputFormat::Text => {
            if workspaces.is_empty() {
                println!("No workspaces. Create one with 'amber workspace create <name>'.");
                return Ok(());
            }
            println!("Workspaces ({}):", workspaces.len());
            for meta in &workspaces {
                println!(
                    "  {:<20} {} session(s)  created {}",
                    meta.name,
                    meta.sessions.len(),
                    meta.created_at.format("%Y-%m-%d %H:%M")
                );
                if let Some(description) = &meta.description {
                    println!("    {}", description);
                }
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&workspaces)?);
        }
    }
    Ok(())
}

/// List the runs saved in a workspace
pub async fn handle_workspace_sessions(
    name: String,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let store = JsonWorkspaceStore::new(config.workspaces_path());
    let sessions = store
        .sessions(&name)
        .with_context(|| format!("Failed to load sessions of workspace '{}'", name))?;

    match format {
        OutputFormat::Text => {
            if sessions.is_empty() {
                println!("No sessions saved in '{}'", name);
                return Ok(());
            }
            println!("Sessions in '{}' ({}):", name, sessions.len());
            for session in &sessions {
                println!(
                    "  {}  {}  {} · {} entr{}",
                    session.session_id,
                    session.saved_at.format("%Y-%m-%d %H:%M:%S"),
                    session.report.outcome,
                    session.report.entries.len(),
                    if session.report.entries.len() == 1 { "y" } else { "ies" }
                );
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&sessions)?);
        }
    }
    Ok(())
}

/// Build an agent card from `agents add` arguments
pub fn agent_card(
    name: String,
    model: String,
    system: String,
    parallel: bool,
    feed: FeedTarget,
    template: Option<String>,
) -> AgentCard {
    let mut card = AgentCard::new(name, model, system).with_feed(feed);
    if parallel {
        card = card.parallel();
    }
    if let Some(template) = template {
        card.template = template;
    }
    card
}

async fn execute(request: RunRequest, args: &RunArgs, config: &Config, format: OutputFormat) -> Result<()> {
    let workspaces = JsonWorkspaceStore::new(config.workspaces_path());
    if let Some(name) = &args.workspace {
        workspaces
            .get(name)
            .with_context(|| format!("Cannot save into workspace '{}'", name))?;
    }

    let scorer: Arc<dyn RelevanceScorer> = Arc::new(KeywordOverlapScorer);
    let session = build_session(config, &args.files, Arc::clone(&scorer)).await?;

    let backend: Arc<dyn ModelBackend> = if args.dry_run {
        Arc::new(ScriptedBackend::new())
    } else {
        Arc::new(ollama_backend(config)?)
    };

    let bus = MessageBus::new();
    let progress = match format {
        OutputFormat::Text => Some(spawn_progress(&bus).await),
        OutputFormat::Json => None,
    };

    let mut orchestrator = Orchestrator::new(backend, config.context.budgeter(scorer), bus);
    let stop = orchestrator.stop_signal();
    let ctrl_c = tokio::spawn(async move {
        if watch_interrupts(tokio::signal::ctrl_c, stop).await {
            tracing::warn!("Interrupted again, exiting without waiting for the backend");
            std::process::exit(130);
        }
    });

    let result = orchestrator.run(&request, &session).await;
    ctrl_c.abort();
    // Drop the bus so the progress printer sees its channel close
    drop(orchestrator);
    if let Some(progress) = progress {
        progress.await.ok();
    }
    let report = result.context("Run could not start")?;

    print_report(&report, format)?;

    if let Some(path) = &args.export {
        export_report(&report, path)?;
    }

    if let Some(name) = &args.workspace {
        let saved = workspaces
            .save_session(name, &request, &report)
            .with_context(|| format!("Failed to save run into workspace '{}'", name))?;
        if format == OutputFormat::Text {
            println!("  Saved as {} in workspace '{}'", saved.session_id, name);
        }
    }

    match report.failure_error() {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}

/// Stop the run on the first interrupt
///
/// Returns true once a second interrupt arrives; handles waiting on a stalled
/// backend never see the first one.
async fn watch_interrupts<F, Fut>(mut next_interrupt: F, stop: StopSignal) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<()>>,
{
    if next_interrupt().await.is_err() {
        return false;
    }
    stop.stop();
    eprintln!("Stopping... press Ctrl-C again to exit");
    next_interrupt().await.is_ok()
}

async fn build_session(
    config: &Config,
    files: &[std::path::PathBuf],
    scorer: Arc<dyn RelevanceScorer>,
) -> Result<Session> {
    let store = config
        .context
        .fractal_store(scorer)
        .context("Invalid context settings")?;
    let mut session = Session::new(Arc::new(store)).with_auto_index(config.context.auto_index);

    for path in files {
        let (name, text) = load_context_file(path)?;
        session.add_file(name, text).await;
    }
    Ok(session)
}

/// Read a plain text or Markdown file for context injection
pub fn load_context_file(path: &Path) -> Result<(String, String)> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    if !matches!(extension.as_deref(), Some("txt") | Some("md")) {
        bail!("Unsupported file {:?}: only .txt and .md files can be injected", path);
    }

    let text = std::fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    Ok((name, text))
}

fn apply_args(request: RunRequest, args: &RunArgs, config: &Config, loops: u32) -> RunRequest {
    let mut request = request
        .with_system_prompt(args.system.clone())
        .with_loop_count(loops);
    request.seed = args.seed;
    request.retrieval = retrieval_override(args, config);
    request
}

/// Per-request retrieval parameters, when any were given
pub fn retrieval_override(args: &RunArgs, config: &Config) -> Option<RetrievalParams> {
    if !args.overrides_retrieval() {
        return None;
    }
    let defaults = config.context.retrieval_params();
    Some(RetrievalParams {
        beam_width: args.beam_width.unwrap_or(defaults.beam_width),
        max_depth: args.max_depth.unwrap_or(defaults.max_depth),
        top_k: args.top_k.unwrap_or(defaults.top_k),
    })
}

/// `--loops`, then a saved loop count above one, then the configured default
fn resolve_loops(args: &RunArgs, saved: u32, config: &Config) -> u32 {
    args.loops
        .or(Some(saved).filter(|&n| n > 1))
        .unwrap_or(config.runs.default_loop_count)
}

fn ollama_backend(config: &Config) -> Result<OllamaBackend> {
    OllamaBackend::new(
        config.backend.base_url.clone(),
        Duration::from_secs(config.backend.request_timeout_secs),
    )
    .context("Failed to create Ollama client")
}

async fn spawn_progress(bus: &MessageBus) -> tokio::task::JoinHandle<()> {
    let mut rx = bus.subscribe(EventType::HandleStateChanged).await;
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if let Event::HandleStateChanged { participant, to, .. } = event {
                match to {
                    RunState::Streaming => eprintln!("▶ {}", participant),
                    RunState::Cancelled => eprintln!("■ {} stopped", participant),
                    RunState::Failed => eprintln!("✗ {} failed", participant),
                    _ => {}
                }
            }
        }
    })
}

fn print_report(report: &RunReport, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => {
            for entry in &report.entries {
                println!();
                println!(
                    "── {} ({}) · step {} · iteration {} ──",
                    entry.participant,
                    entry.model,
                    entry.step_index + 1,
                    entry.iteration
                );
                println!("{}", entry.text);
            }
            for failure in &report.failures {
                println!();
                println!(
                    "✗ {} ({}) failed at step {}: {}",
                    failure.participant,
                    failure.model,
                    failure.step_index + 1,
                    failure.reason
                );
            }

            println!();
            match report.outcome {
                RunOutcome::Completed => println!("✓ Run completed"),
                RunOutcome::Cancelled => println!("■ Run stopped"),
                RunOutcome::Failed { .. } => println!("✗ Run {}", report.outcome),
            }
            let telemetry = &report.telemetry;
            println!(
                "  Tokens: {} in / {} out",
                telemetry.prompt_tokens, telemetry.completion_tokens
            );
            println!(
                "  Rate: {:.1} tok/s average, {:.1} tok/s peak",
                telemetry.average_rate, telemetry.peak_rate
            );
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(report)?);
        }
    }
    Ok(())
}

fn export_report(report: &RunReport, path: &Path) -> Result<()> {
    let mut transcript = Transcript::new();
    for entry in &report.entries {
        transcript.append(entry.clone());
    }

    let is_markdown = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("md"));
    let content = if is_markdown {
        transcript.to_markdown()
    } else {
        transcript.to_json()?
    };

    std::fs::write(path, content).with_context(|| format!("Failed to write transcript to {:?}", path))?;
    tracing::info!("Transcript written to {:?}", path);
    Ok(())
}

fn exec_mode_label(mode: AgentExecMode) -> &'static str {
    match mode {
        AgentExecMode::Sequential => "sequential",
        AgentExecMode::Parallel => "parallel",
    }
}

fn feed_label(feed: FeedTarget) -> &'static str {
    match feed {
        FeedTarget::Next => "next",
        FeedTarget::Scratchpad => "scratchpad",
        FeedTarget::None => "none",
    }
}

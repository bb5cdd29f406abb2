//! CLI interface for Amber
//!
//! Command-line interface built with clap's derive API: one-shot runs in
//! every execution mode, agent card management, workspaces and backend
//! inspection.

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use sdk::types::{ChainStep, FeedTarget};

/// Amber run orchestrator
///
/// Runs prompts against locally hosted models, alone, side by side, as a
/// chain or as a looped set of agents, with file context fitted to the
/// model's context window.
#[derive(Parser, Debug)]
#[command(name = "amber")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log: Option<String>,

    /// Specify alternate configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a prompt on one model, or on several models side by side
    Run {
        /// The prompt to send
        prompt: String,

        /// Model to run; repeat for a parallel run
        #[arg(short, long = "model", value_name = "MODEL")]
        models: Vec<String>,

        #[command(flatten)]
        args: RunArgs,
    },

    /// Run a prompt through a pipeline of models
    Chain {
        /// The seed prompt for the first step
        prompt: String,

        /// Pipeline step as LABEL=MODEL; uses the saved chain when omitted
        #[arg(short, long = "step", value_name = "LABEL=MODEL", value_parser = parse_step)]
        steps: Vec<ChainStep>,

        /// Save the given steps as the default chain
        #[arg(long)]
        save: bool,

        #[command(flatten)]
        args: RunArgs,
    },

    /// Manage and run agent cards
    Agents {
        #[command(subcommand)]
        action: AgentAction,
    },

    /// List models available on the backend
    Models,

    /// Show backend health and saved definitions
    Status,

    /// Manage workspaces and their saved runs
    Workspace {
        #[command(subcommand)]
        action: WorkspaceAction,
    },
}

/// Workspace actions
#[derive(Subcommand, Debug)]
pub enum WorkspaceAction {
    /// Create a workspace
    Create {
        /// Workspace name (letters, digits, '-', '_' or '.')
        name: String,

        /// Short description of the case
        #[arg(short, long)]
        description: Option<String>,
    },

    /// List workspaces
    List,

    /// List the runs saved in a workspace
    Sessions {
        /// Workspace name
        name: String,
    },
}

/// Agent card actions
#[derive(Subcommand, Debug)]
pub enum AgentAction {
    /// Run every registered agent in registration order
    RunAll {
        /// The seed prompt for the first agent
        prompt: String,

        #[command(flatten)]
        args: RunArgs,
    },

    /// List registered agents
    List,

    /// Register an agent, replacing one with the same name
    Add {
        /// Agent name
        name: String,

        /// Model the agent runs on
        #[arg(short, long)]
        model: String,

        /// Role system prompt
        #[arg(short, long, default_value = "")]
        system: String,

        /// Run together with neighbouring parallel agents
        #[arg(long)]
        parallel: bool,

        /// Where the agent's output goes
        #[arg(long, value_enum, default_value_t = FeedArg::Next)]
        feed: FeedArg,

        /// Prompt template; {{input}} and {{scratchpad}} are substituted
        #[arg(long)]
        template: Option<String>,
    },

    /// Remove a registered agent
    Remove {
        /// Agent name
        name: String,
    },
}

/// Options shared by every run command
#[derive(Args, Debug, Default, Clone)]
pub struct RunArgs {
    /// Context window in tokens (defaults to config)
    #[arg(long, value_name = "TOKENS")]
    pub ctx: Option<u32>,

    /// System prompt
    #[arg(long, default_value = "")]
    pub system: String,

    /// Text or Markdown file to inject as context; repeatable
    #[arg(short, long = "file", value_name = "PATH")]
    pub files: Vec<PathBuf>,

    /// Number of times to repeat the run
    #[arg(short, long)]
    pub loops: Option<u32>,

    /// Sampling seed passed to the model
    #[arg(long)]
    pub seed: Option<i64>,

    /// Retrieval: number of chunks injected
    #[arg(long)]
    pub top_k: Option<usize>,

    /// Retrieval: beam width
    #[arg(long)]
    pub beam_width: Option<usize>,

    /// Retrieval: maximum descent depth
    #[arg(long)]
    pub max_depth: Option<usize>,

    /// Use a scripted in-process backend instead of the model server
    #[arg(long)]
    pub dry_run: bool,

    /// Write the transcript to PATH (.md for Markdown, JSON otherwise)
    #[arg(long, value_name = "PATH")]
    pub export: Option<PathBuf>,

    /// Save the request and its report into this workspace
    #[arg(short, long, value_name = "NAME")]
    pub workspace: Option<String>,
}

impl RunArgs {
    /// Whether any retrieval override was given
    pub fn overrides_retrieval(&self) -> bool {
        self.top_k.is_some() || self.beam_width.is_some() || self.max_depth.is_some()
    }
}

/// Feed target as accepted on the command line
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedArg {
    Next,
    Scratchpad,
    None,
}

impl From<FeedArg> for FeedTarget {
    fn from(arg: FeedArg) -> Self {
        match arg {
            FeedArg::Next => FeedTarget::Next,
            FeedArg::Scratchpad => FeedTarget::Scratchpad,
            FeedArg::None => FeedTarget::None,
        }
    }
}

fn parse_step(value: &str) -> Result<ChainStep, String> {
    let (label, model) = value
        .split_once('=')
        .ok_or_else(|| format!("expected LABEL=MODEL, got '{}'", value))?;
    let (label, model) = (label.trim(), model.trim());
    if label.is_empty() || model.is_empty() {
        return Err(format!("expected LABEL=MODEL, got '{}'", value));
    }
    Ok(ChainStep::new(label, model))
}

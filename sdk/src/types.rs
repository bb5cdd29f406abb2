//! Shared data model
//!
//! Files and chunks that feed the context budget, and the run definitions
//! (requests, chain steps, agent cards) that drive the orchestrator.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::EngineError;

/// Placeholder replaced by the running input of a chain step or agent
pub const INPUT_PLACEHOLDER: &str = "{{input}}";

/// Placeholder replaced by the capped scratchpad text
pub const SCRATCHPAD_PLACEHOLDER: &str = "{{scratchpad}}";

/// An ingested file whose extracted text may be injected into prompts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Session-unique identifier
    pub id: String,

    /// Original filename, used in context headers
    pub name: String,

    /// Plain text produced by the extraction pipeline
    pub text: String,

    /// Whether the file participates in context injection
    #[serde(default = "default_true")]
    pub active: bool,
}

impl FileEntry {
    /// Create a new active file entry
    pub fn new(id: impl Into<String>, name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            text: text.into(),
            active: true,
        }
    }

    /// Length of the extracted text in characters
    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }
}

/// A contiguous slice of a file's text
///
/// Spans are character offsets `[start, end)` into the parent file's text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub file_id: String,
    pub ordinal: usize,
    pub start: usize,
    pub end: usize,
    pub text: String,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Beam-search parameters for fractal retrieval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrievalParams {
    pub beam_width: usize,
    pub max_depth: usize,
    pub top_k: usize,
}

impl Default for RetrievalParams {
    fn default() -> Self {
        Self {
            beam_width: 3,
            max_depth: 4,
            top_k: 5,
        }
    }
}

/// Execution mode of a run request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    #[default]
    Single,
    Parallel,
    Chain,
    Agent,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::Single => write!(f, "single"),
            RunMode::Parallel => write!(f, "parallel"),
            RunMode::Chain => write!(f, "chain"),
            RunMode::Agent => write!(f, "agent"),
        }
    }
}

impl std::str::FromStr for RunMode {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "single" => Ok(RunMode::Single),
            "parallel" => Ok(RunMode::Parallel),
            "chain" => Ok(RunMode::Chain),
            "agent" => Ok(RunMode::Agent),
            other => Err(EngineError::InvalidRequest(format!(
                "unknown run mode '{}'",
                other
            ))),
        }
    }
}

/// One step of a chain pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainStep {
    /// Label shown in the transcript
    pub label: String,

    /// Model identifier passed to the backend
    pub model: String,

    /// Prompt template; `{{input}}` receives the previous step's output
    #[serde(default = "default_template")]
    pub template: String,

    /// Overrides the request's system prompt for this step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

impl ChainStep {
    pub fn new(label: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            model: model.into(),
            template: default_template(),
            system_prompt: None,
        }
    }

    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = template.into();
        self
    }
}

/// How an agent card is scheduled relative to its neighbours
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AgentExecMode {
    #[default]
    Sequential,
    Parallel,
}

/// Where an agent's output goes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FeedTarget {
    /// Becomes the input of the next agent
    #[default]
    Next,
    /// Appended to the scratchpad only
    Scratchpad,
    /// Recorded in the transcript only
    None,
}

/// A registered agent definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentCard {
    pub name: String,
    pub model: String,

    /// Role system prompt
    #[serde(default)]
    pub system_prompt: String,

    #[serde(default)]
    pub mode: AgentExecMode,

    #[serde(default)]
    pub feed: FeedTarget,

    #[serde(default = "default_template")]
    pub template: String,
}

impl AgentCard {
    pub fn new(
        name: impl Into<String>,
        model: impl Into<String>,
        system_prompt: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            model: model.into(),
            system_prompt: system_prompt.into(),
            mode: AgentExecMode::Sequential,
            feed: FeedTarget::Next,
            template: default_template(),
        }
    }

    pub fn parallel(mut self) -> Self {
        self.mode = AgentExecMode::Parallel;
        self
    }

    pub fn with_feed(mut self, feed: FeedTarget) -> Self {
        self.feed = feed;
        self
    }
}

/// A complete run request, immutable once the run starts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    pub mode: RunMode,

    /// Models for single and parallel runs, in request order
    #[serde(default)]
    pub models: Vec<String>,

    pub seed_prompt: String,

    /// Context window in tokens (CTX)
    pub ctx_window: u32,

    #[serde(default)]
    pub system_prompt: String,

    #[serde(default)]
    pub steps: Vec<ChainStep>,

    #[serde(default)]
    pub agents: Vec<AgentCard>,

    #[serde(default = "default_loop_count")]
    pub loop_count: u32,

    /// Sampling seed forwarded to the backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,

    /// Overrides the configured retrieval parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retrieval: Option<RetrievalParams>,
}

impl RunRequest {
    /// Create a single-model request
    pub fn single(model: impl Into<String>, prompt: impl Into<String>, ctx_window: u32) -> Self {
        Self::base(RunMode::Single, prompt, ctx_window).with_models(vec![model.into()])
    }

    /// Create a parallel request over the given models
    pub fn parallel(models: Vec<String>, prompt: impl Into<String>, ctx_window: u32) -> Self {
        Self::base(RunMode::Parallel, prompt, ctx_window).with_models(models)
    }

    /// Create a chain request over the given steps
    pub fn chain(steps: Vec<ChainStep>, prompt: impl Into<String>, ctx_window: u32) -> Self {
        let mut request = Self::base(RunMode::Chain, prompt, ctx_window);
        request.steps = steps;
        request
    }

    /// Create an agent-set request over the given cards
    pub fn agents(agents: Vec<AgentCard>, prompt: impl Into<String>, ctx_window: u32) -> Self {
        let mut request = Self::base(RunMode::Agent, prompt, ctx_window);
        request.agents = agents;
        request
    }

    fn base(mode: RunMode, prompt: impl Into<String>, ctx_window: u32) -> Self {
        Self {
            mode,
            models: Vec::new(),
            seed_prompt: prompt.into(),
            ctx_window,
            system_prompt: String::new(),
            steps: Vec::new(),
            agents: Vec::new(),
            loop_count: default_loop_count(),
            seed: None,
            retrieval: None,
        }
    }

    pub fn with_models(mut self, models: Vec<String>) -> Self {
        self.models = models;
        self
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = system_prompt.into();
        self
    }

    pub fn with_loop_count(mut self, loop_count: u32) -> Self {
        self.loop_count = loop_count;
        self
    }

    /// Check the request before any handle is created
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.loop_count == 0 {
            return Err(EngineError::InvalidRequest(
                "loop_count must be at least 1".to_string(),
            ));
        }
        if self.ctx_window == 0 {
            return Err(EngineError::InvalidRequest(
                "ctx_window must be greater than 0".to_string(),
            ));
        }
        if let Some(params) = &self.retrieval {
            if params.beam_width == 0 || params.max_depth == 0 || params.top_k == 0 {
                return Err(EngineError::InvalidRequest(
                    "retrieval parameters must be greater than 0".to_string(),
                ));
            }
        }

        match self.mode {
            RunMode::Single | RunMode::Parallel if self.models.is_empty() => Err(
                EngineError::InvalidRequest(format!("{} run needs at least one model", self.mode)),
            ),
            RunMode::Chain if self.steps.is_empty() => Err(EngineError::InvalidRequest(
                "chain run needs at least one step".to_string(),
            )),
            RunMode::Agent if self.agents.is_empty() => Err(EngineError::InvalidRequest(
                "agent run needs at least one agent card".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

/// Persisted run definitions: agent cards, chain steps and loop count
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunDefinitions {
    /// Agent cards in registration order
    #[serde(default)]
    pub agents: Vec<AgentCard>,

    #[serde(default)]
    pub chain_steps: Vec<ChainStep>,

    #[serde(default = "default_loop_count")]
    pub loop_count: u32,
}

impl Default for RunDefinitions {
    fn default() -> Self {
        Self {
            agents: Vec::new(),
            chain_steps: Vec::new(),
            loop_count: default_loop_count(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_template() -> String {
    INPUT_PLACEHOLDER.to_string()
}

fn default_loop_count() -> u32 {
    1
}

//! Configuration management
//!
//! This module handles loading, validation, and management of the Amber configuration.
//! Configuration is stored in TOML format at ~/.amber/config.toml.
//!
//! # Configuration Sections
//!
//! - **core**: Log level, data directory
//! - **backend**: Model backend endpoint and defaults
//! - **context**: Chunking, fractal index and context budget parameters
//! - **runs**: Run defaults and the definitions file
//!
//! # Path Expansion
//!
//! `~` in `core.data_dir` is expanded to the user's home directory and the
//! directory is created when missing. Relative `runs.definitions_file` and
//! `runs.workspaces_dir` paths are resolved against the data directory.
//!
//! # Examples
//!
//! ```no_run
//! use amber_engine::config::Config;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load_or_create()?;
//! println!("Backend: {}", config.backend.base_url);
//! # Ok(())
//! # }
//! ```

use sdk::errors::EngineError;
use sdk::types::RetrievalParams;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::context::{ContextBudgeter, FractalStore, IndexParams, RelevanceScorer, TextChunker};

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Core engine settings
    pub core: CoreConfig,

    /// Model backend settings
    #[serde(default)]
    pub backend: BackendConfig,

    /// Context pipeline settings
    #[serde(default)]
    pub context: ContextConfig,

    /// Run defaults
    #[serde(default)]
    pub runs: RunsConfig,
}

/// Core engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Data directory path (supports ~ expansion)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Model backend configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Base URL of the Ollama API
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Model used when a command names none
    #[serde(default = "default_model")]
    pub default_model: String,

    /// Whole-request timeout; generous because generation streams
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

/// Context pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Chunk length in characters
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Characters shared by consecutive chunks
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,

    /// Maximum children per fractal node
    #[serde(default = "default_branching_factor")]
    pub branching_factor: usize,

    /// Upper bound on a summary node's digest
    #[serde(default = "default_summary_max_chars")]
    pub summary_max_chars: usize,

    #[serde(default = "default_beam_width")]
    pub beam_width: usize,

    #[serde(default = "default_max_depth")]
    pub max_depth: usize,

    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Characters allotted per context-window token
    #[serde(default = "default_chars_per_token")]
    pub chars_per_token: usize,

    /// Scratchpad cap, clamped to [8000, 20000]
    #[serde(default = "default_scratchpad_max_chars")]
    pub scratchpad_max_chars: usize,

    /// Index files as soon as they are added
    #[serde(default = "default_true")]
    pub auto_index: bool,
}

/// Run defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunsConfig {
    /// Context window in tokens when a command names none
    #[serde(default = "default_ctx_window")]
    pub default_ctx_window: u32,

    #[serde(default = "default_loop_count")]
    pub default_loop_count: u32,

    /// Agent cards and chain steps (relative paths live under data_dir)
    #[serde(default = "default_definitions_file")]
    pub definitions_file: PathBuf,

    /// Workspace folders with saved sessions (relative paths live under data_dir)
    #[serde(default = "default_workspaces_dir")]
    pub workspaces_dir: PathBuf,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("~/.amber")
}

fn default_base_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_model() -> String {
    "llama3.1:8b".to_string()
}

fn default_request_timeout() -> u64 {
    600
}

fn default_chunk_size() -> usize {
    1200
}

fn default_chunk_overlap() -> usize {
    200
}

fn default_branching_factor() -> usize {
    3
}

fn default_summary_max_chars() -> usize {
    512
}

fn default_beam_width() -> usize {
    3
}

fn default_max_depth() -> usize {
    4
}

fn default_top_k() -> usize {
    5
}

fn default_chars_per_token() -> usize {
    3
}

fn default_scratchpad_max_chars() -> usize {
    12_000
}

fn default_ctx_window() -> u32 {
    4096
}

fn default_loop_count() -> u32 {
    1
}

fn default_definitions_file() -> PathBuf {
    PathBuf::from("definitions.json")
}

fn default_workspaces_dir() -> PathBuf {
    PathBuf::from("workspaces")
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            data_dir: default_data_dir(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            default_model: default_model(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            branching_factor: default_branching_factor(),
            summary_max_chars: default_summary_max_chars(),
            beam_width: default_beam_width(),
            max_depth: default_max_depth(),
            top_k: default_top_k(),
            chars_per_token: default_chars_per_token(),
            scratchpad_max_chars: default_scratchpad_max_chars(),
            auto_index: true,
        }
    }
}

impl Default for RunsConfig {
    fn default() -> Self {
        Self {
            default_ctx_window: default_ctx_window(),
            default_loop_count: default_loop_count(),
            definitions_file: default_definitions_file(),
            workspaces_dir: default_workspaces_dir(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            core: CoreConfig::default(),
            backend: BackendConfig::default(),
            context: ContextConfig::default(),
            runs: RunsConfig::default(),
        }
    }
}

impl ContextConfig {
    pub fn retrieval_params(&self) -> RetrievalParams {
        RetrievalParams {
            beam_width: self.beam_width,
            max_depth: self.max_depth,
            top_k: self.top_k,
        }
    }

    pub fn index_params(&self) -> IndexParams {
        IndexParams {
            branching_factor: self.branching_factor,
            summary_max_chars: self.summary_max_chars,
        }
    }

    /// Fractal store built from these settings
    pub fn fractal_store(&self, scorer: Arc<dyn RelevanceScorer>) -> Result<FractalStore, EngineError> {
        let chunker = TextChunker::new(self.chunk_size, self.chunk_overlap)?;
        Ok(FractalStore::new(chunker, self.index_params(), scorer))
    }

    /// Budgeter built from these settings
    pub fn budgeter(&self, scorer: Arc<dyn RelevanceScorer>) -> ContextBudgeter {
        ContextBudgeter::new(
            self.chars_per_token,
            self.retrieval_params(),
            self.scratchpad_max_chars,
            scorer,
        )
    }
}

impl Config {
    /// Load configuration from the default location (~/.amber/config.toml)
    ///
    /// If the configuration file doesn't exist, creates a default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Configuration file cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    pub fn load_or_create() -> Result<Self, EngineError> {
        let config_path = Self::default_config_path()?;
        Self::load_or_create_at(&config_path)
    }

    /// Load the configuration at `path`, writing defaults there if it is missing
    pub fn load_or_create_at(path: &Path) -> Result<Self, EngineError> {
        if path.exists() {
            Self::load_from_path(path)
        } else {
            Self::create_default(path)
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self, EngineError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("Failed to read config file: {}", e)))?;

        let mut config: Config = toml::from_str(&contents)
            .map_err(|e| EngineError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate_and_process()?;

        Ok(config)
    }

    /// Create default configuration and save to path
    fn create_default(path: &Path) -> Result<Self, EngineError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                EngineError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        // Serialize before processing so the file keeps the portable ~ path
        let defaults = Self::default();
        let toml_string = toml::to_string_pretty(&defaults)
            .map_err(|e| EngineError::Config(format!("Failed to serialize config: {}", e)))?;

        fs::write(path, toml_string)
            .map_err(|e| EngineError::Config(format!("Failed to write config file: {}", e)))?;

        let mut config = defaults;
        config.validate_and_process()?;
        Ok(config)
    }

    /// Get the default configuration file path (~/.amber/config.toml)
    pub fn default_config_path() -> Result<PathBuf, EngineError> {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(".amber").join("config.toml"))
    }

    /// Absolute path of the definitions file
    pub fn definitions_path(&self) -> PathBuf {
        if self.runs.definitions_file.is_absolute() {
            self.runs.definitions_file.clone()
        } else {
            self.core.data_dir.join(&self.runs.definitions_file)
        }
    }

    /// Absolute path of the workspaces root
    pub fn workspaces_path(&self) -> PathBuf {
        if self.runs.workspaces_dir.is_absolute() {
            self.runs.workspaces_dir.clone()
        } else {
            self.core.data_dir.join(&self.runs.workspaces_dir)
        }
    }

    /// Validate values, expand paths and create the data directory
    pub fn validate_and_process(&mut self) -> Result<(), EngineError> {
        self.validate()?;

        self.core.data_dir = expand_path(&self.core.data_dir)?;
        if !self.core.data_dir.exists() {
            fs::create_dir_all(&self.core.data_dir).map_err(|e| {
                EngineError::Config(format!("Failed to create data directory: {}", e))
            })?;
        }
        self.core.data_dir = self
            .core
            .data_dir
            .canonicalize()
            .map_err(|e| EngineError::PathCanonicalization(self.core.data_dir.clone(), e.to_string()))?;

        Ok(())
    }

    /// Value checks that touch no filesystem state
    pub fn validate(&self) -> Result<(), EngineError> {
        let valid_log_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_log_levels.contains(&self.core.log_level.as_str()) {
            return Err(EngineError::Config(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.core.log_level,
                valid_log_levels.join(", ")
            )));
        }

        let url = self.backend.base_url.as_str();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(EngineError::Config(format!(
                "backend.base_url '{}' must start with http:// or https://",
                url
            )));
        }
        if self.backend.request_timeout_secs == 0 {
            return Err(EngineError::Config(
                "backend.request_timeout_secs must be greater than 0".to_string(),
            ));
        }

        let ctx = &self.context;
        if ctx.chunk_size == 0 || ctx.chunk_overlap >= ctx.chunk_size {
            return Err(EngineError::Config(format!(
                "context.chunk_size ({}) must be greater than context.chunk_overlap ({})",
                ctx.chunk_size, ctx.chunk_overlap
            )));
        }
        if ctx.branching_factor < 2 {
            return Err(EngineError::Config(
                "context.branching_factor must be at least 2".to_string(),
            ));
        }
        if ctx.beam_width == 0 || ctx.max_depth == 0 || ctx.top_k == 0 {
            return Err(EngineError::Config(
                "context.beam_width, max_depth and top_k must be at least 1".to_string(),
            ));
        }
        if ctx.chars_per_token == 0 {
            return Err(EngineError::Config(
                "context.chars_per_token must be at least 1".to_string(),
            ));
        }

        if self.runs.default_ctx_window == 0 {
            return Err(EngineError::Config(
                "runs.default_ctx_window must be greater than 0".to_string(),
            ));
        }
        if self.runs.default_loop_count == 0 {
            return Err(EngineError::Config(
                "runs.default_loop_count must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

/// Expand ~ in path to user's home directory
fn expand_path(path: &Path) -> Result<PathBuf, EngineError> {
    let path_str = path
        .to_str()
        .ok_or_else(|| EngineError::Config("Invalid UTF-8 in path".to_string()))?;

    if let Some(rest) = path_str.strip_prefix("~/") {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(rest))
    } else if path_str == "~" {
        dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))
    } else {
        Ok(path.to_path_buf())
    }
}

//! Error types and handling
//!
//! This module provides the error types used throughout the Amber engine.
//! All errors implement the `ErrorExt` trait which provides user-friendly
//! hints and indicates whether errors are recoverable.
//!
//! Cancellation by the operator is deliberately absent from this enum: a
//! cancelled run is a normal terminal state, not an error.

use thiserror::Error;

/// Trait for engine error extensions
///
/// Provides additional context for errors: a user-friendly hint and whether
/// the caller can carry on after the error.
pub trait ErrorExt {
    /// Returns a user-friendly hint for the error
    ///
    /// The hint is a static string and never echoes raw backend output.
    fn user_hint(&self) -> &str;

    /// Returns whether the error is recoverable
    ///
    /// Recoverable errors are handled locally or can be retried by the
    /// operator. Non-recoverable errors indicate a broken invariant.
    fn is_recoverable(&self) -> bool;
}

/// Main engine error type
///
/// # Error Categories
///
/// - **Backend**: the model server is unreachable or misbehaves
/// - **Index**: a fractal memory index is missing or empty
/// - **Budget**: the context budget contract was violated
/// - **Request**: the run request or its parameters are invalid
/// - **Run**: a chain or agent step failed
/// - **Configuration / Persistence / IO**: local file problems
///
/// # Examples
///
/// ```
/// use sdk::errors::{EngineError, ErrorExt};
///
/// let error = EngineError::IndexUnavailable("F1".to_string());
/// assert!(error.is_recoverable());
///
/// let fatal = EngineError::BudgetExceeded { len: 12_001, limit: 12_000 };
/// assert!(!fatal.is_recoverable());
/// ```
#[derive(Debug, Error)]
pub enum EngineError {
    // Backend errors
    #[error("Model backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Model backend error: {0}")]
    Backend(String),

    // Retrieval errors
    #[error("Memory index unavailable for file {0}")]
    IndexUnavailable(String),

    #[error("Context budget exceeded: {len} chars > {limit} chars")]
    BudgetExceeded { len: usize, limit: usize },

    // Request errors
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unknown file: {0}")]
    UnknownFile(String),

    #[error("Unknown workspace: {0}")]
    UnknownWorkspace(String),

    // Run errors
    #[error("Step {step_index} failed: {reason}")]
    StepFailed { step_index: usize, reason: String },

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Path canonicalization failed for {0:?}: {1}")]
    PathCanonicalization(std::path::PathBuf, String),

    // Persistence errors
    #[error("Persistence error: {0}")]
    Persistence(String),

    // Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ErrorExt for EngineError {
    fn user_hint(&self) -> &str {
        match self {
            // Backend errors
            Self::BackendUnavailable(_) => "Model server unreachable. Is Ollama running?",
            Self::Backend(_) => "The model server returned an error. Check the model name",

            // Retrieval errors
            Self::IndexUnavailable(_) => "File not indexed yet; using full file text instead",
            Self::BudgetExceeded { .. } => "Internal context budget violation. Please report it",

            // Request errors
            Self::InvalidRequest(_) => "Check the run parameters and try again",
            Self::UnknownFile(_) => "The referenced file is not part of this session",
            Self::UnknownWorkspace(_) => "Create the workspace first with `amber workspace create`",

            // Run errors
            Self::StepFailed { .. } => "A pipeline step failed; later steps were skipped",

            // Configuration errors
            Self::Config(_) => "Check your config.toml file for errors",
            Self::PathCanonicalization(_, _) => "Invalid path specified",

            // Persistence errors
            Self::Persistence(_) => "Saved definitions or sessions could not be read or written",

            // Generic IO error
            Self::Io(_) => "File system operation failed",
        }
    }

    fn is_recoverable(&self) -> bool {
        match self {
            // Non-recoverable errors
            Self::BudgetExceeded { .. } => false,

            // All other errors are potentially recoverable
            _ => true,
        }
    }
}

//! Amber SDK
//!
//! Shared library providing the data model and error types used by the
//! engine and by anything that stores or replays run definitions.

/// Error types and handling
pub mod errors;

/// Files, chunks and run definitions
pub mod types;

// Re-export commonly used types
pub use errors::{EngineError, ErrorExt};
pub use types::{
    AgentCard, AgentExecMode, ChainStep, Chunk, FeedTarget, FileEntry, RetrievalParams,
    RunDefinitions, RunMode, RunRequest,
};

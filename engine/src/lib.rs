//! Amber Engine Library
//!
//! Run orchestration and context budgeting for locally hosted models.
//! Used by the `amber` binary and by integration tests.

/// Configuration management module
pub mod config;

/// Chunking, fractal memory index and context budgeting
pub mod context;

/// Ingested files of an operator session
pub mod session;

/// Model backend abstraction layer
pub mod llm;

/// Run handles, transcript and orchestrator
pub mod run;

/// Message bus for inter-component communication
pub mod message_bus;

/// Definition persistence module
pub mod store;

/// Telemetry and Observability
pub mod telemetry;

/// CLI interface module
pub mod cli;

/// Command handlers module
pub mod handlers;

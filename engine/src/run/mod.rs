//! Run orchestration
//!
//! Run handles, the transcript they feed, and the orchestrator that drives
//! them through single, parallel, chain and agent runs.

pub mod handle;
pub mod orchestrator;
pub mod transcript;

pub use handle::{RunHandle, RunState};
pub use orchestrator::{Orchestrator, RunOutcome, RunReport, StopSignal, TelemetrySnapshot};
pub use transcript::{EntryOutcome, RunFailure, Transcript, TranscriptEntry};

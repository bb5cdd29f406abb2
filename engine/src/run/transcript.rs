//! Transcript
//!
//! Append-only record of finished participants. Entries are written only by
//! the orchestrator: one per handle that completed or was cancelled. Failed
//! handles leave a [`RunFailure`] instead.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

use sdk::errors::EngineError;

use super::handle::{RunHandle, RunState};

/// How a transcript entry ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryOutcome {
    Completed,
    /// Text is whatever had arrived before the stop
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub run_id: String,
    pub participant: String,
    pub model: String,
    pub step_index: usize,
    pub iteration: u32,
    pub input: String,
    pub text: String,
    pub outcome: EntryOutcome,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TranscriptEntry {
    /// Entry for a completed or cancelled handle; `None` otherwise
    pub fn from_handle(handle: &RunHandle) -> Option<Self> {
        let outcome = match handle.state() {
            RunState::Completed => EntryOutcome::Completed,
            RunState::Cancelled => EntryOutcome::Cancelled,
            _ => return None,
        };
        Some(Self {
            run_id: handle.run_id().to_string(),
            participant: handle.participant().to_string(),
            model: handle.model().to_string(),
            step_index: handle.step_index(),
            iteration: handle.iteration(),
            input: handle.input().to_string(),
            text: handle.output().to_string(),
            outcome,
            started_at: handle.started_at(),
            finished_at: handle.finished_at(),
            duration_ms: handle.duration_ms(),
            prompt_tokens: handle.prompt_tokens(),
            completion_tokens: handle.completion_tokens(),
        })
    }
}

/// A failed handle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFailure {
    pub run_id: String,
    pub participant: String,
    pub model: String,
    pub step_index: usize,
    pub iteration: u32,
    pub reason: String,
}

impl RunFailure {
    /// Failure record for a failed handle; `None` otherwise
    pub fn from_handle(handle: &RunHandle) -> Option<Self> {
        (handle.state() == RunState::Failed).then(|| Self {
            run_id: handle.run_id().to_string(),
            participant: handle.participant().to_string(),
            model: handle.model().to_string(),
            step_index: handle.step_index(),
            iteration: handle.iteration(),
            reason: handle.failure().unwrap_or("unknown failure").to_string(),
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Transcript {
    entries: Vec<TranscriptEntry>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn append(&mut self, entry: TranscriptEntry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries produced by one run, in append order
    pub fn for_run<'a>(&'a self, run_id: &'a str) -> impl Iterator<Item = &'a TranscriptEntry> + 'a {
        self.entries.iter().filter(move |e| e.run_id == run_id)
    }

    pub fn to_json(&self) -> Result<String, EngineError> {
        serde_json::to_string_pretty(&self.entries)
            .map_err(|e| EngineError::Persistence(format!("Failed to serialize transcript: {}", e)))
    }

    /// Render as Markdown, one section per entry
    pub fn to_markdown(&self) -> String {
        let mut out = String::from("# Transcript\n");
        for entry in &self.entries {
            let _ = write!(
                out,
                "\n## {} ({}), step {}, iteration {}",
                entry.participant,
                entry.model,
                entry.step_index + 1,
                entry.iteration
            );
            if entry.outcome == EntryOutcome::Cancelled {
                out.push_str(" [cancelled]");
            }
            out.push_str("\n\n");
            if !entry.input.is_empty() {
                out.push_str("**Input**\n\n");
                for line in entry.input.lines() {
                    let _ = writeln!(out, "> {}", line);
                }
                out.push('\n');
            }
            out.push_str(&entry.text);
            out.push('\n');
        }
        out
    }
}

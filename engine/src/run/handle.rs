//! Run Handle
//!
//! One tracked, cancellable model call. A handle moves through
//!
//! ```text
//! PENDING -> STREAMING -> COMPLETED
//!    |           |-----> CANCELLED
//!    |           '-----> FAILED
//!    |-----------------> CANCELLED
//!    '-----------------> FAILED
//! ```
//!
//! Cancellation is only observed when the backend delivers an event; the
//! fragment carried by that event is discarded. Every transition is
//! published on the message bus.

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::llm::{InvokeRequest, LLMError, ModelBackend};
use crate::message_bus::{Event, MessageBus};

/// Lifecycle state of a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Pending,
    Streaming,
    Completed,
    Cancelled,
    Failed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Completed | RunState::Cancelled | RunState::Failed)
    }

    pub fn can_transition_to(self, next: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, next),
            (Pending, Streaming)
                | (Pending, Cancelled)
                | (Pending, Failed)
                | (Streaming, Completed)
                | (Streaming, Cancelled)
                | (Streaming, Failed)
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Pending => "pending",
            RunState::Streaming => "streaming",
            RunState::Completed => "completed",
            RunState::Cancelled => "cancelled",
            RunState::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

/// A single model call within a run
#[derive(Debug)]
pub struct RunHandle {
    id: String,
    run_id: String,
    participant: String,
    model: String,
    step_index: usize,
    iteration: u32,
    input: String,

    state: RunState,
    output: String,
    cancel: CancellationToken,

    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    streaming_secs: f64,

    prompt_tokens: u64,
    completion_tokens: u64,
    rate_samples: Vec<f64>,

    failure: Option<String>,
}

impl RunHandle {
    /// Create a pending handle
    ///
    /// `input` is what was fed to the participant (the running input, not
    /// the assembled prompt) and is kept for the transcript.
    pub fn new(
        run_id: impl Into<String>,
        participant: impl Into<String>,
        model: impl Into<String>,
        input: impl Into<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            run_id: run_id.into(),
            participant: participant.into(),
            model: model.into(),
            step_index: 0,
            iteration: 1,
            input: input.into(),
            state: RunState::Pending,
            output: String::new(),
            cancel,
            started_at: None,
            finished_at: None,
            streaming_secs: 0.0,
            prompt_tokens: 0,
            completion_tokens: 0,
            rate_samples: Vec::new(),
            failure: None,
        }
    }

    /// Position of this call within its run
    pub fn at(mut self, step_index: usize, iteration: u32) -> Self {
        self.step_index = step_index;
        self.iteration = iteration;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn participant(&self) -> &str {
        &self.participant
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn step_index(&self) -> usize {
        self.step_index
    }

    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    pub fn input(&self) -> &str {
        &self.input
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Text accumulated so far
    pub fn output(&self) -> &str {
        &self.output
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    pub fn duration_ms(&self) -> u64 {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => (end - start).num_milliseconds().max(0) as u64,
            _ => 0,
        }
    }

    pub fn prompt_tokens(&self) -> u64 {
        self.prompt_tokens
    }

    pub fn completion_tokens(&self) -> u64 {
        self.completion_tokens
    }

    /// Tokens-per-second samples taken as fragments arrived
    pub fn rate_samples(&self) -> &[f64] {
        &self.rate_samples
    }

    pub fn peak_rate(&self) -> f64 {
        self.rate_samples.iter().copied().fold(0.0, f64::max)
    }

    /// Seconds between start and the terminal event
    pub fn streaming_secs(&self) -> f64 {
        self.streaming_secs
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// Request cancellation; observed on the next backend event
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Run the call to a terminal state and return it
    pub async fn drive(
        &mut self,
        backend: &dyn ModelBackend,
        request: &InvokeRequest,
        bus: &MessageBus,
    ) -> RunState {
        let clock = Instant::now();
        self.started_at = Some(Utc::now());

        if self.cancel.is_cancelled() {
            self.transition(RunState::Cancelled, bus).await;
            return self.finish(clock);
        }

        let mut stream = match backend.invoke(request).await {
            Ok(stream) => stream,
            Err(e) => {
                self.fail(e, bus).await;
                return self.finish(clock);
            }
        };

        let mut fragments: u64 = 0;
        while let Some(item) = stream.next().await {
            if self.cancel.is_cancelled() {
                debug!("Handle {} cancelled, discarding arriving event", self.id);
                self.transition(RunState::Cancelled, bus).await;
                break;
            }

            let event = match item {
                Ok(event) => event,
                Err(e) => {
                    self.fail(e, bus).await;
                    break;
                }
            };

            // Empty keep-alive events do not start streaming
            if self.state == RunState::Pending && (!event.fragment.is_empty() || event.done) {
                self.transition(RunState::Streaming, bus).await;
            }

            if !event.fragment.is_empty() {
                fragments += 1;
                self.completion_tokens = fragments;
                self.output.push_str(&event.fragment);
                let elapsed = clock.elapsed().as_secs_f64();
                if elapsed > 0.001 {
                    self.rate_samples.push(fragments as f64 / elapsed);
                }
                bus.publish(Event::Token {
                    run_id: self.run_id.clone(),
                    handle_id: self.id.clone(),
                    fragment: event.fragment,
                })
                .await;
            }

            if event.done {
                self.prompt_tokens = event.prompt_tokens.unwrap_or(0);
                self.completion_tokens = event.completion_tokens.unwrap_or(fragments);
                self.transition(RunState::Completed, bus).await;
                break;
            }
        }

        if !self.state.is_terminal() {
            self.fail(LLMError::StreamClosed, bus).await;
        }
        // Dropping the stream aborts delivery from the backend.
        drop(stream);
        self.finish(clock)
    }

    fn finish(&mut self, clock: Instant) -> RunState {
        self.streaming_secs = clock.elapsed().as_secs_f64();
        self.finished_at = Some(Utc::now());
        self.state
    }

    async fn fail(&mut self, error: LLMError, bus: &MessageBus) {
        warn!("Handle {} ({}) failed: {}", self.id, self.participant, error);
        self.failure = Some(error.to_string());
        self.transition(RunState::Failed, bus).await;
    }

    async fn transition(&mut self, to: RunState, bus: &MessageBus) {
        let from = self.state;
        if !from.can_transition_to(to) {
            warn!("Ignoring illegal transition {} -> {} on {}", from, to, self.id);
            return;
        }
        self.state = to;
        debug!("Handle {} {} -> {}", self.id, from, to);

        bus.publish(Event::HandleStateChanged {
            run_id: self.run_id.clone(),
            handle_id: self.id.clone(),
            participant: self.participant.clone(),
            from,
            to,
        })
        .await;
    }
}

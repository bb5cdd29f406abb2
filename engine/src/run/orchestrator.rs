//! Orchestrator
//!
//! Accepts a [`RunRequest`], fans it out to run handles according to its
//! mode and records the results in the transcript.
//!
//! - **single / parallel**: one handle per model on the same prompt and the
//!   same context, multiplexed on the calling task; entries are appended in
//!   arrival order.
//! - **chain**: step `i`'s output is the `{{input}}` of step `i + 1`; context
//!   and scratchpad are recomputed per step.
//! - **agent**: cards in registration order; maximal runs of consecutive
//!   parallel cards execute together and their labelled outputs become the
//!   next input.
//!
//! Loop counts repeat the whole sequence, feeding the last output forward.
//! A STOP cancels the active request's token; chain and agent runs check it
//! at every step and iteration boundary and never start a step once stopped.

use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use sdk::errors::EngineError;
use sdk::types::{
    AgentCard, AgentExecMode, FeedTarget, RunMode, RunRequest, INPUT_PLACEHOLDER,
    SCRATCHPAD_PLACEHOLDER,
};

use super::handle::{RunHandle, RunState};
use super::transcript::{RunFailure, Transcript, TranscriptEntry};
use crate::context::{AssembledContext, ContextBudgeter};
use crate::llm::{InvokeRequest, ModelBackend};
use crate::message_bus::{Event, MessageBus};
use crate::session::Session;

/// STOP control for the active request
///
/// Each run arms a fresh token, so a stop issued between runs does not leak
/// into the next one.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    active: Arc<Mutex<CancellationToken>>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel the active request and every live handle under it
    pub fn stop(&self) {
        info!("STOP requested");
        self.current().cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.current().is_cancelled()
    }

    fn arm(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.active.lock().unwrap_or_else(|e| e.into_inner()) = token.clone();
        token
    }

    fn current(&self) -> CancellationToken {
        self.active.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Token and rate counters rolled up over finished handles
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub handles_finished: usize,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    /// Highest tokens/s sample of any handle
    pub peak_rate: f64,
    /// Completion tokens per streaming second
    pub average_rate: f64,
    pub streaming_secs: f64,
}

impl TelemetrySnapshot {
    fn absorb(&mut self, handle: &RunHandle) {
        self.handles_finished += 1;
        self.prompt_tokens += handle.prompt_tokens();
        self.completion_tokens += handle.completion_tokens();
        self.streaming_secs += handle.streaming_secs();
        self.peak_rate = self.peak_rate.max(handle.peak_rate());
        self.average_rate = if self.streaming_secs > 0.0 {
            self.completion_tokens as f64 / self.streaming_secs
        } else {
            0.0
        };
    }
}

/// Final outcome of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum RunOutcome {
    Completed,
    Cancelled,
    /// Points at the first failing step (or model, for fan-out runs)
    Failed { step_index: usize },
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunOutcome::Completed => write!(f, "completed"),
            RunOutcome::Cancelled => write!(f, "cancelled"),
            RunOutcome::Failed { step_index } => write!(f, "failed at step {}", step_index + 1),
        }
    }
}

/// Everything one request produced
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub mode: RunMode,
    pub outcome: RunOutcome,
    pub entries: Vec<TranscriptEntry>,
    pub failures: Vec<RunFailure>,
    pub telemetry: TelemetrySnapshot,
    /// Last forwarded output of a single, chain or agent run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_output: Option<String>,
}

impl RunReport {
    /// The failure record behind a failed outcome
    pub fn failure_error(&self) -> Option<EngineError> {
        match self.outcome {
            RunOutcome::Failed { step_index } => Some(EngineError::StepFailed {
                step_index,
                reason: self
                    .failures
                    .iter()
                    .find(|f| f.step_index == step_index)
                    .map(|f| f.reason.clone())
                    .unwrap_or_default(),
            }),
            _ => None,
        }
    }
}

enum Settled {
    Completed(String),
    Cancelled,
    Failed,
}

struct Call {
    participant: String,
    model: String,
    step_index: usize,
    iteration: u32,
    input: String,
    prompt: String,
    system: String,
}

struct RunScope<'a> {
    run_id: String,
    request: &'a RunRequest,
    session: &'a Session,
    token: CancellationToken,
    entries: Vec<TranscriptEntry>,
    failures: Vec<RunFailure>,
    telemetry: TelemetrySnapshot,
    scratchpad: String,
    final_output: Option<String>,
}

impl RunScope<'_> {
    fn note(&mut self, label: &str, text: &str) {
        if !self.scratchpad.is_empty() {
            self.scratchpad.push_str("\n\n");
        }
        self.scratchpad.push_str(&format!("[{}]\n{}", label, text));
    }
}

/// Drives run requests against a model backend
pub struct Orchestrator {
    backend: Arc<dyn ModelBackend>,
    budgeter: ContextBudgeter,
    bus: MessageBus,
    stop: StopSignal,
    transcript: Transcript,
    telemetry: TelemetrySnapshot,
}

impl Orchestrator {
    pub fn new(backend: Arc<dyn ModelBackend>, budgeter: ContextBudgeter, bus: MessageBus) -> Self {
        Self {
            backend,
            budgeter,
            bus,
            stop: StopSignal::new(),
            transcript: Transcript::new(),
            telemetry: TelemetrySnapshot::default(),
        }
    }

    /// Handle for stopping the active request from another task
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    /// Every entry of every request run so far
    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    /// Telemetry of the active or most recent request
    pub fn telemetry(&self) -> &TelemetrySnapshot {
        &self.telemetry
    }

    /// Execute a request to its outcome
    ///
    /// Invalid requests are rejected before any handle is created. Handle
    /// failures are reported in the returned report, not as errors.
    pub async fn run(&mut self, request: &RunRequest, session: &Session) -> Result<RunReport, EngineError> {
        request.validate()?;

        let mut scope = RunScope {
            run_id: uuid::Uuid::new_v4().to_string(),
            request,
            session,
            token: self.stop.arm(),
            entries: Vec::new(),
            failures: Vec::new(),
            telemetry: TelemetrySnapshot::default(),
            scratchpad: String::new(),
            final_output: None,
        };
        self.telemetry = TelemetrySnapshot::default();

        info!(
            "Run {} started: {} mode, {} loop(s)",
            scope.run_id, request.mode, request.loop_count
        );
        self.bus
            .publish(Event::RunStarted {
                run_id: scope.run_id.clone(),
                mode: request.mode,
            })
            .await;

        let outcome = match request.mode {
            RunMode::Single | RunMode::Parallel => self.run_fanout(&mut scope).await?,
            RunMode::Chain => self.run_chain(&mut scope).await?,
            RunMode::Agent => self.run_agents(&mut scope).await?,
        };

        info!("Run {} {}", scope.run_id, outcome);
        self.bus
            .publish(Event::RunFinished {
                run_id: scope.run_id.clone(),
                outcome,
            })
            .await;

        Ok(RunReport {
            run_id: scope.run_id,
            mode: request.mode,
            outcome,
            entries: scope.entries,
            failures: scope.failures,
            telemetry: scope.telemetry,
            final_output: scope.final_output,
        })
    }

    async fn run_fanout(&mut self, scope: &mut RunScope<'_>) -> Result<RunOutcome, EngineError> {
        let request = scope.request;
        let models = match request.mode {
            RunMode::Single => &request.models[..1],
            _ => &request.models[..],
        };

        let context = self.context_for(scope, &request.seed_prompt).await?;
        let prompt = compose_prompt(&context.text, &request.seed_prompt);

        for iteration in 1..=request.loop_count {
            if self.stop_requested(scope).await {
                return Ok(RunOutcome::Cancelled);
            }

            let calls = models
                .iter()
                .enumerate()
                .map(|(index, model)| Call {
                    participant: model.clone(),
                    model: model.clone(),
                    step_index: index,
                    iteration,
                    input: request.seed_prompt.clone(),
                    prompt: prompt.clone(),
                    system: request.system_prompt.clone(),
                })
                .collect();

            let settled = self.run_concurrent(scope, calls).await;
            if settled.iter().any(|(_, s)| matches!(s, Settled::Cancelled)) {
                return Ok(RunOutcome::Cancelled);
            }
            if let Some(step_index) = first_failed(&settled) {
                return Ok(RunOutcome::Failed { step_index });
            }
            if request.mode == RunMode::Single {
                if let Some((_, Settled::Completed(text))) = settled.into_iter().next() {
                    scope.final_output = Some(text);
                }
            }
        }
        Ok(RunOutcome::Completed)
    }

    async fn run_chain(&mut self, scope: &mut RunScope<'_>) -> Result<RunOutcome, EngineError> {
        let request = scope.request;
        let mut input = request.seed_prompt.clone();

        for iteration in 1..=request.loop_count {
            for (index, step) in request.steps.iter().enumerate() {
                if self.stop_requested(scope).await {
                    return Ok(RunOutcome::Cancelled);
                }

                let context = self.context_for(scope, &input).await?;
                let system = step
                    .system_prompt
                    .clone()
                    .unwrap_or_else(|| request.system_prompt.clone());
                let call = self.build_call(
                    scope,
                    &context,
                    &step.label,
                    &step.model,
                    &step.template,
                    system,
                    &input,
                    (index, iteration),
                );

                match self.run_one(scope, call).await {
                    Settled::Completed(text) => {
                        scope.note(&step.label, &text);
                        input = text;
                    }
                    Settled::Cancelled => return Ok(RunOutcome::Cancelled),
                    Settled::Failed => return Ok(RunOutcome::Failed { step_index: index }),
                }
            }
            debug!("Chain iteration {} finished", iteration);
        }

        scope.final_output = Some(input);
        Ok(RunOutcome::Completed)
    }

    async fn run_agents(&mut self, scope: &mut RunScope<'_>) -> Result<RunOutcome, EngineError> {
        let request = scope.request;
        let groups = group_cards(&request.agents);
        let mut input = request.seed_prompt.clone();

        for iteration in 1..=request.loop_count {
            for group in &groups {
                if self.stop_requested(scope).await {
                    return Ok(RunOutcome::Cancelled);
                }

                let context = self.context_for(scope, &input).await?;
                let calls: Vec<Call> = group
                    .iter()
                    .map(|&(index, card)| {
                        let system = if card.system_prompt.is_empty() {
                            request.system_prompt.clone()
                        } else {
                            card.system_prompt.clone()
                        };
                        self.build_call(
                            scope,
                            &context,
                            &card.name,
                            &card.model,
                            &card.template,
                            system,
                            &input,
                            (index, iteration),
                        )
                    })
                    .collect();

                let parallel = group
                    .first()
                    .is_some_and(|(_, card)| card.mode == AgentExecMode::Parallel);
                let settled = self.run_concurrent(scope, calls).await;

                if settled.iter().any(|(_, s)| matches!(s, Settled::Cancelled)) {
                    return Ok(RunOutcome::Cancelled);
                }
                if let Some(step_index) = first_failed(&settled) {
                    return Ok(RunOutcome::Failed { step_index });
                }

                let mut forwarded = Vec::new();
                for (index, result) in settled {
                    let Settled::Completed(text) = result else {
                        continue;
                    };
                    let card = &request.agents[index];
                    match card.feed {
                        FeedTarget::Next => {
                            scope.note(&card.name, &text);
                            forwarded.push(if parallel {
                                format!("[{}]\n{}", card.name, text)
                            } else {
                                text
                            });
                        }
                        FeedTarget::Scratchpad => scope.note(&card.name, &text),
                        FeedTarget::None => {}
                    }
                }
                if !forwarded.is_empty() {
                    input = forwarded.join("\n\n");
                }
            }
            debug!("Agent iteration {} finished", iteration);
        }

        scope.final_output = Some(input);
        Ok(RunOutcome::Completed)
    }

    async fn context_for(&self, scope: &RunScope<'_>, query: &str) -> Result<AssembledContext, EngineError> {
        self.budgeter
            .assemble(
                scope.session.files(),
                scope.session.store(),
                query,
                scope.request.ctx_window,
                scope.request.retrieval,
            )
            .await
    }

    #[allow(clippy::too_many_arguments)]
    fn build_call(
        &self,
        scope: &RunScope<'_>,
        context: &AssembledContext,
        label: &str,
        model: &str,
        template: &str,
        system: String,
        input: &str,
        (step_index, iteration): (usize, u32),
    ) -> Call {
        let scratchpad = self
            .budgeter
            .cap_scratchpad(&scope.scratchpad, context.remaining());
        let body = render_template(template, input, scratchpad);
        Call {
            participant: label.to_string(),
            model: model.to_string(),
            step_index,
            iteration,
            input: input.to_string(),
            prompt: compose_prompt(&context.text, &body),
            system,
        }
    }

    async fn run_one(&mut self, scope: &mut RunScope<'_>, call: Call) -> Settled {
        self.run_concurrent(scope, vec![call])
            .await
            .into_iter()
            .next()
            .map(|(_, settled)| settled)
            .unwrap_or(Settled::Failed)
    }

    /// Drive the calls together; results come back in arrival order
    async fn run_concurrent(&mut self, scope: &mut RunScope<'_>, calls: Vec<Call>) -> Vec<(usize, Settled)> {
        let mut pending = FuturesUnordered::new();
        for call in calls {
            let handle = RunHandle::new(
                scope.run_id.clone(),
                call.participant,
                call.model.clone(),
                call.input,
                scope.token.child_token(),
            )
            .at(call.step_index, call.iteration);
            let invoke = InvokeRequest::new(call.model, call.prompt, scope.request.ctx_window)
                .with_system(call.system)
                .with_seed(scope.request.seed);
            let backend = Arc::clone(&self.backend);
            let bus = self.bus.clone();

            pending.push(async move {
                let mut handle = handle;
                handle.drive(backend.as_ref(), &invoke, &bus).await;
                handle
            });
        }

        let mut settled = Vec::new();
        while let Some(handle) = pending.next().await {
            let step_index = handle.step_index();
            settled.push((step_index, self.settle(scope, handle).await));
        }
        settled
    }

    /// Record a terminal handle: exactly one entry or one failure
    async fn settle(&mut self, scope: &mut RunScope<'_>, handle: RunHandle) -> Settled {
        scope.telemetry.absorb(&handle);
        self.telemetry = scope.telemetry.clone();

        let settled = match TranscriptEntry::from_handle(&handle) {
            Some(entry) => {
                let settled = if handle.state() == RunState::Completed {
                    Settled::Completed(entry.text.clone())
                } else {
                    Settled::Cancelled
                };
                self.transcript.append(entry.clone());
                self.bus
                    .publish(Event::TranscriptAppended {
                        run_id: scope.run_id.clone(),
                        participant: entry.participant.clone(),
                        model: entry.model.clone(),
                        step_index: entry.step_index,
                        iteration: entry.iteration,
                    })
                    .await;
                scope.entries.push(entry);
                settled
            }
            None => {
                let failure = RunFailure::from_handle(&handle).unwrap_or_else(|| RunFailure {
                    run_id: handle.run_id().to_string(),
                    participant: handle.participant().to_string(),
                    model: handle.model().to_string(),
                    step_index: handle.step_index(),
                    iteration: handle.iteration(),
                    reason: format!("handle ended in state {}", handle.state()),
                });
                warn!(
                    "{} ({}) failed at step {}: {}",
                    failure.participant,
                    failure.model,
                    failure.step_index + 1,
                    failure.reason
                );
                scope.failures.push(failure);
                Settled::Failed
            }
        };

        self.bus
            .publish(Event::TelemetryUpdated {
                run_id: scope.run_id.clone(),
                snapshot: scope.telemetry.clone(),
            })
            .await;
        settled
    }

    /// Step-boundary check; yields first so pending stop requests can land
    async fn stop_requested(&self, scope: &RunScope<'_>) -> bool {
        tokio::task::yield_now().await;
        let stopped = scope.token.is_cancelled();
        if stopped {
            info!("Run {} stopped at a step boundary", scope.run_id);
        }
        stopped
    }
}

/// Group consecutive parallel cards; sequential cards stand alone
fn group_cards(cards: &[AgentCard]) -> Vec<Vec<(usize, &AgentCard)>> {
    let mut groups: Vec<Vec<(usize, &AgentCard)>> = Vec::new();
    for (index, card) in cards.iter().enumerate() {
        let joins_previous = card.mode == AgentExecMode::Parallel
            && groups
                .last()
                .and_then(|g| g.last())
                .is_some_and(|(_, prev)| prev.mode == AgentExecMode::Parallel);
        match groups.last_mut() {
            Some(group) if joins_previous => group.push((index, card)),
            _ => groups.push(vec![(index, card)]),
        }
    }
    groups
}

fn first_failed(settled: &[(usize, Settled)]) -> Option<usize> {
    settled
        .iter()
        .filter(|(_, s)| matches!(s, Settled::Failed))
        .map(|(index, _)| *index)
        .min()
}

/// Substitute `{{input}}` and `{{scratchpad}}` in one pass
///
/// Substituted text is never rescanned, so placeholders inside the input
/// or scratchpad stay literal.
pub fn render_template(template: &str, input: &str, scratchpad: &str) -> String {
    let mut out = String::with_capacity(template.len() + input.len());
    let mut rest = template;
    loop {
        let next_input = rest.find(INPUT_PLACEHOLDER);
        let next_scratch = rest.find(SCRATCHPAD_PLACEHOLDER);
        let (pos, placeholder, value) = match (next_input, next_scratch) {
            (Some(i), Some(s)) if s < i => (s, SCRATCHPAD_PLACEHOLDER, scratchpad),
            (Some(i), _) => (i, INPUT_PLACEHOLDER, input),
            (None, Some(s)) => (s, SCRATCHPAD_PLACEHOLDER, scratchpad),
            (None, None) => break,
        };
        out.push_str(&rest[..pos]);
        out.push_str(value);
        rest = &rest[pos + placeholder.len()..];
    }
    out.push_str(rest);
    out
}

/// File context first, then the prompt body
pub fn compose_prompt(context: &str, body: &str) -> String {
    if context.is_empty() {
        body.to_string()
    } else {
        format!("{}\n\n{}", context, body)
    }
}

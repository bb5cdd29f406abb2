//! Message Bus for run progress
//!
//! The MessageBus provides a pub/sub pattern so UIs, loggers and tests can
//! follow a run without the orchestrator knowing about them. It uses bounded
//! channels to prevent unbounded memory growth and supports both specific
//! event subscriptions and global "All" subscriptions.
//!
//! Publishing never waits on a subscriber: when a subscriber's queue is full
//! the event is dropped for that subscriber with a warning. Dropping the
//! receiver unsubscribes; closed channels are pruned on the next publish.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tracing::warn;

use sdk::types::RunMode;

use crate::run::handle::RunState;
use crate::run::orchestrator::{RunOutcome, TelemetrySnapshot};

/// Channel buffer size for bounded channels
const CHANNEL_BUFFER_SIZE: usize = 100;

/// Event types that can be published on the message bus
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub enum EventType {
    /// A run request was accepted
    RunStarted,
    /// A run handle moved between states
    HandleStateChanged,
    /// A fragment arrived for a streaming handle
    Token,
    /// A transcript entry was appended
    TranscriptAppended,
    /// Request telemetry was rolled up
    TelemetryUpdated,
    /// A run request reached its outcome
    RunFinished,
    /// Subscribe to all event types
    All,
}

/// Events that can be published on the message bus
#[derive(Debug, Clone)]
pub enum Event {
    RunStarted {
        run_id: String,
        mode: RunMode,
    },
    HandleStateChanged {
        run_id: String,
        handle_id: String,
        participant: String,
        from: RunState,
        to: RunState,
    },
    Token {
        run_id: String,
        handle_id: String,
        fragment: String,
    },
    TranscriptAppended {
        run_id: String,
        participant: String,
        model: String,
        step_index: usize,
        iteration: u32,
    },
    TelemetryUpdated {
        run_id: String,
        snapshot: TelemetrySnapshot,
    },
    RunFinished {
        run_id: String,
        outcome: RunOutcome,
    },
}

impl Event {
    /// Get the event type for this event
    pub fn event_type(&self) -> EventType {
        match self {
            Event::RunStarted { .. } => EventType::RunStarted,
            Event::HandleStateChanged { .. } => EventType::HandleStateChanged,
            Event::Token { .. } => EventType::Token,
            Event::TranscriptAppended { .. } => EventType::TranscriptAppended,
            Event::TelemetryUpdated { .. } => EventType::TelemetryUpdated,
            Event::RunFinished { .. } => EventType::RunFinished,
        }
    }
}

/// Message bus for pub/sub communication
#[derive(Clone)]
pub struct MessageBus {
    /// Map of event types to lists of subscribers
    channels: Arc<Mutex<HashMap<EventType, Vec<mpsc::Sender<Event>>>>>,
}

impl MessageBus {
    /// Create a new MessageBus
    pub fn new() -> Self {
        Self {
            channels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Subscribe to a specific event type, or `EventType::All`
    ///
    /// The channel is bounded with CHANNEL_BUFFER_SIZE capacity.
    pub async fn subscribe(&self, event_type: EventType) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
        let mut channels = self.channels.lock().await;
        channels.entry(event_type).or_default().push(tx);
        rx
    }

    /// Publish an event to all subscribers of its type and of `All`
    pub async fn publish(&self, event: Event) {
        let mut channels = self.channels.lock().await;
        let event_type = event.event_type();

        for key in [event_type, EventType::All] {
            if let Some(subscribers) = channels.get_mut(&key) {
                subscribers.retain(|tx| match tx.try_send(event.clone()) {
                    Ok(()) => true,
                    Err(TrySendError::Full(_)) => {
                        warn!("Subscriber queue full, dropping {:?} event", event_type);
                        true
                    }
                    Err(TrySendError::Closed(_)) => false,
                });
            }
        }
    }

    /// Number of live subscriptions across all event types
    pub async fn subscriber_count(&self) -> usize {
        let channels = self.channels.lock().await;
        channels
            .values()
            .flat_map(|subs| subs.iter())
            .filter(|tx| !tx.is_closed())
            .count()
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

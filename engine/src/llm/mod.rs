//! Model Backend Abstraction Layer
//!
//! This module provides a common interface for streaming generations from a
//! model backend. The [`ModelBackend`] trait is the contract run handles drive;
//! [`ollama::OllamaBackend`] talks to a local Ollama server and
//! [`scripted::ScriptedBackend`] replays fixed responses for tests and dry runs.

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

use sdk::errors::EngineError;

pub mod ollama;
pub mod scripted;

/// Result type for backend operations
pub type Result<T> = std::result::Result<T, LLMError>;

/// Errors that can occur while talking to a backend
#[derive(Debug, Clone, thiserror::Error)]
pub enum LLMError {
    #[error("Backend unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Timeout")]
    Timeout,

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Stream closed before completion")]
    StreamClosed,

    #[error("Backend error: {0}")]
    Backend(String),
}

impl From<LLMError> for EngineError {
    fn from(err: LLMError) -> Self {
        match err {
            LLMError::ProviderUnavailable(msg) => EngineError::BackendUnavailable(msg),
            LLMError::Timeout => EngineError::BackendUnavailable("request timed out".to_string()),
            LLMError::InvalidRequest(msg) => EngineError::InvalidRequest(msg),
            other => EngineError::Backend(other.to_string()),
        }
    }
}

/// One generation request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvokeRequest {
    pub model: String,
    pub prompt: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,

    /// Context window in tokens
    pub ctx_window: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
}

impl InvokeRequest {
    pub fn new(model: impl Into<String>, prompt: impl Into<String>, ctx_window: u32) -> Self {
        Self {
            model: model.into(),
            prompt: prompt.into(),
            system: None,
            ctx_window,
            seed: None,
        }
    }

    /// Set the system prompt; empty strings are treated as none
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        let system = system.into();
        self.system = (!system.is_empty()).then_some(system);
        self
    }

    pub fn with_seed(mut self, seed: Option<i64>) -> Self {
        self.seed = seed;
        self
    }
}

/// An event from a streaming generation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenEvent {
    /// Text produced since the previous event (may be empty)
    pub fragment: String,

    /// Set on the final event of a successful generation
    pub done: bool,

    /// Reported on the final event when the backend knows it
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
}

impl TokenEvent {
    pub fn fragment(text: impl Into<String>) -> Self {
        Self {
            fragment: text.into(),
            ..Default::default()
        }
    }

    pub fn done(prompt_tokens: Option<u64>, completion_tokens: Option<u64>) -> Self {
        Self {
            fragment: String::new(),
            done: true,
            prompt_tokens,
            completion_tokens,
        }
    }
}

/// Stream of generation events; dropping it aborts delivery
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<TokenEvent>> + Send>>;

/// Contract every model backend implements
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Short backend name for logs ("ollama", "scripted")
    fn name(&self) -> &str;

    /// Start a streaming generation
    ///
    /// Connection and HTTP-status failures are returned here; failures after
    /// the stream has started arrive as `Err` items on the stream. A stream
    /// that ends without a `done` event is an abnormal close.
    async fn invoke(&self, request: &InvokeRequest) -> Result<TokenStream>;

    /// Models the backend can serve
    async fn list_models(&self) -> Result<Vec<String>>;

    /// Check if the backend is currently reachable
    async fn check_health(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invoke_request_builders() {
        let request = InvokeRequest::new("llama3.1:8b", "hello", 4096)
            .with_system("")
            .with_seed(Some(7));
        assert_eq!(request.system, None);
        assert_eq!(request.seed, Some(7));

        let request = request.with_system("be brief");
        assert_eq!(request.system.as_deref(), Some("be brief"));
    }

    #[test]
    fn test_error_conversion() {
        let err: EngineError = LLMError::ProviderUnavailable("down".to_string()).into();
        assert!(matches!(err, EngineError::BackendUnavailable(_)));

        let err: EngineError = LLMError::Timeout.into();
        assert!(matches!(err, EngineError::BackendUnavailable(_)));

        let err: EngineError = LLMError::StreamClosed.into();
        assert!(matches!(err, EngineError::Backend(_)));
    }

    #[test]
    fn test_token_event_constructors() {
        let event = TokenEvent::fragment("hi");
        assert!(!event.done);
        assert_eq!(event.fragment, "hi");

        let done = TokenEvent::done(Some(3), Some(4));
        assert!(done.done);
        assert!(done.fragment.is_empty());
    }
}

//! Scripted Backend
//!
//! A deterministic in-process backend. Each model replays a fixed list of
//! fragments with a fixed delay before each one, optionally failing before
//! the stream opens or after a number of fragments. Models without a script
//! answer with a short echo so dry runs exercise the whole pipeline.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use super::{InvokeRequest, LLMError, ModelBackend, Result, TokenEvent, TokenStream};

/// Scripted failure of a model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedFailure {
    /// `invoke` fails as if the server were unreachable
    Unavailable,
    /// The stream errors after this many fragments
    AfterFragments(usize),
}

/// Fixed behaviour of one model
#[derive(Debug, Clone, Default)]
pub struct Script {
    pub fragments: Vec<String>,
    pub delay: Duration,
    pub failure: Option<ScriptedFailure>,
}

impl Script {
    pub fn new<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fragments: fragments.into_iter().map(Into::into).collect(),
            delay: Duration::ZERO,
            failure: None,
        }
    }

    /// Delay before every fragment
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing(mut self, failure: ScriptedFailure) -> Self {
        self.failure = Some(failure);
        self
    }
}

/// Deterministic backend for tests and `--dry-run`
#[derive(Debug, Clone, Default)]
pub struct ScriptedBackend {
    scripts: HashMap<String, Script>,
    invocations: Arc<Mutex<Vec<InvokeRequest>>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(mut self, model: impl Into<String>, script: Script) -> Self {
        self.scripts.insert(model.into(), script);
        self
    }

    /// Every request received so far, in call order
    pub async fn invocations(&self) -> Vec<InvokeRequest> {
        self.invocations.lock().await.clone()
    }

    fn script_for(&self, request: &InvokeRequest) -> Script {
        self.scripts.get(&request.model).cloned().unwrap_or_else(|| {
            let words = request.prompt.split_whitespace().count();
            Script::new([
                format!("[{}] ", request.model),
                format!("received {} words", words),
            ])
        })
    }
}

#[async_trait]
impl ModelBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn invoke(&self, request: &InvokeRequest) -> Result<TokenStream> {
        self.invocations.lock().await.push(request.clone());

        let script = self.script_for(request);
        if script.failure == Some(ScriptedFailure::Unavailable) {
            return Err(LLMError::ProviderUnavailable(format!(
                "scripted model {} is unavailable",
                request.model
            )));
        }

        let fail_after = match script.failure {
            Some(ScriptedFailure::AfterFragments(n)) => Some(n),
            _ => None,
        };
        let prompt_tokens = request.prompt.split_whitespace().count() as u64;
        let completion_tokens = script.fragments.len() as u64;

        let stream = futures::stream::unfold(
            (script, 0usize, false),
            move |(script, index, finished)| async move {
                if finished {
                    return None;
                }
                if fail_after == Some(index) {
                    return Some((Err(LLMError::StreamClosed), (script, index, true)));
                }
                if !script.delay.is_zero() {
                    tokio::time::sleep(script.delay).await;
                }
                match script.fragments.get(index) {
                    Some(fragment) => {
                        let event = TokenEvent::fragment(fragment.clone());
                        Some((Ok(event), (script, index + 1, false)))
                    }
                    None => {
                        let event = TokenEvent::done(Some(prompt_tokens), Some(completion_tokens));
                        Some((Ok(event), (script, index, true)))
                    }
                }
            },
        );
        Ok(Box::pin(stream))
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        let mut models: Vec<String> = self.scripts.keys().cloned().collect();
        models.sort();
        Ok(models)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_replays_fragments_then_done() {
        let backend = ScriptedBackend::new().with_script("m1", Script::new(["a", "b"]));
        let stream = backend
            .invoke(&InvokeRequest::new("m1", "one two three", 128))
            .await
            .unwrap();
        let events: Vec<TokenEvent> = stream.map(|e| e.unwrap()).collect().await;

        assert_eq!(events.len(), 3);
        assert_eq!(events[0].fragment, "a");
        assert_eq!(events[1].fragment, "b");
        assert!(events[2].done);
        assert_eq!(events[2].prompt_tokens, Some(3));
        assert_eq!(events[2].completion_tokens, Some(2));
    }

    #[tokio::test]
    async fn test_unavailable_model() {
        let backend = ScriptedBackend::new().with_script(
            "down",
            Script::new(["x"]).failing(ScriptedFailure::Unavailable),
        );
        let result = backend.invoke(&InvokeRequest::new("down", "hi", 128)).await;
        assert!(matches!(result, Err(LLMError::ProviderUnavailable(_))));
    }

    #[tokio::test]
    async fn test_fails_mid_stream() {
        let backend = ScriptedBackend::new().with_script(
            "flaky",
            Script::new(["a", "b", "c"]).failing(ScriptedFailure::AfterFragments(1)),
        );
        let stream = backend
            .invoke(&InvokeRequest::new("flaky", "hi", 128))
            .await
            .unwrap();
        let events: Vec<Result<TokenEvent>> = stream.collect().await;

        assert_eq!(events.len(), 2);
        assert!(events[0].is_ok());
        assert!(matches!(events[1], Err(LLMError::StreamClosed)));
    }

    #[tokio::test]
    async fn test_unscripted_model_echoes() {
        let backend = ScriptedBackend::new();
        let stream = backend
            .invoke(&InvokeRequest::new("any", "count these words", 128))
            .await
            .unwrap();
        let text: String = stream
            .filter_map(|e| async move { e.ok().map(|e| e.fragment) })
            .collect()
            .await;
        assert_eq!(text, "[any] received 3 words");
        assert_eq!(backend.invocations().await.len(), 1);
    }
}

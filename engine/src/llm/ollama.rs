//! Ollama Backend
//!
//! Streams generations from a local Ollama server (typically at
//! http://localhost:11434) through `POST /api/generate`, which answers with
//! newline-delimited JSON objects, and lists models through `GET /api/tags`.

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::time::Duration;

use super::{InvokeRequest, LLMError, ModelBackend, Result, TokenEvent, TokenStream};

/// Ollama backend
#[derive(Debug, Clone)]
pub struct OllamaBackend {
    /// Base URL for Ollama API (typically http://localhost:11434)
    base_url: String,

    /// HTTP client for API requests
    client: Client,
}

impl OllamaBackend {
    /// Create a new Ollama backend
    ///
    /// # Arguments
    /// * `base_url` - Base URL for Ollama API (e.g., "http://localhost:11434")
    /// * `timeout` - Upper bound on a whole generation
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(timeout)
            .build()
            .map_err(|e| LLMError::NetworkError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn map_send_error(&self, e: reqwest::Error) -> LLMError {
        if e.is_timeout() {
            LLMError::Timeout
        } else if e.is_connect() {
            LLMError::ProviderUnavailable(format!(
                "Cannot connect to Ollama at {}. Is Ollama running?",
                self.base_url
            ))
        } else {
            LLMError::NetworkError(e.to_string())
        }
    }
}

#[async_trait]
impl ModelBackend for OllamaBackend {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn invoke(&self, request: &InvokeRequest) -> Result<TokenStream> {
        tracing::debug!(
            "Ollama request: model={}, prompt_chars={}, num_ctx={}",
            request.model,
            request.prompt.chars().count(),
            request.ctx_window
        );

        let body = GenerateRequest {
            model: &request.model,
            prompt: &request.prompt,
            system: request.system.as_deref(),
            stream: true,
            options: GenerateOptions {
                num_ctx: request.ctx_window,
                seed: request.seed,
            },
        };

        let url = format!("{}/api/generate", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(LLMError::ProviderUnavailable(format!(
                "Ollama API error ({}): {}",
                status, error_text
            )));
        }

        Ok(decode_ndjson(Box::pin(response.bytes_stream())))
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        let url = format!("{}/api/tags", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        if !response.status().is_success() {
            return Err(LLMError::ProviderUnavailable(format!(
                "Ollama API error ({})",
                response.status()
            )));
        }

        let tags: TagsResponse = response
            .json()
            .await
            .map_err(|e| LLMError::ParseError(format!("Failed to parse model list: {}", e)))?;

        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }

    async fn check_health(&self) -> bool {
        let url = format!("{}/api/tags", self.base_url);
        match self.client.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::debug!("Ollama health check failed: {}", e);
                false
            }
        }
    }
}

struct NdjsonState<S> {
    bytes: S,
    buffer: Vec<u8>,
    finished: bool,
}

/// Decode an NDJSON byte stream of `/api/generate` objects into token events
///
/// Lines may be split across chunks. The stream ends after the `done`
/// object; ending before it yields a final `StreamClosed` error.
pub fn decode_ndjson<S, B, E>(bytes: S) -> TokenStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + Unpin + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    let state = NdjsonState {
        bytes,
        buffer: Vec::new(),
        finished: false,
    };

    Box::pin(futures::stream::unfold(state, |mut state| async move {
        if state.finished {
            return None;
        }
        loop {
            if let Some(pos) = state.buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = state.buffer.drain(..=pos).collect();
                if let Some(item) = parse_line(&line) {
                    state.finished = item.as_ref().map_or(true, |event| event.done);
                    return Some((item, state));
                }
                continue;
            }

            match state.bytes.next().await {
                Some(Ok(chunk)) => state.buffer.extend_from_slice(chunk.as_ref()),
                Some(Err(e)) => {
                    state.finished = true;
                    return Some((Err(LLMError::NetworkError(e.to_string())), state));
                }
                None => {
                    let rest = std::mem::take(&mut state.buffer);
                    if let Some(item) = parse_line(&rest) {
                        state.finished = item.as_ref().map_or(true, |event| event.done);
                        return Some((item, state));
                    }
                    state.finished = true;
                    return Some((Err(LLMError::StreamClosed), state));
                }
            }
        }
    }))
}

/// `None` for blank lines
fn parse_line(line: &[u8]) -> Option<Result<TokenEvent>> {
    let text = String::from_utf8_lossy(line);
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    let chunk: GenerateChunk = match serde_json::from_str(text) {
        Ok(chunk) => chunk,
        Err(e) => {
            return Some(Err(LLMError::ParseError(format!(
                "Failed to parse Ollama stream line: {}",
                e
            ))))
        }
    };

    if let Some(error) = chunk.error {
        return Some(Err(LLMError::Backend(error)));
    }

    Some(Ok(TokenEvent {
        fragment: chunk.response,
        done: chunk.done,
        prompt_tokens: chunk.prompt_eval_count,
        completion_tokens: chunk.eval_count,
    }))
}

/// Ollama generate request format
#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    num_ctx: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<i64>,
}

/// One line of the generate stream
#[derive(Debug, Deserialize)]
struct GenerateChunk {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    prompt_eval_count: Option<u64>,
    #[serde(default)]
    eval_count: Option<u64>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelTag>,
}

#[derive(Debug, Deserialize)]
struct ModelTag {
    name: String,
}

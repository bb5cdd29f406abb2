//! Integration tests for the Ollama backend
//!
//! A wiremock server stands in for Ollama, so no running instance is
//! needed. Covers NDJSON streaming, model listing and error mapping, and
//! one full orchestrated run over HTTP.

use futures::StreamExt;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use wiremock::{
    matchers::{body_partial_json, method, path},
    Mock, MockServer, ResponseTemplate,
};

use amber_engine::context::{
    ContextBudgeter, FractalStore, IndexParams, KeywordOverlapScorer, RelevanceScorer, TextChunker,
};
use amber_engine::llm::ollama::OllamaBackend;
use amber_engine::llm::{InvokeRequest, LLMError, ModelBackend, TokenEvent};
use amber_engine::message_bus::MessageBus;
use amber_engine::run::{Orchestrator, RunOutcome};
use amber_engine::session::Session;
use sdk::errors::EngineError;
use sdk::types::{RetrievalParams, RunRequest};

fn ndjson(lines: &[serde_json::Value]) -> String {
    lines
        .iter()
        .map(|line| format!("{}\n", line))
        .collect::<String>()
}

fn generate_body(fragments: &[&str]) -> String {
    let mut lines: Vec<serde_json::Value> = fragments
        .iter()
        .map(|f| json!({ "model": "llama3.1:8b", "response": f, "done": false }))
        .collect();
    lines.push(json!({
        "model": "llama3.1:8b",
        "response": "",
        "done": true,
        "prompt_eval_count": 12,
        "eval_count": fragments.len()
    }));
    ndjson(&lines)
}

fn backend(server: &MockServer) -> OllamaBackend {
    OllamaBackend::new(server.uri(), Duration::from_secs(5)).unwrap()
}

#[tokio::test]
async fn test_streams_generate_fragments() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .and(body_partial_json(json!({
            "model": "llama3.1:8b",
            "stream": true,
            "system": "be brief",
            "options": { "num_ctx": 4096, "seed": 42 }
        })))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "application/x-ndjson")
                .set_body_string(generate_body(&["The ", "total ", "is 40."])),
        )
        .mount(&server)
        .await;

    let request = InvokeRequest::new("llama3.1:8b", "What is the total?", 4096)
        .with_system("be brief")
        .with_seed(Some(42));
    let stream = backend(&server).invoke(&request).await.unwrap();
    let events: Vec<TokenEvent> = stream.map(|e| e.unwrap()).collect().await;

    let text: String = events.iter().map(|e| e.fragment.as_str()).collect();
    assert_eq!(text, "The total is 40.");
    let done = events.last().unwrap();
    assert!(done.done);
    assert_eq!(done.prompt_tokens, Some(12));
    assert_eq!(done.completion_tokens, Some(3));
}

#[tokio::test]
async fn test_stream_without_done_is_abnormal_close() {
    let server = MockServer::start().await;
    let body = ndjson(&[json!({ "response": "partial", "done": false })]);
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(&server)
        .await;

    let stream = backend(&server)
        .invoke(&InvokeRequest::new("llama3.1:8b", "hi", 2048))
        .await
        .unwrap();
    let events: Vec<Result<TokenEvent, LLMError>> = stream.collect().await;

    assert_eq!(events.len(), 2);
    assert_eq!(events[0].as_ref().unwrap().fragment, "partial");
    assert!(matches!(events[1], Err(LLMError::StreamClosed)));
}

#[tokio::test]
async fn test_error_line_fails_stream() {
    let server = MockServer::start().await;
    let body = ndjson(&[json!({ "error": "model 'nope' not found" })]);
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(&server)
        .await;

    let mut stream = backend(&server)
        .invoke(&InvokeRequest::new("nope", "hi", 2048))
        .await
        .unwrap();
    match stream.next().await {
        Some(Err(LLMError::Backend(msg))) => assert!(msg.contains("not found")),
        other => panic!("Expected backend error, got {:?}", other.map(|r| r.is_ok())),
    }
}

#[tokio::test]
async fn test_http_error_maps_to_backend_unavailable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let result = backend(&server)
        .invoke(&InvokeRequest::new("llama3.1:8b", "hi", 2048))
        .await;
    let err = match result {
        Err(e) => e,
        Ok(_) => panic!("Expected an error for HTTP 500"),
    };
    assert!(matches!(err, LLMError::ProviderUnavailable(_)));
    assert!(matches!(
        EngineError::from(err),
        EngineError::BackendUnavailable(_)
    ));
}

#[tokio::test]
async fn test_connection_refused_is_unavailable() {
    // Nothing listens on port 9 in the test environment
    let backend = OllamaBackend::new("http://127.0.0.1:9", Duration::from_secs(2)).unwrap();
    let result = backend
        .invoke(&InvokeRequest::new("llama3.1:8b", "hi", 2048))
        .await;

    match result {
        Err(LLMError::ProviderUnavailable(msg)) => assert!(msg.contains("Cannot connect")),
        Err(LLMError::NetworkError(_)) => {}
        Err(other) => panic!("Expected ProviderUnavailable or NetworkError, got {:?}", other),
        Ok(_) => panic!("Expected a connection error"),
    }
    assert!(!backend.check_health().await);
}

#[tokio::test]
async fn test_lists_models() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/tags"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "models": [
                { "name": "llama3.1:8b", "size": 4661224676u64 },
                { "name": "qwen2.5:7b", "size": 4683087332u64 }
            ]
        })))
        .mount(&server)
        .await;

    let backend = backend(&server);
    assert_eq!(
        backend.list_models().await.unwrap(),
        vec!["llama3.1:8b", "qwen2.5:7b"]
    );
    assert!(backend.check_health().await);
}

#[tokio::test]
async fn test_trailing_slash_is_trimmed() {
    let backend = OllamaBackend::new("http://localhost:11434/", Duration::from_secs(5)).unwrap();
    assert_eq!(backend.base_url(), "http://localhost:11434");
    assert_eq!(backend.name(), "ollama");
}

#[tokio::test]
async fn test_orchestrated_single_run_over_http() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(200).set_body_string(generate_body(&["forty ", "euros"])))
        .mount(&server)
        .await;

    let scorer: Arc<dyn RelevanceScorer> = Arc::new(KeywordOverlapScorer);
    let store = FractalStore::new(
        TextChunker::new(1200, 200).unwrap(),
        IndexParams::default(),
        Arc::clone(&scorer),
    );
    let mut session = Session::new(Arc::new(store)).with_auto_index(true);
    session
        .add_file("invoice.txt", "Invoice total: 40 euros, due Friday.")
        .await;

    let budgeter = ContextBudgeter::new(3, RetrievalParams::default(), 12_000, scorer);
    let mut orchestrator = Orchestrator::new(Arc::new(backend(&server)), budgeter, MessageBus::new());

    let request = RunRequest::single("llama3.1:8b", "What is the invoice total?", 4096);
    let report = orchestrator.run(&request, &session).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.entries.len(), 1);
    assert_eq!(report.entries[0].text, "forty euros");
    assert_eq!(report.entries[0].completion_tokens, 2);
    assert_eq!(report.entries[0].prompt_tokens, 12);
    assert_eq!(report.final_output.as_deref(), Some("forty euros"));

    let received = server.received_requests().await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&received[0].body).unwrap();
    let prompt = body["prompt"].as_str().unwrap();
    assert!(prompt.starts_with("[FILE: invoice.txt #0]\nInvoice total"));
    assert!(prompt.ends_with("\n\nWhat is the invoice total?"));
}

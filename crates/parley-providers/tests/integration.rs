//! Provider integration tests: real API calls.
//!
//! These tests are skipped when the corresponding API key env var is not set.
//! Run with: `cargo test -p parley-providers --test integration`

use parley_core::history::ChatMessage;
use parley_providers::{CompletionRequest, Credentials, LlmProvider, OpenAiProvider};
use tokio_stream::StreamExt;

fn openai_key() -> Option<String> {
    std::env::var("OPENAI_API_KEY")
        .ok()
        .filter(|k| !k.is_empty())
}

fn ollama_url() -> Option<String> {
    std::env::var("OLLAMA_URL").ok().filter(|u| !u.is_empty())
}

/// Run a short streaming completion and verify text comes back in pieces.
async fn verify_simple_completion(provider: &dyn LlmProvider, credentials: &Credentials, model: &str) {
    let request = CompletionRequest {
        model: model.to_string(),
        messages: vec![ChatMessage::user("Reply with exactly the word 'hello'.")],
        max_tokens: 50,
        temperature: Some(0.0),
        system: Some("You are a helpful assistant. Follow instructions exactly.".into()),
    };

    let stream = provider.stream(&request, credentials).await;
    assert!(stream.is_ok(), "Stream creation failed: {:?}", stream.err());

    let mut stream = stream.unwrap();
    let mut text = String::new();
    while let Some(chunk) = stream.next().await {
        if let Some(delta) = chunk.expect("Stream chunk error").delta {
            text.push_str(&delta);
        }
    }

    assert!(
        text.to_lowercase().contains("hello"),
        "Expected 'hello' in response, got: {text}"
    );
}

#[tokio::test]
async fn test_openai_streaming() {
    let Some(api_key) = openai_key() else {
        eprintln!("Skipping: OPENAI_API_KEY not set");
        return;
    };

    let provider = OpenAiProvider::openai(None);
    let credentials = Credentials::ApiKey { api_key };

    verify_simple_completion(&provider, &credentials, "gpt-4o-mini").await;
}

#[tokio::test]
async fn test_ollama_streaming() {
    let Some(url) = ollama_url() else {
        eprintln!("Skipping: OLLAMA_URL not set");
        return;
    };

    let provider = OpenAiProvider::ollama(Some(&url));
    verify_simple_completion(&provider, &Credentials::None, "llama3.2").await;
}

#[tokio::test]
async fn test_bad_key_is_an_error() {
    if openai_key().is_none() {
        eprintln!("Skipping: OPENAI_API_KEY not set");
        return;
    }

    let provider = OpenAiProvider::openai(None);
    let credentials = Credentials::ApiKey {
        api_key: "sk-invalid".into(),
    };
    let request = CompletionRequest {
        model: "gpt-4o-mini".into(),
        messages: vec![ChatMessage::user("hi")],
        max_tokens: 5,
        temperature: None,
        system: None,
    };
    assert!(provider.stream(&request, &credentials).await.is_err());
}

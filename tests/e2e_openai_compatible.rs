//! E2E tests for the OpenAI-compatible backend.
//!
//! The live tests require:
//! - OPENAI_API_KEY environment variable set
//! - optional OPENAI_MODEL (defaults to gpt-4o-mini)
//!
//! Run with: cargo test --test e2e_openai_compatible -- --ignored

use std::sync::Arc;
use std::time::Duration;

use edgequake_pipeline::{
    Backend, Client, CompletionOptions, Embedder, MockBackend, OpenAICompatibleBackend,
    OpenAICompatibleConfig, OrchestratorConfig, PipelineError, Request,
};

fn model() -> String {
    std::env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string())
}

#[tokio::test]
async fn test_unreachable_endpoint_falls_back() {
    // Nothing listens on port 9 (discard) on a test machine.
    let dead = OpenAICompatibleBackend::new(
        OpenAICompatibleConfig::new("local", "http://127.0.0.1:9/v1")
            .with_timeout(Duration::from_secs(2)),
    )
    .unwrap();
    let backup = MockBackend::new("backup");
    backup.add_response("from backup");

    let client = Client::builder(OrchestratorConfig::default())
        .backend(Arc::new(dead))
        .backend(Arc::new(backup))
        .build()
        .unwrap();

    let outcome = client
        .generate_with_report(Request::from_prompt("", "llama3", "Hello"))
        .await
        .unwrap();
    assert_eq!(outcome.backend, "backup");
    assert_eq!(outcome.response.text, "from backup");
    assert_eq!(outcome.failures.len(), 1);
    assert!(matches!(
        outcome.failures[0].error,
        PipelineError::BackendUnavailable(_) | PipelineError::Timeout
    ));
}

#[tokio::test]
#[ignore = "Requires OPENAI_API_KEY environment variable"]
async fn test_openai_simple_chat() {
    let backend =
        OpenAICompatibleBackend::new(OpenAICompatibleConfig::openai_from_env().unwrap()).unwrap();
    assert_eq!(Backend::name(&backend), "openai");

    let request = Request::from_prompt(
        "openai",
        model(),
        "What is 2 + 2? Reply with just the number.",
    )
    .with_options(CompletionOptions {
        max_tokens: Some(16),
        temperature: Some(0.0),
        ..Default::default()
    });

    match backend.execute(&request).await {
        Ok(response) => {
            println!("Response: {}", response.text);
            assert!(response.text.contains('4'));
            assert!(response.usage.total() > 0);
            assert!(response.finish_reason.is_some());
        }
        Err(e) => panic!("OpenAI chat failed: {}", e),
    }
}

#[tokio::test]
#[ignore = "Requires OPENAI_API_KEY environment variable"]
async fn test_openai_embeddings() {
    let backend = OpenAICompatibleBackend::new(
        OpenAICompatibleConfig::openai_from_env()
            .unwrap()
            .with_embedding_model("text-embedding-3-small"),
    )
    .unwrap();

    let texts = vec!["first".to_string(), "second".to_string()];
    let vectors = backend.embed(&texts).await.unwrap();
    assert_eq!(vectors.len(), 2);
    assert!(!vectors[0].is_empty());
    assert_eq!(vectors[0].len(), vectors[1].len());
}

#[tokio::test]
#[ignore = "Requires OPENAI_API_KEY environment variable"]
async fn test_openai_rejects_unknown_model_without_fallback() {
    let backend =
        OpenAICompatibleBackend::new(OpenAICompatibleConfig::openai_from_env().unwrap()).unwrap();
    let backup = MockBackend::new("backup");

    let client = Client::builder(OrchestratorConfig::default())
        .backend(Arc::new(backend))
        .backend(Arc::new(backup.clone()))
        .build()
        .unwrap();

    let result = client
        .generate(Request::from_prompt("", "no-such-model-xyz", "Hello"))
        .await;
    assert!(matches!(result, Err(PipelineError::InvalidRequest(_))));
    assert_eq!(backup.call_count(), 0);
}

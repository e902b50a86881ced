//! End-to-end HTTP tests for the LLM client and webhook dispatcher against
//! a real local server, verifying the wire-level request shapes `spec.md`
//! §6 calls out as "must be preserved bit-exact for interoperability" —
//! complementing the scripted-`Transport` unit tests in `llm/client.rs`,
//! which never touch an actual socket.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use mailpilot_core::config::LlmProviderConfig;
use mailpilot_core::llm::client::{LlmClient, PromptContent, ReqwestTransport};
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

fn provider(endpoint: String) -> LlmProviderConfig {
    LlmProviderConfig {
        name: "openai".to_string(),
        endpoint,
        api_key: Some("sk-test-key".to_string()),
        default_model: "gpt-4o-mini".to_string(),
        max_body_tokens: 4000,
        max_thread_tokens: 8000,
        rpm_limit: None,
        supports_vision: false,
    }
}

#[tokio::test]
async fn posts_exact_request_body_and_bearer_header() {
    let server = MockServer::start().await;

    let expected_body = serde_json::json!({
        "model": "gpt-4o-mini",
        "messages": [{"role": "user", "content": "classify this email"}],
        "temperature": 0.3,
        "response_format": {"type": "json_object"},
    });

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("Authorization", "Bearer sk-test-key"))
        .and(body_json(expected_body))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "choices": [{"message": {"content": "{\"actions\":[{\"type\":\"read\"}]}"}}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 4, "total_tokens": 16},
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = LlmClient::new(Arc::new(ReqwestTransport::new()));
    let provider = provider(format!("{}/v1/chat/completions", server.uri()));
    let result = client
        .classify(&provider, "gpt-4o-mini", PromptContent::Text("classify this email".to_string()), 0.3)
        .await
        .expect("classify should succeed");

    assert_eq!(result.actions.len(), 1);
    assert_eq!(result.usage.unwrap().total_tokens, 16);
}

#[tokio::test]
async fn anthropic_host_gets_x_api_key_and_version_header() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(header("x-api-key", "sk-ant-test"))
        .and(header("anthropic-version", "2023-06-01"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "choices": [{"message": {"content": "{\"actions\":[{\"type\":\"noop\"}]}"}}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = LlmClient::new(Arc::new(ReqwestTransport::new()));
    let mut provider = provider(server.uri());
    provider.api_key = Some("sk-ant-test".to_string());
    provider.endpoint = format!("{}/anthropic/v1/messages", server.uri());

    client
        .classify(&provider, "claude", PromptContent::Text("hi".to_string()), 0.3)
        .await
        .expect("classify should succeed");
}

/// Responds 429 (with a zero-second `Retry-After`) on the first call, then
/// 200 with a valid completion on every call after — deterministic instead
/// of relying on mock-priority ordering between two stacked `Mock`s.
struct FlakyThenOk {
    calls: AtomicUsize,
}

impl Respond for FlakyThenOk {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            ResponseTemplate::new(429).insert_header("Retry-After", "0")
        } else {
            ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"content": "{\"actions\":[{\"type\":\"flag\",\"flags\":[\"Important\"]}]}"}}]
            }))
        }
    }
}

#[tokio::test]
async fn retries_429_with_retry_after_then_succeeds() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(FlakyThenOk { calls: AtomicUsize::new(0) })
        .expect(2)
        .mount(&server)
        .await;

    let client = LlmClient::new(Arc::new(ReqwestTransport::new()));
    let provider = provider(server.uri());
    let result = client
        .classify(&provider, "gpt-4o-mini", PromptContent::Text("hi".to_string()), 0.3)
        .await
        .expect("classify should recover from a single 429");

    assert_eq!(result.actions.len(), 1);
    let stats = client.stats(&provider, "gpt-4o-mini").await;
    assert_eq!(stats.requests_total, 1, "only the successful attempt is counted");
}

//! One reliable "classify" call against an LLM provider, `reqwest`-based,
//! with a single contract in place of per-vendor chat adapters.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::LlmProviderConfig;
use crate::llm::error::LlmError;
use crate::llm::parser::parse_and_validate;
use crate::llm::ratelimit::{ProviderHealth, ProviderState, ProviderStats};
use crate::models::{ParsedLlmResult, TokenUsage};

const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(10);
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Serialize)]
pub struct ImageUrl {
    pub url: String,
}

/// One part of a multimodal message, mirroring the OpenAI-style content
/// array wire shape in `spec.md` §6.
#[derive(Debug, Clone)]
pub enum ContentPart {
    Text(String),
    ImageUrl { content_type: String, base64: String },
}

/// Either a plain text prompt or an ordered list of multimodal content
/// parts, built by the prompt builder (`spec.md` §4.5) and consumed here.
#[derive(Debug, Clone)]
pub enum PromptContent {
    Text(String),
    Multimodal(Vec<ContentPart>),
}

fn content_to_json(content: &PromptContent) -> Value {
    match content {
        PromptContent::Text(text) => Value::String(text.clone()),
        PromptContent::Multimodal(parts) => Value::Array(
            parts
                .iter()
                .map(|part| match part {
                    ContentPart::Text(text) => serde_json::json!({"type": "text", "text": text}),
                    ContentPart::ImageUrl { content_type, base64 } => serde_json::json!({
                        "type": "image_url",
                        "image_url": {"url": format!("data:{content_type};base64,{base64}")}
                    }),
                })
                .collect(),
        ),
    }
}

fn build_request_body(model: &str, content: &PromptContent, temperature: f32) -> Value {
    serde_json::json!({
        "model": model,
        "messages": [{"role": "user", "content": content_to_json(content)}],
        "temperature": temperature,
        "response_format": {"type": "json_object"},
    })
}

/// Auth header selection per `spec.md` §4.6 step 3: `Bearer` by default,
/// Anthropic's `x-api-key`/`anthropic-version` pair for Anthropic hosts,
/// Azure's `api-key` header for Azure hosts, nothing when no key is set.
fn build_headers(provider: &LlmProviderConfig) -> Vec<(String, String)> {
    let mut headers = vec![("Content-Type".to_string(), "application/json".to_string())];
    let Some(key) = provider.api_key.as_ref().filter(|k| !k.is_empty()) else {
        return headers;
    };
    let host = url::Url::parse(&provider.endpoint)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_string()))
        .unwrap_or_default();

    if host.contains("anthropic") {
        headers.push(("x-api-key".to_string(), key.clone()));
        headers.push(("anthropic-version".to_string(), "2023-06-01".to_string()));
    } else if host.contains("azure") {
        headers.push(("api-key".to_string(), key.clone()));
    } else {
        headers.push(("Authorization".to_string(), format!("Bearer {key}")));
    }
    headers
}

#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

/// Seam between [`LlmClient`] and the HTTP stack — in production
/// `ReqwestTransport`, in tests an in-process fake.
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    async fn post_json(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: Value,
    ) -> Result<TransportResponse, LlmError>;
}

#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self { client: reqwest::Client::new() }
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn post_json(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: Value,
    ) -> Result<TransportResponse, LlmError> {
        let mut request = self.client.post(url).json(&body);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        let response = request
            .send()
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
            .collect();
        let body = response
            .text()
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))?;
        Ok(TransportResponse { status, headers, body })
    }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn parse_retry_after(headers: &[(String, String)]) -> Duration {
    find_header(headers, "retry-after")
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_RETRY_AFTER)
}

#[derive(Deserialize)]
struct ChatCompletion {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: String,
}

#[derive(Deserialize)]
struct ChatUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

fn parse_completion(body: &str) -> ParsedLlmResult {
    let completion: ChatCompletion = match serde_json::from_str(body) {
        Ok(c) => c,
        Err(e) => {
            warn!("LLM response was not a recognizable chat completion: {e}");
            return ParsedLlmResult::noop("LLM response could not be read");
        }
    };
    let Some(choice) = completion.choices.into_iter().next() else {
        return ParsedLlmResult::noop("LLM response had no choices");
    };
    let mut result = parse_and_validate(&choice.message.content);
    if let Some(usage) = completion.usage {
        result.usage = Some(TokenUsage {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
        });
    }
    result
}

/// Owns the shared map of provider -> rate-limit/health state (`spec.md`
/// §3 "Ownership") and exposes the single `Classify` contract.
pub struct LlmClient {
    transport: Arc<dyn Transport>,
    providers: DashMap<String, Arc<ProviderState>>,
}

impl LlmClient {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport, providers: DashMap::new() }
    }

    fn state_for(&self, provider: &LlmProviderConfig) -> Arc<ProviderState> {
        self.providers
            .entry(provider.name.clone())
            .or_insert_with(|| Arc::new(ProviderState::new(&provider.name, provider.rpm_limit)))
            .clone()
    }

    pub async fn health(&self, provider_name: &str) -> Option<ProviderHealth> {
        let state = self.providers.get(provider_name)?.clone();
        Some(state.health().await)
    }

    pub async fn stats(&self, provider: &LlmProviderConfig, model: &str) -> ProviderStats {
        self.state_for(provider).stats(model).await
    }

    /// Implements `spec.md` §4.6 steps 1-7 end to end: admission, request
    /// build, auth headers, transport, retry, and on success, parsing.
    pub async fn classify(
        &self,
        provider: &LlmProviderConfig,
        model: &str,
        content: PromptContent,
        temperature: f32,
    ) -> Result<ParsedLlmResult, LlmError> {
        let state = self.state_for(provider);
        let headers = build_headers(provider);
        let body = build_request_body(model, &content, temperature);

        let mut last_error: Option<LlmError> = None;

        for attempt in 0..MAX_ATTEMPTS {
            state.acquire().await;

            let outcome = self.transport.post_json(&provider.endpoint, &headers, body.clone()).await;
            match outcome {
                Ok(resp) if (200..300).contains(&resp.status) => {
                    state.record_request().await;
                    state.record_success().await;
                    return Ok(parse_completion(&resp.body));
                }
                Ok(resp) if resp.status == 429 => {
                    let delay = parse_retry_after(&resp.headers);
                    state.park_until(delay).await;
                    last_error = Some(LlmError::RateLimited(delay));
                }
                Ok(resp) if (500..600).contains(&resp.status) => {
                    last_error = Some(LlmError::Transient { status: resp.status, body: resp.body });
                }
                Ok(resp) => {
                    state.record_failure().await;
                    return Err(LlmError::NonRetryable { status: resp.status, body: resp.body });
                }
                Err(e) => {
                    last_error = Some(e);
                }
            }

            if attempt + 1 < MAX_ATTEMPTS {
                let backoff = BACKOFF_BASE.saturating_mul(1u32 << attempt).min(BACKOFF_CAP);
                debug!("retrying classify for provider '{}' after {:?}", provider.name, backoff);
                tokio::time::sleep(backoff).await;
            }
        }

        state.record_failure().await;
        let source = last_error.unwrap_or_else(|| LlmError::Transport("no response received".into()));
        Err(LlmError::Exhausted { provider: provider.name.clone(), source: Box::new(source) })
    }
}

impl std::fmt::Debug for LlmClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmClient").field("providers", &self.providers.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct ScriptedTransport {
        responses: Vec<TransportResponse>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn post_json(
            &self,
            _url: &str,
            _headers: &[(String, String)],
            _body: Value,
        ) -> Result<TransportResponse, LlmError> {
            let idx = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.responses[idx.min(self.responses.len() - 1)].clone())
        }
    }

    fn provider() -> LlmProviderConfig {
        LlmProviderConfig {
            name: "openai".to_string(),
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            api_key: Some("sk-test".to_string()),
            default_model: "gpt-4o-mini".to_string(),
            max_body_tokens: 4000,
            max_thread_tokens: 8000,
            rpm_limit: None,
            supports_vision: false,
        }
    }

    #[tokio::test]
    async fn retries_after_rate_limit_then_succeeds() {
        let transport = Arc::new(ScriptedTransport {
            responses: vec![
                TransportResponse {
                    status: 429,
                    headers: vec![("Retry-After".to_string(), "0".to_string())],
                    body: String::new(),
                },
                TransportResponse {
                    status: 200,
                    headers: vec![],
                    body: r#"{"choices":[{"message":{"content":"{\"actions\":[{\"type\":\"read\"}]}"}}],"usage":{"prompt_tokens":10,"completion_tokens":5,"total_tokens":15}}"#.to_string(),
                },
            ],
            calls: AtomicUsize::new(0),
        });
        let client = LlmClient::new(transport);
        let result = client
            .classify(&provider(), "gpt-4o-mini", PromptContent::Text("hi".into()), 0.3)
            .await
            .unwrap();
        assert_eq!(result.actions.len(), 1);
        let stats = client.stats(&provider(), "gpt-4o-mini").await;
        assert_eq!(stats.requests_total, 1);
    }

    #[tokio::test]
    async fn non_retryable_error_stops_immediately() {
        let transport = Arc::new(ScriptedTransport {
            responses: vec![TransportResponse { status: 401, headers: vec![], body: "bad key".into() }],
            calls: AtomicUsize::new(0),
        });
        let client = LlmClient::new(transport);
        let err = client
            .classify(&provider(), "gpt-4o-mini", PromptContent::Text("hi".into()), 0.3)
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::NonRetryable { status: 401, .. }));
    }
}

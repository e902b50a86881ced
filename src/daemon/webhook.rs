//! Webhook dispatcher: fire-and-forget concurrent POSTs per subscribed event.

use log::warn;
use serde::Serialize;
use serde_json::Value;

use crate::config::{WebhookEvent, WebhookSubscription};
use crate::models::Action;

#[derive(Debug, Clone, Serialize)]
pub struct WebhookPayload {
    pub event: WebhookEvent,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actions: Option<Vec<Action>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl WebhookPayload {
    pub fn new(event: WebhookEvent) -> Self {
        Self {
            event,
            timestamp: chrono::Utc::now(),
            account: None,
            error: None,
            message_id: None,
            actions: None,
            llm_provider: None,
            reason: None,
        }
    }

    pub fn with_account(mut self, account: impl Into<String>) -> Self {
        self.account = Some(account.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    pub fn with_actions(mut self, actions: Vec<Action>) -> Self {
        self.actions = Some(actions);
        self
    }

    pub fn with_llm_provider(mut self, provider: impl Into<String>) -> Self {
        self.llm_provider = Some(provider.into());
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Dispatches a payload to every subscription whose event list contains this
/// payload's event, concurrently, best-effort (`spec.md` §4.11).
pub struct WebhookDispatcher {
    client: reqwest::Client,
}

impl WebhookDispatcher {
    pub fn new() -> Self {
        Self { client: reqwest::Client::new() }
    }

    pub async fn dispatch(&self, subscriptions: &[WebhookSubscription], payload: WebhookPayload) {
        let body: Value = match serde_json::to_value(&payload) {
            Ok(v) => v,
            Err(e) => {
                warn!("failed to serialize webhook payload: {e}");
                return;
            }
        };

        let targets: Vec<&WebhookSubscription> =
            subscriptions.iter().filter(|s| s.events.contains(&payload.event)).collect();

        let sends = targets.into_iter().map(|sub| self.post_one(sub, body.clone()));
        futures::future::join_all(sends).await;
    }

    async fn post_one(&self, subscription: &WebhookSubscription, body: Value) {
        let mut request = self.client.post(&subscription.url).json(&body);
        for (name, value) in &subscription.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        match request.send().await {
            Ok(response) if !response.status().is_success() => {
                warn!("webhook POST to {} returned {}", subscription.url, response.status());
            }
            Err(e) => {
                warn!("webhook POST to {} failed: {e}", subscription.url);
            }
            Ok(_) => {}
        }
    }
}

impl Default for WebhookDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_omits_unset_optional_fields() {
        let payload = WebhookPayload::new(WebhookEvent::Startup);
        let value = serde_json::to_value(&payload).unwrap();
        assert!(value.get("account").is_none());
        assert_eq!(value["event"], "startup");
    }

    #[test]
    fn payload_includes_set_fields() {
        let payload = WebhookPayload::new(WebhookEvent::ActionTaken)
            .with_account("personal")
            .with_message_id("<1@example.com>")
            .with_actions(vec![Action::Read { reason: None }]);
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["account"], "personal");
        assert_eq!(value["actions"][0]["type"], "read");
    }
}

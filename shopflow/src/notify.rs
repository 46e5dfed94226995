//! Outbound notifications.
//!
//! Notifications are fire-and-forget: a notifier logs delivery failures and
//! never reports them to the caller.

use crate::errors::{Result, ShopflowError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

/// A Slack-compatible message body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Plain-text summary, shown where blocks are not rendered.
    pub text: String,
    /// Rich layout blocks.
    #[serde(default)]
    pub blocks: Vec<Value>,
}

impl Notification {
    /// Creates a notification with a header section.
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        let text = text.into();
        let blocks = vec![section(&text)];
        Self { text, blocks }
    }

    /// Appends a markdown section block.
    #[must_use]
    pub fn with_section(mut self, markdown: impl AsRef<str>) -> Self {
        self.blocks.push(section(markdown.as_ref()));
        self
    }
}

fn section(markdown: &str) -> Value {
    json!({
        "type": "section",
        "text": {"type": "mrkdwn", "text": markdown}
    })
}

/// Delivers notifications to operators.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Sends one notification. Never fails.
    async fn notify(&self, notification: &Notification);
}

/// Notifier used when no webhook is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, notification: &Notification) {
        debug!(text = %notification.text, "Notification dropped, no webhook configured");
    }
}

/// Posts notifications as JSON to a webhook URL.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    /// Creates a notifier with a request timeout.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ShopflowError::config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, notification: &Notification) {
        let response = match self.client.post(&self.url).json(notification).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "Failed to deliver notification");
                return;
            }
        };

        let status = response.status();
        if status.is_success() {
            debug!(status = status.as_u16(), "Notification delivered");
        } else {
            warn!(status = status.as_u16(), "Webhook rejected notification");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_notification_blocks() {
        let notification = Notification::new("Refresh failed").with_section("*tenant:* acme");

        assert_eq!(notification.blocks.len(), 2);
        assert_eq!(notification.blocks[1]["text"]["text"], "*tenant:* acme");
    }

    #[tokio::test]
    async fn test_webhook_posts_text_and_blocks() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(body_partial_json(json!({"text": "Pipeline failed"})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let notifier = WebhookNotifier::new(format!("{}/hook", server.uri()), Duration::from_secs(5)).unwrap();
        notifier.notify(&Notification::new("Pipeline failed")).await;
    }

    #[tokio::test]
    async fn test_webhook_failure_is_swallowed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&server)
            .await;

        let notifier = WebhookNotifier::new(server.uri(), Duration::from_secs(5)).unwrap();
        notifier.notify(&Notification::new("x")).await;

        let unreachable = WebhookNotifier::new("http://127.0.0.1:9/hook", Duration::from_millis(200)).unwrap();
        unreachable.notify(&Notification::new("x")).await;
    }
}

//! Notification channel delivering progress lines to a chat thread.

use crate::cloud::{CloudError, CloudResult};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Post `text`, optionally as a reply in `thread_ts`. Returns the handle
    /// of the posted message, or `None` when the channel is disabled.
    async fn post_message(&self, channel_id: &str, text: &str, thread_ts: Option<&str>) -> CloudResult<Option<String>>;

    async fn add_reaction(&self, channel_id: &str, name: &str, message_ts: &str) -> CloudResult<()>;
}

/// Channel used when notifications are switched off
#[derive(Debug, Default, Clone)]
pub struct DisabledChannel;

#[async_trait]
impl NotificationChannel for DisabledChannel {
    async fn post_message(&self, _channel_id: &str, text: &str, _thread_ts: Option<&str>) -> CloudResult<Option<String>> {
        debug!(text = %text, "Notifications disabled; message not sent");
        Ok(None)
    }

    async fn add_reaction(&self, _channel_id: &str, _name: &str, _message_ts: &str) -> CloudResult<()> {
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct SlackResponse {
    ok: bool,
    #[serde(default)]
    ts: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Slack Web API client
#[derive(Debug, Clone)]
pub struct SlackChannel {
    http: reqwest::Client,
    api_base_url: String,
    token: String,
}

impl SlackChannel {
    const SERVICE: &'static str = "slack";

    pub fn new(http: reqwest::Client, api_base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http,
            api_base_url: api_base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    async fn call(&self, method: &str, body: serde_json::Value) -> CloudResult<SlackResponse> {
        let url = format!("{}/{}", self.api_base_url, method);
        debug!(url = %url, "Calling Slack API");

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| CloudError::transport(Self::SERVICE, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(CloudError::Http {
                service: Self::SERVICE.to_string(),
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }

        let parsed: SlackResponse = response
            .json()
            .await
            .map_err(|e| CloudError::invalid_response(Self::SERVICE, e.to_string()))?;
        if !parsed.ok {
            return Err(CloudError::invalid_response(
                Self::SERVICE,
                parsed.error.unwrap_or_else(|| "unknown_error".to_string()),
            ));
        }
        Ok(parsed)
    }
}

#[async_trait]
impl NotificationChannel for SlackChannel {
    async fn post_message(&self, channel_id: &str, text: &str, thread_ts: Option<&str>) -> CloudResult<Option<String>> {
        let mut body = json!({ "channel": channel_id, "text": text });
        if let Some(thread_ts) = thread_ts {
            body["thread_ts"] = json!(thread_ts);
        }
        let response = self.call("chat.postMessage", body).await?;
        info!(channel = %channel_id, "Slack message sent");
        Ok(response.ts)
    }

    async fn add_reaction(&self, channel_id: &str, name: &str, message_ts: &str) -> CloudResult<()> {
        let body = json!({ "channel": channel_id, "name": name, "timestamp": message_ts });
        self.call("reactions.add", body).await?;
        info!(channel = %channel_id, reaction = %name, "Slack reaction sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disabled_channel_has_no_thread() {
        let channel = DisabledChannel;
        assert_eq!(channel.post_message("C1", "hello", None).await.unwrap(), None);
        assert!(channel.add_reaction("C1", "tada", "1.0").await.is_ok());
    }

    #[test]
    fn test_base_url_is_normalized() {
        let channel = SlackChannel::new(reqwest::Client::new(), "https://slack.com/api/", "xoxb");
        assert_eq!(channel.api_base_url, "https://slack.com/api");
    }
}

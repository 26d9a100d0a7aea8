//! Slack channel — posts to a channel through the Web API.
//!
//! Every send starts with an `auth.test` self-check of the bot token; a
//! failed check is reported as a send failure for that message only.

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde::Deserialize;

use crate::channels::{Channel, MessageRef};
use crate::config::ChatChannelSettings;
use crate::decoder::NormalizedMessage;
use crate::error::ChannelError;

const CHANNEL_NAME: &str = "slack";

/// Slack Web API channel.
pub struct SlackChannel {
    settings: ChatChannelSettings,
    channel: String,
    client: reqwest::Client,
}

/// Common envelope of Slack Web API responses.
#[derive(Debug, Deserialize)]
struct SlackResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    ts: Option<String>,
}

impl SlackChannel {
    pub fn new(settings: ChatChannelSettings, client: reqwest::Client) -> Self {
        let channel = normalize_channel(&settings.channel);
        Self {
            settings,
            channel,
            client,
        }
    }

    fn api_url(&self, method: &str) -> String {
        format!("{}/{method}", self.settings.api_base.trim_end_matches('/'))
    }

    /// Destination channel, always `#`-prefixed.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Subject in bold, a newline, then the body.
    pub fn payload(&self, message: &NormalizedMessage) -> String {
        format_chat_message(message)
    }

    async fn call(
        &self,
        method: &str,
        body: Option<serde_json::Value>,
    ) -> Result<SlackResponse, ChannelError> {
        let mut request = self
            .client
            .post(self.api_url(method))
            .bearer_auth(self.settings.bot_token.expose_secret());
        if let Some(body) = body {
            request = request.json(&body);
        }

        let resp = request.send().await.map_err(|e| ChannelError::SendFailed {
            name: CHANNEL_NAME.into(),
            reason: format!("{method}: {e}"),
        })?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(ChannelError::SendFailed {
                name: CHANNEL_NAME.into(),
                reason: format!("{method} returned {status}: {text}"),
            });
        }

        resp.json::<SlackResponse>()
            .await
            .map_err(|e| ChannelError::InvalidResponse {
                name: CHANNEL_NAME.into(),
                reason: format!("{method}: {e}"),
            })
    }

    /// Verify the bot token with `auth.test`.
    pub async fn self_check(&self) -> Result<(), ChannelError> {
        let resp = self
            .call("auth.test", None)
            .await
            .map_err(|e| ChannelError::AuthFailed {
                name: CHANNEL_NAME.into(),
                reason: e.to_string(),
            })?;

        if resp.ok {
            Ok(())
        } else {
            Err(ChannelError::AuthFailed {
                name: CHANNEL_NAME.into(),
                reason: resp.error.unwrap_or_else(|| "auth.test rejected".into()),
            })
        }
    }
}

/// Prefix `#` when the configured channel lacks it.
pub fn normalize_channel(channel: &str) -> String {
    let channel = channel.trim();
    if channel.starts_with('#') {
        channel.to_string()
    } else {
        format!("#{channel}")
    }
}

/// Render a message in Slack mrkdwn: `*subject*` then the body on the next line.
pub fn format_chat_message(message: &NormalizedMessage) -> String {
    format!("*{}*\n{}", message.subject, message.body)
}

#[async_trait]
impl Channel for SlackChannel {
    fn name(&self) -> &str {
        CHANNEL_NAME
    }

    fn enabled(&self) -> bool {
        true
    }

    async fn send(&self, message: &NormalizedMessage) -> Result<MessageRef, ChannelError> {
        self.self_check().await?;

        let body = serde_json::json!({
            "channel": self.channel,
            "text": self.payload(message),
        });
        let resp = self.call("chat.postMessage", Some(body)).await?;

        if !resp.ok {
            return Err(ChannelError::SendFailed {
                name: CHANNEL_NAME.into(),
                reason: resp.error.unwrap_or_else(|| "chat.postMessage rejected".into()),
            });
        }

        resp.ts.ok_or_else(|| ChannelError::InvalidResponse {
            name: CHANNEL_NAME.into(),
            reason: "chat.postMessage response missing ts".into(),
        })
    }
}

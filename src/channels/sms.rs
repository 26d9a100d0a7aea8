//! SMS channel — Twilio Programmable Messaging.

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde::Deserialize;

use crate::channels::{Channel, MessageRef};
use crate::config::{TextChannelSettings, TextFormat};
use crate::decoder::NormalizedMessage;
use crate::error::ChannelError;

const CHANNEL_NAME: &str = "sms";

/// Relays messages as a single SMS to one destination number.
pub struct SmsChannel {
    settings: TextChannelSettings,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct TwilioMessage {
    sid: String,
}

#[derive(Debug, Deserialize)]
struct TwilioError {
    #[serde(default)]
    code: Option<u32>,
    #[serde(default)]
    message: String,
}

impl SmsChannel {
    pub fn new(settings: TextChannelSettings, client: reqwest::Client) -> Self {
        Self { settings, client }
    }

    fn messages_url(&self) -> String {
        format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            self.settings.api_base.trim_end_matches('/'),
            self.settings.account_sid
        )
    }

    /// Build the SMS text for `message`, capped at the configured length.
    pub fn payload(&self, message: &NormalizedMessage) -> String {
        build_text(message, self.settings.format, self.settings.max_length)
    }
}

/// Assemble the SMS text and keep its first `max_length` characters.
///
/// Never splits into multiple messages; anything past the limit is dropped.
pub fn build_text(message: &NormalizedMessage, format: TextFormat, max_length: usize) -> String {
    let full = match format {
        TextFormat::SubjectAndBody => format!("{}:{}", message.subject, message.body),
        TextFormat::BodyOnly => message.body.clone(),
    };
    truncate_chars(&full, max_length)
}

/// First `max` characters of `s` (not bytes, so multi-byte text is never cut mid-char).
pub fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

#[async_trait]
impl Channel for SmsChannel {
    fn name(&self) -> &str {
        CHANNEL_NAME
    }

    fn enabled(&self) -> bool {
        true
    }

    async fn send(&self, message: &NormalizedMessage) -> Result<MessageRef, ChannelError> {
        let body = self.payload(message);
        let form = [
            ("To", self.settings.destination_number.as_str()),
            ("From", self.settings.from_number.as_str()),
            ("Body", body.as_str()),
        ];

        let resp = self
            .client
            .post(self.messages_url())
            .basic_auth(
                &self.settings.account_sid,
                Some(self.settings.auth_token.expose_secret()),
            )
            .form(&form)
            .send()
            .await
            .map_err(|e| ChannelError::SendFailed {
                name: CHANNEL_NAME.into(),
                reason: e.to_string(),
            })?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let reason = match serde_json::from_str::<TwilioError>(&text) {
                Ok(err) => match err.code {
                    Some(code) => format!("{status}: {} (code {code})", err.message),
                    None => format!("{status}: {}", err.message),
                },
                Err(_) => format!("{status}: {text}"),
            };
            return Err(if status.as_u16() == 401 {
                ChannelError::AuthFailed {
                    name: CHANNEL_NAME.into(),
                    reason,
                }
            } else {
                ChannelError::SendFailed {
                    name: CHANNEL_NAME.into(),
                    reason,
                }
            });
        }

        let message: TwilioMessage =
            resp.json()
                .await
                .map_err(|e| ChannelError::InvalidResponse {
                    name: CHANNEL_NAME.into(),
                    reason: e.to_string(),
                })?;

        tracing::debug!(sid = %message.sid, chars = body.chars().count(), "Twilio accepted SMS");
        Ok(message.sid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;

    fn settings(max_length: usize, format: TextFormat) -> TextChannelSettings {
        TextChannelSettings {
            account_sid: "AC123".into(),
            auth_token: SecretString::from("token"),
            from_number: "+15550001".into(),
            destination_number: "+15550002".into(),
            max_length,
            format,
            api_base: "https://api.twilio.com/".into(),
        }
    }

    fn channel(max_length: usize, format: TextFormat) -> SmsChannel {
        SmsChannel::new(settings(max_length, format), reqwest::Client::new())
    }

    #[test]
    fn combined_payload_at_limit_is_unchanged() {
        let ch = channel(20, TextFormat::SubjectAndBody);
        let payload = ch.payload(&NormalizedMessage::new("Alert", "Pressure high"));
        assert_eq!(payload, "Alert:Pressure high");
        assert!(payload.chars().count() <= 20);
    }

    #[test]
    fn long_payload_keeps_first_n_chars() {
        let body = "x".repeat(50);
        let msg = NormalizedMessage::new("Alert", body.clone());
        let ch = channel(20, TextFormat::SubjectAndBody);

        let payload = ch.payload(&msg);
        let full = format!("Alert:{body}");
        assert_eq!(payload.chars().count(), 20);
        assert_eq!(payload, full.chars().take(20).collect::<String>());
    }

    #[test]
    fn body_only_format_drops_subject() {
        let ch = channel(1600, TextFormat::BodyOnly);
        assert_eq!(
            ch.payload(&NormalizedMessage::new("Alert", "Pressure high")),
            "Pressure high"
        );
    }

    #[test]
    fn body_only_truncates_body() {
        let ch = channel(4, TextFormat::BodyOnly);
        assert_eq!(ch.payload(&NormalizedMessage::new("s", "abcdefg")), "abcd");
    }

    #[test]
    fn empty_message_still_has_separator() {
        let ch = channel(1600, TextFormat::SubjectAndBody);
        assert_eq!(ch.payload(&NormalizedMessage::default()), ":");
    }

    #[test]
    fn truncation_counts_characters_not_bytes() {
        assert_eq!(truncate_chars("ääää", 2), "ää");
        assert_eq!(truncate_chars("日本語テキスト", 3), "日本語");
        assert_eq!(truncate_chars("short", 10), "short");
        assert_eq!(truncate_chars("exact", 5), "exact");
        assert_eq!(truncate_chars("", 3), "");
    }

    #[test]
    fn messages_url_trims_trailing_slash() {
        let ch = channel(10, TextFormat::SubjectAndBody);
        assert_eq!(
            ch.messages_url(),
            "https://api.twilio.com/2010-04-01/Accounts/AC123/Messages.json"
        );
    }

    #[test]
    fn sms_channel_name() {
        let ch = channel(10, TextFormat::SubjectAndBody);
        assert_eq!(ch.name(), "sms");
        assert!(ch.enabled());
    }

    #[tokio::test]
    async fn send_to_unreachable_host_fails() {
        let mut s = settings(10, TextFormat::SubjectAndBody);
        s.api_base = "http://127.0.0.1:9".into();
        let ch = SmsChannel::new(s, reqwest::Client::new());
        let result = ch.send(&NormalizedMessage::new("a", "b")).await;
        assert!(matches!(result, Err(ChannelError::SendFailed { .. })));
    }
}

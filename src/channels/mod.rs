//! Outbound notification channels.
//!
//! The set of channels is closed: [`from_settings`] is the only place that
//! knows the concrete variants. The dispatcher iterates them uniformly
//! through the [`Channel`] trait.

pub mod slack;
pub mod sms;

use async_trait::async_trait;

use crate::config::Settings;
use crate::decoder::NormalizedMessage;
use crate::error::ChannelError;

pub use slack::SlackChannel;
pub use sms::SmsChannel;

/// Channel-specific reference to a delivered message (Twilio SID, Slack ts).
/// Opaque to the dispatcher.
pub type MessageRef = String;

/// An outbound notification destination.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Short name used in logs and dispatch outcomes.
    fn name(&self) -> &str;

    /// Whether this channel should be attempted at all.
    ///
    /// [`from_settings`] only builds channels whose section is enabled and
    /// complete, so the HTTP channels always answer `true`. The dispatcher
    /// still checks it for channels supplied by other factories.
    fn enabled(&self) -> bool;

    /// Format `message` for this channel and deliver it.
    async fn send(&self, message: &NormalizedMessage) -> Result<MessageRef, ChannelError>;
}

/// Build every configured channel for one pass.
///
/// Channels whose settings are absent (disabled or incomplete) are left
/// out entirely.
pub fn from_settings(settings: &Settings, client: &reqwest::Client) -> Vec<Box<dyn Channel>> {
    let mut channels: Vec<Box<dyn Channel>> = Vec::new();

    if let Some(text) = &settings.text {
        channels.push(Box::new(SmsChannel::new(text.clone(), client.clone())));
    }
    if let Some(chat) = &settings.chat {
        channels.push(Box::new(SlackChannel::new(chat.clone(), client.clone())));
    }

    channels
}

/// Builds the channel set for a pass. The poll loop calls it once per pass
/// with that pass's settings.
pub trait ChannelFactory: Send + Sync {
    fn build(&self, settings: &Settings) -> Result<Vec<Box<dyn Channel>>, ChannelError>;
}

/// Twilio + Slack over HTTP.
#[derive(Debug, Clone, Default)]
pub struct HttpChannels;

impl ChannelFactory for HttpChannels {
    fn build(&self, settings: &Settings) -> Result<Vec<Box<dyn Channel>>, ChannelError> {
        let client = http_client(settings)?;
        Ok(from_settings(settings, &client))
    }
}

/// Build the shared HTTP client, bounded by the configured request timeout.
pub fn http_client(settings: &Settings) -> Result<reqwest::Client, ChannelError> {
    Ok(reqwest::Client::builder()
        .timeout(settings.relay.http_timeout)
        .user_agent(concat!("mail-relay/", env!("CARGO_PKG_VERSION")))
        .build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigFile, EnvOverrides};

    fn settings(raw: &str) -> Settings {
        ConfigFile::parse(raw)
            .unwrap()
            .resolve(&EnvOverrides::default())
            .unwrap()
    }

    #[test]
    fn builds_only_configured_channels() {
        let s = settings(
            r#"
[mailbox]
username = "u"
password = "p"
[chat]
enabled = true
bot_token = "xoxb"
channel = "alerts"
"#,
        );
        let client = http_client(&s).unwrap();
        let channels = from_settings(&s, &client);
        let names: Vec<&str> = channels.iter().map(|c| c.name()).collect();
        assert_eq!(names, vec!["slack"]);
    }

    #[test]
    fn builds_both_channels_in_order() {
        let s = settings(
            r#"
[mailbox]
username = "u"
password = "p"
[text]
enabled = true
account_sid = "AC1"
auth_token = "t"
from_number = "+1"
destination_number = "+2"
[chat]
enabled = true
bot_token = "xoxb"
channel = "alerts"
"#,
        );
        let client = http_client(&s).unwrap();
        let channels = from_settings(&s, &client);
        let names: Vec<&str> = channels.iter().map(|c| c.name()).collect();
        assert_eq!(names, vec!["sms", "slack"]);
        assert!(channels.iter().all(|c| c.enabled()));
    }

    #[test]
    fn disabled_section_builds_no_channel() {
        let s = settings(
            r#"
[mailbox]
username = "u"
password = "p"
[text]
enabled = false
account_sid = "AC1"
auth_token = "t"
from_number = "+1"
destination_number = "+2"
"#,
        );
        assert!(s.text.is_none());
        let client = http_client(&s).unwrap();
        assert!(from_settings(&s, &client).is_empty());
    }

    #[test]
    fn no_channels_when_none_configured() {
        let s = settings("[mailbox]\nusername = \"u\"\npassword = \"p\"\n");
        let client = http_client(&s).unwrap();
        assert!(from_settings(&s, &client).is_empty());
    }
}

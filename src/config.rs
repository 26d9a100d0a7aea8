//! Relay settings.
//!
//! Settings live in a TOML file that is re-read at the start of every pass,
//! so edits (by hand or through the admin API) take effect without a restart.
//! A few secrets may be supplied through the environment instead of the file.
//!
//! Loading is asymmetric: a missing mailbox credential is a
//! [`ConfigError`] that aborts the pass, while an enabled channel with
//! missing credentials only disables that channel for the pass.

use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ConfigError;

/// Default config path when `MAIL_RELAY_CONFIG` is unset.
pub const DEFAULT_CONFIG_PATH: &str = "./config/relay.toml";

/// Default maximum SMS length (Twilio's concatenated-segment limit).
pub const DEFAULT_MAX_TEXT_LENGTH: usize = 1600;

const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

/// Upper bound for `mark_retry = { immediate = N }`.
pub const MAX_MARK_RETRIES: u32 = 10;

// ── File representation ─────────────────────────────────────────────

/// On-disk shape of the config file. Plain strings so it round-trips
/// through `toml` for the admin API; converted to [`Settings`] per pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConfigFile {
    #[serde(default)]
    pub mailbox: MailboxSection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<TextSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat: Option<ChatSection>,
    #[serde(default)]
    pub relay: RelaySection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MailboxSection {
    #[serde(default = "default_imap_host")]
    pub host: String,
    #[serde(default = "default_imap_port")]
    pub port: u16,
    #[serde(default = "default_folder")]
    pub folder: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl Default for MailboxSection {
    fn default() -> Self {
        Self {
            host: default_imap_host(),
            port: default_imap_port(),
            folder: default_folder(),
            username: String::new(),
            password: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TextSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub account_sid: String,
    #[serde(default)]
    pub auth_token: String,
    #[serde(default)]
    pub from_number: String,
    #[serde(default)]
    pub destination_number: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    #[serde(default)]
    pub format: TextFormat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_base: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChatSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub bot_token: String,
    #[serde(default)]
    pub channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_base: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelaySection {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,
    #[serde(default)]
    pub mark_retry: MarkRetryPolicy,
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            http_timeout_secs: default_http_timeout(),
            mark_retry: MarkRetryPolicy::default(),
        }
    }
}

fn default_imap_host() -> String {
    "imap.gmail.com".to_string()
}

fn default_imap_port() -> u16 {
    993
}

fn default_folder() -> String {
    "INBOX".to_string()
}

fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

fn default_http_timeout() -> u64 {
    DEFAULT_HTTP_TIMEOUT_SECS
}

/// How the SMS body is assembled from subject and body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextFormat {
    /// `"{subject}:{body}"`
    #[default]
    SubjectAndBody,
    /// Body only.
    BodyOnly,
}

/// What to do when marking a delivered message fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkRetryPolicy {
    /// Leave the message unread; it is re-delivered on a later pass.
    #[default]
    Defer,
    /// Retry within the same pass, up to this many extra attempts.
    Immediate(u32),
}

// ── Resolved settings ───────────────────────────────────────────────

/// Immutable settings snapshot for one pass.
#[derive(Debug, Clone)]
pub struct Settings {
    pub mailbox: MailboxSettings,
    /// `None` when the channel is disabled or incompletely configured.
    pub text: Option<TextChannelSettings>,
    pub chat: Option<ChatChannelSettings>,
    pub relay: RelaySettings,
}

#[derive(Debug, Clone)]
pub struct MailboxSettings {
    pub host: String,
    pub port: u16,
    pub folder: String,
    pub username: String,
    pub password: SecretString,
}

#[derive(Debug, Clone)]
pub struct TextChannelSettings {
    pub account_sid: String,
    pub auth_token: SecretString,
    pub from_number: String,
    pub destination_number: String,
    pub max_length: usize,
    pub format: TextFormat,
    pub api_base: String,
}

#[derive(Debug, Clone)]
pub struct ChatChannelSettings {
    pub bot_token: SecretString,
    pub channel: String,
    pub api_base: String,
}

#[derive(Debug, Clone, Copy)]
pub struct RelaySettings {
    pub poll_interval: Duration,
    pub http_timeout: Duration,
    pub mark_retry: MarkRetryPolicy,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            http_timeout: Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
            mark_retry: MarkRetryPolicy::default(),
        }
    }
}

/// Secrets that may come from the environment rather than the file.
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    pub imap_username: Option<String>,
    pub imap_password: Option<String>,
    pub twilio_auth_token: Option<String>,
    pub slack_bot_token: Option<String>,
}

impl EnvOverrides {
    pub fn from_env() -> Self {
        let var = |key: &str| {
            std::env::var(key)
                .ok()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        };
        Self {
            imap_username: var("MAIL_RELAY_IMAP_USERNAME"),
            imap_password: var("MAIL_RELAY_IMAP_PASSWORD"),
            twilio_auth_token: var("MAIL_RELAY_TWILIO_AUTH_TOKEN"),
            slack_bot_token: var("MAIL_RELAY_SLACK_BOT_TOKEN"),
        }
    }
}

impl ConfigFile {
    /// Read and parse a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Write the file back out, replacing it atomically.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let rendered =
            toml::to_string_pretty(self).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        let tmp = path.with_extension("toml.tmp");
        std::fs::write(&tmp, rendered)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Resolve into a per-pass [`Settings`] snapshot.
    pub fn resolve(&self, env: &EnvOverrides) -> Result<Settings, ConfigError> {
        let username = env
            .imap_username
            .clone()
            .unwrap_or_else(|| self.mailbox.username.trim().to_string());
        if username.is_empty() {
            return Err(ConfigError::MissingRequired {
                key: "mailbox.username".into(),
                hint: "Set it in the config file or MAIL_RELAY_IMAP_USERNAME.".into(),
            });
        }
        let password = env
            .imap_password
            .clone()
            .unwrap_or_else(|| self.mailbox.password.clone());
        if password.is_empty() {
            return Err(ConfigError::MissingRequired {
                key: "mailbox.password".into(),
                hint: "Set it in the config file or MAIL_RELAY_IMAP_PASSWORD.".into(),
            });
        }

        let mailbox = MailboxSettings {
            host: self.mailbox.host.clone(),
            port: self.mailbox.port,
            folder: self.mailbox.folder.clone(),
            username,
            password: SecretString::from(password),
        };

        let text = match &self.text {
            Some(section) if section.enabled => resolve_text(section, env)?,
            _ => None,
        };
        let chat = match &self.chat {
            Some(section) if section.enabled => resolve_chat(section, env),
            _ => None,
        };

        let relay = self.relay.resolve()?;

        Ok(Settings {
            mailbox,
            text,
            chat,
            relay,
        })
    }
}

impl RelaySection {
    fn resolve(&self) -> Result<RelaySettings, ConfigError> {
        let positive = |key: &str, secs: u64| {
            if secs == 0 {
                Err(ConfigError::InvalidValue {
                    key: key.into(),
                    message: "must be greater than zero".into(),
                })
            } else {
                Ok(Duration::from_secs(secs))
            }
        };
        let poll_interval = positive("relay.poll_interval_secs", self.poll_interval_secs)?;
        let http_timeout = positive("relay.http_timeout_secs", self.http_timeout_secs)?;

        if let MarkRetryPolicy::Immediate(extra) = self.mark_retry
            && extra > MAX_MARK_RETRIES
        {
            return Err(ConfigError::InvalidValue {
                key: "relay.mark_retry".into(),
                message: format!("immediate retries must be at most {MAX_MARK_RETRIES}"),
            });
        }

        Ok(RelaySettings {
            poll_interval,
            http_timeout,
            mark_retry: self.mark_retry,
        })
    }
}

fn resolve_text(
    section: &TextSection,
    env: &EnvOverrides,
) -> Result<Option<TextChannelSettings>, ConfigError> {
    let max_length = section.max_length.unwrap_or(DEFAULT_MAX_TEXT_LENGTH);
    if max_length == 0 {
        return Err(ConfigError::InvalidValue {
            key: "text.max_length".into(),
            message: "must be greater than zero".into(),
        });
    }

    let auth_token = env
        .twilio_auth_token
        .clone()
        .unwrap_or_else(|| section.auth_token.clone());

    let missing: Vec<&str> = [
        ("account_sid", section.account_sid.as_str()),
        ("auth_token", auth_token.as_str()),
        ("from_number", section.from_number.as_str()),
        ("destination_number", section.destination_number.as_str()),
    ]
    .into_iter()
    .filter(|(_, v)| v.trim().is_empty())
    .map(|(k, _)| k)
    .collect();

    if !missing.is_empty() {
        warn!(
            missing = ?missing,
            "Text channel enabled but incompletely configured — disabled for this pass"
        );
        return Ok(None);
    }

    Ok(Some(TextChannelSettings {
        account_sid: section.account_sid.trim().to_string(),
        auth_token: SecretString::from(auth_token),
        from_number: section.from_number.trim().to_string(),
        destination_number: section.destination_number.trim().to_string(),
        max_length,
        format: section.format,
        api_base: section
            .api_base
            .clone()
            .unwrap_or_else(|| "https://api.twilio.com".to_string()),
    }))
}

fn resolve_chat(section: &ChatSection, env: &EnvOverrides) -> Option<ChatChannelSettings> {
    let bot_token = env
        .slack_bot_token
        .clone()
        .unwrap_or_else(|| section.bot_token.clone());

    if bot_token.trim().is_empty() || section.channel.trim().is_empty() {
        warn!("Chat channel enabled but missing bot_token or channel — disabled for this pass");
        return None;
    }

    Some(ChatChannelSettings {
        bot_token: SecretString::from(bot_token),
        channel: section.channel.trim().to_string(),
        api_base: section
            .api_base
            .clone()
            .unwrap_or_else(|| "https://slack.com/api".to_string()),
    })
}

/// Source of per-pass settings. The poll loop calls [`load`](Self::load)
/// once at the top of every pass.
pub trait SettingsSource: Send + Sync {
    fn load(&self) -> Result<Settings, ConfigError>;
}

/// Settings backed by a TOML file plus environment overrides.
#[derive(Debug, Clone)]
pub struct FileSettings {
    path: PathBuf,
}

impl FileSettings {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path from `MAIL_RELAY_CONFIG`, or [`DEFAULT_CONFIG_PATH`].
    pub fn from_env() -> Self {
        let path = std::env::var("MAIL_RELAY_CONFIG")
            .unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::new(path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsSource for FileSettings {
    fn load(&self) -> Result<Settings, ConfigError> {
        ConfigFile::load(&self.path)?.resolve(&EnvOverrides::from_env())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    const FULL: &str = r#"
[mailbox]
username = "alerts@example.com"
password = "app-password"

[text]
enabled = true
account_sid = "AC123"
auth_token = "tok"
from_number = "+15550001"
destination_number = "+15550002"
max_length = 20

[chat]
enabled = true
bot_token = "xoxb-1"
channel = "alerts"

[relay]
poll_interval_secs = 5
mark_retry = { immediate = 2 }
"#;

    #[test]
    fn parses_full_file() {
        let settings = ConfigFile::parse(FULL)
            .unwrap()
            .resolve(&EnvOverrides::default())
            .unwrap();

        assert_eq!(settings.mailbox.host, "imap.gmail.com");
        assert_eq!(settings.mailbox.port, 993);
        assert_eq!(settings.mailbox.folder, "INBOX");
        assert_eq!(settings.mailbox.password.expose_secret(), "app-password");

        let text = settings.text.unwrap();
        assert_eq!(text.max_length, 20);
        assert_eq!(text.format, TextFormat::SubjectAndBody);
        assert_eq!(text.api_base, "https://api.twilio.com");

        let chat = settings.chat.unwrap();
        assert_eq!(chat.channel, "alerts");

        assert_eq!(settings.relay.poll_interval, Duration::from_secs(5));
        assert_eq!(settings.relay.mark_retry, MarkRetryPolicy::Immediate(2));
    }

    #[test]
    fn defaults_when_sections_absent() {
        let file = ConfigFile::parse(
            "[mailbox]\nusername = \"u@example.com\"\npassword = \"p\"\n",
        )
        .unwrap();
        let settings = file.resolve(&EnvOverrides::default()).unwrap();

        assert!(settings.text.is_none());
        assert!(settings.chat.is_none());
        assert_eq!(settings.relay.poll_interval, Duration::from_secs(30));
        assert_eq!(settings.relay.http_timeout, Duration::from_secs(30));
        assert_eq!(settings.relay.mark_retry, MarkRetryPolicy::Defer);
    }

    #[test]
    fn text_max_length_defaults_to_1600() {
        let file = ConfigFile::parse(
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
"#,
        )
        .unwrap();
        let settings = file.resolve(&EnvOverrides::default()).unwrap();
        assert_eq!(settings.text.unwrap().max_length, DEFAULT_MAX_TEXT_LENGTH);
    }

    #[test]
    fn missing_mailbox_password_aborts() {
        let file = ConfigFile::parse("[mailbox]\nusername = \"u@example.com\"\n").unwrap();
        let err = file.resolve(&EnvOverrides::default()).unwrap_err();
        assert!(
            matches!(err, ConfigError::MissingRequired { ref key, .. } if key == "mailbox.password")
        );
    }

    #[test]
    fn missing_mailbox_username_aborts() {
        let err = ConfigFile::default()
            .resolve(&EnvOverrides::default())
            .unwrap_err();
        assert!(
            matches!(err, ConfigError::MissingRequired { ref key, .. } if key == "mailbox.username")
        );
    }

    #[test]
    fn incomplete_channel_is_disabled_not_fatal() {
        let file = ConfigFile::parse(
            r#"
[mailbox]
username = "u"
password = "p"
[text]
enabled = true
account_sid = "AC1"
[chat]
enabled = true
channel = "alerts"
"#,
        )
        .unwrap();
        let settings = file.resolve(&EnvOverrides::default()).unwrap();
        assert!(settings.text.is_none());
        assert!(settings.chat.is_none());
    }

    #[test]
    fn disabled_channel_is_none() {
        let mut file = ConfigFile::parse(FULL).unwrap();
        file.text.as_mut().unwrap().enabled = false;
        let settings = file.resolve(&EnvOverrides::default()).unwrap();
        assert!(settings.text.is_none());
        assert!(settings.chat.is_some());
    }

    #[test]
    fn zero_max_length_is_invalid() {
        let mut file = ConfigFile::parse(FULL).unwrap();
        file.text.as_mut().unwrap().max_length = Some(0);
        let err = file.resolve(&EnvOverrides::default()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn zero_intervals_are_invalid() {
        for (field, key) in [
            ("poll_interval_secs", "relay.poll_interval_secs"),
            ("http_timeout_secs", "relay.http_timeout_secs"),
        ] {
            let raw = format!(
                "[mailbox]\nusername = \"u\"\npassword = \"p\"\n[relay]\n{field} = 0\n"
            );
            let err = ConfigFile::parse(&raw)
                .unwrap()
                .resolve(&EnvOverrides::default())
                .unwrap_err();
            assert!(
                matches!(err, ConfigError::InvalidValue { key: ref k, .. } if k == key),
                "{field}: {err}"
            );
        }
    }

    #[test]
    fn excessive_mark_retries_are_invalid() {
        let mut file = ConfigFile::parse(FULL).unwrap();
        file.relay.mark_retry = MarkRetryPolicy::Immediate(u32::MAX);
        let err = file.resolve(&EnvOverrides::default()).unwrap_err();
        assert!(
            matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "relay.mark_retry")
        );

        file.relay.mark_retry = MarkRetryPolicy::Immediate(MAX_MARK_RETRIES);
        assert!(file.resolve(&EnvOverrides::default()).is_ok());
    }

    #[test]
    fn env_overrides_win() {
        let file = ConfigFile::parse("[mailbox]\nusername = \"file-user\"\n").unwrap();
        let env = EnvOverrides {
            imap_username: Some("env-user".into()),
            imap_password: Some("env-pass".into()),
            ..Default::default()
        };
        let settings = file.resolve(&env).unwrap();
        assert_eq!(settings.mailbox.username, "env-user");
        assert_eq!(settings.mailbox.password.expose_secret(), "env-pass");
    }

    #[test]
    fn body_only_format_parses() {
        let mut file = ConfigFile::parse(FULL).unwrap();
        file.text.as_mut().unwrap().format = TextFormat::BodyOnly;
        let rendered = toml::to_string_pretty(&file).unwrap();
        assert!(rendered.contains("format = \"body_only\""));
    }

    #[test]
    fn malformed_file_is_parse_error() {
        let err = ConfigFile::parse("[mailbox\nusername = ").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn file_settings_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.toml");
        let file = ConfigFile::parse(FULL).unwrap();
        file.save(&path).unwrap();

        let reloaded = ConfigFile::load(&path).unwrap();
        assert_eq!(reloaded, file);
    }

    #[test]
    fn missing_file_is_io_error() {
        let source = FileSettings::new("/nonexistent/relay.toml");
        assert!(matches!(source.load(), Err(ConfigError::Io(_))));
    }
}

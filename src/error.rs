//! Error types for the mail relay.

/// Errors that abort preparing a pass. Mailbox and decode failures are
/// handled where they happen and never reach this type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),
}

/// Configuration-related errors. Fatal to the current pass only.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Mailbox provider errors.
#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    #[error("Failed to connect to {host}: {reason}")]
    Connection { host: String, reason: String },

    #[error("Mailbox login rejected for {username}: {reason}")]
    Auth { username: String, reason: String },

    #[error("Mailbox protocol error during {command}: {reason}")]
    Protocol { command: String, reason: String },

    #[error("Failed to fetch message {id}: {reason}")]
    Fetch { id: String, reason: String },

    #[error("Failed to mark message {id} processed: {reason}")]
    Mark { id: String, reason: String },

    #[error("Mailbox session already closed")]
    SessionClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outbound channel errors. Scoped to one channel and one message.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Failed to send on channel {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("Authentication failed for channel {name}: {reason}")]
    AuthFailed { name: String, reason: String },

    #[error("Invalid response from channel {name}: {reason}")]
    InvalidResponse { name: String, reason: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Message decoding errors. Never escape the decoder; degraded to empty fields.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Message could not be parsed")]
    Unparseable,

    #[error("Message has no payload")]
    MissingPayload,

    #[error("Payload is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),
}

/// Result type alias for the relay.
pub type Result<T> = std::result::Result<T, Error>;

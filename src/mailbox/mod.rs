//! Mailbox abstraction: list, fetch and flag messages on a remote mailbox.

pub mod imap;

use std::fmt;

use async_trait::async_trait;

use crate::config::MailboxSettings;
use crate::error::MailboxError;

pub use imap::ImapProvider;

/// Opaque server-side message handle (an IMAP UID for the IMAP provider).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A fetched message: its handle plus the raw RFC 5322 bytes.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub id: MessageId,
    pub content: Vec<u8>,
}

/// Opens mailbox sessions.
#[async_trait]
pub trait MailboxProvider: Send + Sync {
    /// Authenticate and open the configured folder.
    async fn connect(
        &self,
        settings: &MailboxSettings,
    ) -> Result<Box<dyn MailboxSession>, MailboxError>;
}

/// An authenticated session, exclusively owned by one pass.
#[async_trait]
pub trait MailboxSession: Send {
    /// Handles of every unread message. Empty when nothing matches.
    async fn list_unread(&mut self) -> Result<Vec<MessageId>, MailboxError>;

    /// Fetch full content without changing the message's read state.
    async fn fetch(&mut self, id: &MessageId) -> Result<RawMessage, MailboxError>;

    /// Flag the message so it no longer appears in [`list_unread`](Self::list_unread).
    async fn mark_processed(&mut self, id: &MessageId) -> Result<(), MailboxError>;

    /// End the session. Best-effort: callers log and discard the error.
    async fn close(self: Box<Self>) -> Result<(), MailboxError>;
}

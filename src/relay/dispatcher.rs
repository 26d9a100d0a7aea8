//! Dispatcher — decode, fan out to channels, acknowledge.
//!
//! A message is marked processed iff at least one enabled channel
//! delivered it. A failed mark leaves the message unread, so it is
//! delivered again on a later pass (at-least-once).

use futures::future::join_all;
use tracing::{error, info, warn};

use crate::channels::{Channel, MessageRef};
use crate::config::MarkRetryPolicy;
use crate::decoder;
use crate::error::ChannelError;
use crate::mailbox::{MailboxSession, MessageId, RawMessage};

/// Result of one channel's delivery attempt.
#[derive(Debug)]
pub struct Delivery {
    pub channel: String,
    pub result: Result<MessageRef, ChannelError>,
}

impl Delivery {
    pub fn succeeded(&self) -> bool {
        self.result.is_ok()
    }
}

/// What happened to the source message after delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acknowledgement {
    /// At least one channel delivered and the message was flagged.
    Marked,
    /// Delivered, but flagging failed; the message stays unread.
    MarkFailed(String),
    /// Every enabled channel failed.
    NotDelivered,
    /// No channel was enabled.
    NoChannels,
}

/// Per-message result.
#[derive(Debug)]
pub struct DispatchOutcome {
    pub message_id: MessageId,
    pub deliveries: Vec<Delivery>,
    pub acknowledgement: Acknowledgement,
}

impl DispatchOutcome {
    /// Whether any channel delivered the message.
    pub fn delivered(&self) -> bool {
        self.deliveries.iter().any(Delivery::succeeded)
    }

    pub fn marked(&self) -> bool {
        self.acknowledgement == Acknowledgement::Marked
    }
}

/// A message that could not be fetched and was skipped.
#[derive(Debug)]
pub struct FetchFailure {
    pub message_id: MessageId,
    pub reason: String,
}

/// Everything the dispatcher did for one pass.
#[derive(Debug, Default)]
pub struct DispatchSummary {
    pub outcomes: Vec<DispatchOutcome>,
    pub fetch_failures: Vec<FetchFailure>,
}

impl DispatchSummary {
    pub fn marked_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.marked()).count()
    }
}

/// Fans each message out to this pass's channels.
pub struct Dispatcher {
    channels: Vec<Box<dyn Channel>>,
    mark_policy: MarkRetryPolicy,
}

impl Dispatcher {
    pub fn new(channels: Vec<Box<dyn Channel>>, mark_policy: MarkRetryPolicy) -> Self {
        Self {
            channels,
            mark_policy,
        }
    }

    pub fn channel_names(&self) -> Vec<&str> {
        self.channels.iter().map(|c| c.name()).collect()
    }

    /// Fetch and dispatch every listed message, in order.
    ///
    /// A fetch failure skips that message only; the pass always runs to
    /// the end of `ids`.
    pub async fn dispatch_all(
        &self,
        session: &mut dyn MailboxSession,
        ids: &[MessageId],
    ) -> DispatchSummary {
        let mut summary = DispatchSummary::default();

        for id in ids {
            let raw = match session.fetch(id).await {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(id = %id, error = %e, "Failed to fetch message — skipping");
                    summary.fetch_failures.push(FetchFailure {
                        message_id: id.clone(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            summary.outcomes.push(self.dispatch(session, &raw).await);
        }

        summary
    }

    /// Deliver one message and acknowledge it if any channel succeeded.
    pub async fn dispatch(
        &self,
        session: &mut dyn MailboxSession,
        raw: &RawMessage,
    ) -> DispatchOutcome {
        let message = decoder::decode(raw);

        let enabled: Vec<&dyn Channel> = self
            .channels
            .iter()
            .filter(|c| c.enabled())
            .map(|c| c.as_ref())
            .collect();

        if enabled.is_empty() {
            warn!(id = %raw.id, "No channels enabled — message left unread");
            return DispatchOutcome {
                message_id: raw.id.clone(),
                deliveries: Vec::new(),
                acknowledgement: Acknowledgement::NoChannels,
            };
        }

        let deliveries: Vec<Delivery> = join_all(enabled.into_iter().map(|channel| {
            let message = &message;
            async move {
                Delivery {
                    channel: channel.name().to_string(),
                    result: channel.send(message).await,
                }
            }
        }))
        .await;

        for delivery in &deliveries {
            match &delivery.result {
                Ok(reference) => info!(
                    id = %raw.id,
                    channel = %delivery.channel,
                    reference = %reference,
                    "Delivered message"
                ),
                Err(e) => warn!(
                    id = %raw.id,
                    channel = %delivery.channel,
                    error = %e,
                    "Channel delivery failed"
                ),
            }
        }

        let acknowledgement = if deliveries.iter().any(Delivery::succeeded) {
            self.acknowledge(session, &raw.id).await
        } else {
            warn!(id = %raw.id, "All channels failed — message left unread");
            Acknowledgement::NotDelivered
        };

        DispatchOutcome {
            message_id: raw.id.clone(),
            deliveries,
            acknowledgement,
        }
    }

    async fn acknowledge(
        &self,
        session: &mut dyn MailboxSession,
        id: &MessageId,
    ) -> Acknowledgement {
        let attempts = match self.mark_policy {
            MarkRetryPolicy::Defer => 1,
            MarkRetryPolicy::Immediate(extra) => extra.saturating_add(1),
        };

        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match session.mark_processed(id).await {
                Ok(()) => {
                    info!(id = %id, "Marked message processed");
                    return Acknowledgement::Marked;
                }
                Err(e) => {
                    if attempt < attempts {
                        warn!(id = %id, attempt, error = %e, "Mark processed failed — retrying");
                    }
                    last_error = e.to_string();
                }
            }
        }

        error!(
            id = %id,
            error = %last_error,
            "Failed to mark message processed — it will be delivered again next pass"
        );
        Acknowledgement::MarkFailed(last_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::NormalizedMessage;
    use crate::error::MailboxError;
    use async_trait::async_trait;

    /// Session whose first `failures` marks are rejected.
    #[derive(Default)]
    struct FlakySession {
        failures: u32,
        attempts: u32,
        marked: Vec<MessageId>,
    }

    #[async_trait]
    impl MailboxSession for FlakySession {
        async fn list_unread(&mut self) -> Result<Vec<MessageId>, MailboxError> {
            Ok(Vec::new())
        }

        async fn fetch(&mut self, id: &MessageId) -> Result<RawMessage, MailboxError> {
            Ok(RawMessage {
                id: id.clone(),
                content: b"Subject: Alert\r\n\r\nbody".to_vec(),
            })
        }

        async fn mark_processed(&mut self, id: &MessageId) -> Result<(), MailboxError> {
            self.attempts += 1;
            if self.attempts <= self.failures {
                return Err(MailboxError::Mark {
                    id: id.to_string(),
                    reason: "rejected".into(),
                });
            }
            self.marked.push(id.clone());
            Ok(())
        }

        async fn close(self: Box<Self>) -> Result<(), MailboxError> {
            Ok(())
        }
    }

    struct Echo;

    #[async_trait]
    impl Channel for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn enabled(&self) -> bool {
            true
        }

        async fn send(&self, message: &NormalizedMessage) -> Result<MessageRef, ChannelError> {
            Ok(message.subject.clone())
        }
    }

    fn echo() -> Vec<Box<dyn Channel>> {
        vec![Box::new(Echo)]
    }

    fn raw(id: &str) -> RawMessage {
        RawMessage {
            id: MessageId::new(id),
            content: b"Subject: Alert\r\n\r\nbody".to_vec(),
        }
    }

    #[tokio::test]
    async fn unbounded_retry_count_still_marks() {
        let dispatcher = Dispatcher::new(echo(), MarkRetryPolicy::Immediate(u32::MAX));
        let mut session = FlakySession {
            failures: 2,
            ..Default::default()
        };

        let outcome = dispatcher.dispatch(&mut session, &raw("1")).await;

        assert_eq!(outcome.acknowledgement, Acknowledgement::Marked);
        assert_eq!(session.attempts, 3);
        assert_eq!(session.marked, vec![MessageId::new("1")]);
    }

    #[tokio::test]
    async fn defer_tries_once() {
        let dispatcher = Dispatcher::new(echo(), MarkRetryPolicy::Defer);
        let mut session = FlakySession {
            failures: 1,
            ..Default::default()
        };

        let outcome = dispatcher.dispatch(&mut session, &raw("2")).await;

        assert!(matches!(outcome.acknowledgement, Acknowledgement::MarkFailed(_)));
        assert_eq!(session.attempts, 1);
        assert!(outcome.delivered());
    }
}

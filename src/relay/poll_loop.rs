//! The run-forever poll loop: connect, list, dispatch, disconnect, sleep.
//!
//! `Idle → Connecting → Polling → Dispatching → Disconnecting → Sleeping`.
//! Nothing inside a pass ends the loop: configuration, connection and
//! listing failures skip the rest of the pass, and a panic is caught at
//! the pass boundary. Only the shutdown signal stops it.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::sync::watch;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use super::dispatcher::{DispatchSummary, Dispatcher};
use crate::channels::ChannelFactory;
use crate::config::{RelaySettings, Settings, SettingsSource};
use crate::error::Result;
use crate::mailbox::MailboxProvider;

/// Where the loop is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Idle,
    Connecting,
    Polling,
    Dispatching,
    Disconnecting,
    Sleeping,
}

/// How a pass ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    /// All listed messages were handled.
    Completed,
    /// Settings could not be loaded; nothing was attempted.
    ConfigFailed(String),
    /// The mailbox could not be opened; nothing was attempted.
    ConnectFailed(String),
    /// Listing unread messages failed; the session was closed.
    ListFailed(String),
    /// Listing or dispatch panicked; the session was still closed.
    Panicked(String),
}

/// Summary of one pass.
#[derive(Debug)]
pub struct PassReport {
    pub pass_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub outcome: PassOutcome,
    pub unread: usize,
    pub dispatch: DispatchSummary,
}

impl PassReport {
    fn new(outcome: PassOutcome) -> Self {
        Self {
            pass_id: Uuid::new_v4(),
            started_at: Utc::now(),
            outcome,
            unread: 0,
            dispatch: DispatchSummary::default(),
        }
    }
}

/// The run-forever relay loop. Strictly sequential: one pass at a time.
pub struct PollLoop {
    settings: Arc<dyn SettingsSource>,
    provider: Arc<dyn MailboxProvider>,
    channels: Arc<dyn ChannelFactory>,
    state: PollState,
    passes: u64,
    consecutive_config_failures: u32,
    poll_interval: Duration,
}

impl PollLoop {
    pub fn new(
        settings: Arc<dyn SettingsSource>,
        provider: Arc<dyn MailboxProvider>,
        channels: Arc<dyn ChannelFactory>,
    ) -> Self {
        Self {
            settings,
            provider,
            channels,
            state: PollState::Idle,
            passes: 0,
            consecutive_config_failures: 0,
            poll_interval: RelaySettings::default().poll_interval,
        }
    }

    pub fn state(&self) -> PollState {
        self.state
    }

    /// Sleep between passes: the last successfully loaded interval.
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn passes(&self) -> u64 {
        self.passes
    }

    fn enter(&mut self, state: PollState) {
        debug!(from = ?self.state, to = ?state, "Poll state transition");
        self.state = state;
    }

    /// Run passes until `shutdown` flips to `true` (or its sender is dropped).
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        info!("Mail relay started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let pass = AssertUnwindSafe(self.run_pass()).catch_unwind().await;
            if let Err(panic) = pass {
                let reason = panic_reason(panic.as_ref());
                error!(reason = %reason, "Pass panicked — skipping to next pass");
            }

            self.enter(PollState::Sleeping);
            let interval = self.poll_interval;
            info!("Waiting {}s before next check", interval.as_secs());

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(interval) => {}
            }
            self.enter(PollState::Idle);
        }

        info!("Mail relay shutting down");
    }

    /// Run exactly one pass. Never fails; the report says how it ended.
    pub async fn run_pass(&mut self) -> PassReport {
        self.passes += 1;
        let pass_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("pass", n = self.passes, pass_id = %pass_id);

        let mut report = self.pass_body().instrument(span).await;
        report.pass_id = pass_id;
        report.started_at = started_at;
        report
    }

    /// Load this pass's settings and build its channels.
    fn prepare(&mut self) -> Result<(Settings, Dispatcher)> {
        let settings = self.settings.load()?;
        self.poll_interval = settings.relay.poll_interval;
        info!(
            text = settings.text.is_some(),
            chat = settings.chat.is_some(),
            "Configuration loaded"
        );

        let channels = self.channels.build(&settings)?;
        let dispatcher = Dispatcher::new(channels, settings.relay.mark_retry);
        Ok((settings, dispatcher))
    }

    async fn pass_body(&mut self) -> PassReport {
        self.enter(PollState::Connecting);

        let (settings, dispatcher) = match self.prepare() {
            Ok(ready) => {
                if self.consecutive_config_failures > 0 {
                    info!(
                        after_failures = self.consecutive_config_failures,
                        "Configuration recovered"
                    );
                }
                self.consecutive_config_failures = 0;
                ready
            }
            Err(e) => {
                self.consecutive_config_failures += 1;
                error!(
                    error = %e,
                    consecutive_failures = self.consecutive_config_failures,
                    "Failed to prepare pass — skipping"
                );
                return PassReport::new(PassOutcome::ConfigFailed(e.to_string()));
            }
        };

        let mut session = match self.provider.connect(&settings.mailbox).await {
            Ok(session) => {
                info!(host = %settings.mailbox.host, "Connected to mailbox");
                session
            }
            Err(e) => {
                error!(host = %settings.mailbox.host, error = %e, "Failed to connect to mailbox");
                return PassReport::new(PassOutcome::ConnectFailed(e.to_string()));
            }
        };

        // A panic while listing or dispatching must still reach Disconnecting.
        let work = async {
            self.enter(PollState::Polling);
            match session.list_unread().await {
                Ok(ids) => {
                    info!("Found {} unread messages", ids.len());
                    self.enter(PollState::Dispatching);
                    let dispatch = dispatcher.dispatch_all(session.as_mut(), &ids).await;
                    debug!(
                        marked = dispatch.marked_count(),
                        fetch_failures = dispatch.fetch_failures.len(),
                        channels = ?dispatcher.channel_names(),
                        "Dispatch complete"
                    );
                    let mut report = PassReport::new(PassOutcome::Completed);
                    report.unread = ids.len();
                    report.dispatch = dispatch;
                    report
                }
                Err(e) => {
                    error!(error = %e, "Failed to list unread messages");
                    PassReport::new(PassOutcome::ListFailed(e.to_string()))
                }
            }
        };
        let report = match AssertUnwindSafe(work).catch_unwind().await {
            Ok(report) => report,
            Err(panic) => {
                let reason = panic_reason(panic.as_ref());
                error!(reason = %reason, "Pass panicked while dispatching — closing session");
                PassReport::new(PassOutcome::Panicked(reason))
            }
        };

        self.enter(PollState::Disconnecting);
        if let Err(e) = session.close().await {
            warn!(error = %e, "Failed to close mailbox session");
        }

        report
    }
}

fn panic_reason(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

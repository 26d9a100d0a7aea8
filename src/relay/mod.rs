//! The relay core: per-message dispatch and the polling loop around it.

pub mod dispatcher;
pub mod poll_loop;

pub use dispatcher::{Acknowledgement, Delivery, DispatchOutcome, DispatchSummary, Dispatcher};
pub use poll_loop::{PassOutcome, PassReport, PollLoop, PollState};

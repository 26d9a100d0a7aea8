//! Mail relay — forwards unread mailbox messages to SMS and chat channels.

pub mod admin;
pub mod channels;
pub mod config;
pub mod decoder;
pub mod error;
pub mod mailbox;
pub mod relay;

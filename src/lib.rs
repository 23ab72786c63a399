//! Inbox Tasks — mailbox ingestion, rule classification, and live task updates.

pub mod channels;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod store;
pub mod tasks;

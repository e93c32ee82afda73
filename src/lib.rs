//! Order Intake — mailbox-driven order ingestion and reconciliation.

pub mod archive;
pub mod config;
pub mod documents;
pub mod error;
pub mod mailbox;
pub mod pipeline;
pub mod store;
pub mod watch;

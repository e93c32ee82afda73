//! Locating order notifications and fetching raw messages.
//!
//! The mail provider is an external collaborator consumed through two narrow
//! traits. Neither has side effects on the mailbox: nothing is flagged,
//! moved or deleted.

pub mod decoder;
pub mod imap;

use std::fmt;

use async_trait::async_trait;
use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::error::MailboxError;

pub use decoder::{Attachment, DecodedMessage, decode_message};
pub use imap::ImapMailbox;

/// Opaque provider-specific message identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageHandle(pub String);

impl MessageHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which messages count as order notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchCriteria {
    pub sender: String,
    pub subject_filter: String,
    /// Inclusive; defaults to one day before the run.
    pub date_from: Option<NaiveDate>,
    /// Inclusive.
    pub date_to: Option<NaiveDate>,
}

impl SearchCriteria {
    pub fn new(sender: impl Into<String>, subject_filter: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            subject_filter: subject_filter.into(),
            date_from: None,
            date_to: None,
        }
    }

    pub fn with_range(mut self, date_from: Option<NaiveDate>, date_to: Option<NaiveDate>) -> Self {
        self.date_from = date_from;
        self.date_to = date_to;
        self
    }

    /// Start of the window, relative to `today` when not given.
    pub fn effective_from(&self, today: NaiveDate) -> NaiveDate {
        self.date_from
            .unwrap_or_else(|| today.checked_sub_days(Days::new(1)).unwrap_or(today))
    }
}

/// Finds message handles matching the search criteria.
#[async_trait]
pub trait MailboxLocator: Send + Sync {
    /// Handles in provider order. Idempotent.
    async fn locate(&self, criteria: &SearchCriteria) -> Result<Vec<MessageHandle>, MailboxError>;
}

/// Retrieves the raw RFC 5322 bytes of a message.
#[async_trait]
pub trait MailSource: Send + Sync {
    async fn fetch_raw(&self, handle: &MessageHandle) -> Result<Vec<u8>, MailboxError>;
}

//! Queue entry model.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use courier_common::address::EmailAddress;
use serde::{Deserialize, Serialize};

use crate::QueueError;

/// Store-assigned identity of a queue entry.
///
/// Identifiers are monotonic, so ordering by id is ordering by age.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(pub i64);

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for EntryId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// Lifecycle of a queue entry.
///
/// ```text
/// pending --claim--> locked --+--> sent         (terminal)
///    ^                        +--> failed       (terminal for the message)
///    |                        +--> auth_failed  (terminal)
///    +-------release----------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Locked,
    Sent,
    Failed,
    AuthFailed,
}

impl QueueStatus {
    pub const ALL: [Self; 5] = [
        Self::Pending,
        Self::Locked,
        Self::Sent,
        Self::Failed,
        Self::AuthFailed,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Locked => "locked",
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::AuthFailed => "auth_failed",
        }
    }

    /// `pending` and `locked` entries still occupy their recipient's slot.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Locked)
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !self.is_active()
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| QueueError::CorruptRow(format!("unknown status '{s}'")))
    }
}

/// One outbound message and its delivery state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: EntryId,
    pub recipient_email: EmailAddress,
    pub recipient_name: Option<String>,
    pub unsubscribe_token: Option<String>,
    /// Already localised and personalised.
    pub subject: String,
    pub language: Option<String>,
    pub status: QueueStatus,
    /// Present exactly when `status` is `locked`.
    pub locked_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A message to be queued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewEntry {
    pub recipient_email: EmailAddress,
    #[serde(default)]
    pub recipient_name: Option<String>,
    #[serde(default)]
    pub unsubscribe_token: Option<String>,
    pub subject: String,
    #[serde(default)]
    pub language: Option<String>,
}

impl NewEntry {
    #[must_use]
    pub fn new(recipient_email: EmailAddress, subject: impl Into<String>) -> Self {
        Self {
            recipient_email,
            recipient_name: None,
            unsubscribe_token: None,
            subject: subject.into(),
            language: None,
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.recipient_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.unsubscribe_token = Some(token.into());
        self
    }

    #[must_use]
    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    /// # Errors
    ///
    /// Returns [`QueueError::InvalidEntry`] if the subject is blank.
    pub fn validate(&self) -> crate::Result<()> {
        if self.subject.trim().is_empty() {
            return Err(QueueError::InvalidEntry(format!(
                "empty subject for {}",
                self.recipient_email
            )));
        }

        Ok(())
    }
}

/// Number of entries per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub pending: u64,
    pub locked: u64,
    pub sent: u64,
    pub failed: u64,
    pub auth_failed: u64,
}

impl QueueCounts {
    pub const fn add(&mut self, status: QueueStatus, n: u64) {
        match status {
            QueueStatus::Pending => self.pending += n,
            QueueStatus::Locked => self.locked += n,
            QueueStatus::Sent => self.sent += n,
            QueueStatus::Failed => self.failed += n,
            QueueStatus::AuthFailed => self.auth_failed += n,
        }
    }

    #[must_use]
    pub const fn total(&self) -> u64 {
        self.pending + self.locked + self.sent + self.failed + self.auth_failed
    }
}

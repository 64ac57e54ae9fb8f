//! Message records and their delivery status

use core::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Storage-assigned identifier of a message record
///
/// Identifiers are assigned in creation order, so ordering by id is ordering
/// by age.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub u64);

impl Display for MessageId {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        write!(fmt, "{}", self.0)
    }
}

impl From<u64> for MessageId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Identifier of the dispatch cycle that last processed a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(Ulid);

impl BatchId {
    /// Generate a fresh, time-ordered batch identifier
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }
}

impl Display for BatchId {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        write!(fmt, "{}", self.0)
    }
}

/// Delivery status of a message record
///
/// ```text
/// QUEUED ──┬──> SENT      (delivered)
///          ├──> RETRYING  (not delivered, attempts < max) ──> next cycle
///          └──> FAILED    (not delivered, attempts >= max)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageStatus {
    Queued,
    Retrying,
    Sent,
    Failed,
}

impl MessageStatus {
    /// Statuses a cycle picks up
    pub const ELIGIBLE: [Self; 2] = [Self::Queued, Self::Retrying];

    /// Whether a record in this status takes part in the next cycle
    #[must_use]
    pub const fn is_eligible(self) -> bool {
        matches!(self, Self::Queued | Self::Retrying)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Retrying => "RETRYING",
            Self::Sent => "SENT",
            Self::Failed => "FAILED",
        }
    }
}

impl Display for MessageStatus {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        fmt.write_str(self.as_str())
    }
}

/// A queued outbound message as persisted by the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: MessageId,
    pub recipient: String,
    pub subject: String,
    pub body: String,
    pub status: MessageStatus,
    /// Number of delivery attempts recorded against this record
    pub attempts: u32,
    /// The cycle that last processed this record, `None` until first processed
    pub batch_id: Option<BatchId>,
}

impl MessageRecord {
    /// Create a freshly queued record
    #[must_use]
    pub fn queued(id: MessageId, message: NewMessage) -> Self {
        Self {
            id,
            recipient: message.recipient,
            subject: message.subject,
            body: message.body,
            status: MessageStatus::Queued,
            attempts: 0,
            batch_id: None,
        }
    }

    #[must_use]
    pub const fn is_eligible(&self) -> bool {
        self.status.is_eligible()
    }
}

/// Content of a message written by an upstream producer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessage {
    pub recipient: String,
    pub subject: String,
    pub body: String,
}

impl NewMessage {
    pub fn new(
        recipient: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            recipient: recipient.into(),
            subject: subject.into(),
            body: body.into(),
        }
    }
}

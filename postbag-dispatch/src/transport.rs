//! Transport collaborator and message composition
//!
//! The transport owns the wire protocol. It receives a batch of composed
//! messages and reports either total success or the set of correlation
//! tokens that failed. Every composed message carries its record id as a
//! correlation token in the [`CORRELATION_HEADER`] header.

use std::collections::HashSet;

use async_trait::async_trait;

use crate::{
    error::{ComposeError, TransportError},
    record::{MessageId, MessageRecord},
};

/// Header carrying the correlation token of a composed message
pub const CORRELATION_HEADER: &str = "X-Postbag-Correlation-Id";

/// Opaque token mapping a transport report back to its source record
pub type CorrelationToken = MessageId;

/// A transport-ready message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposedMessage {
    pub to: String,
    pub subject: String,
    /// HTML body
    pub body: String,
    pub headers: Vec<(String, String)>,
}

impl ComposedMessage {
    /// Read the correlation token back from the message headers
    #[must_use]
    pub fn correlation_token(&self) -> Option<CorrelationToken> {
        self.header(CORRELATION_HEADER)
            .and_then(|value| value.parse().ok())
            .map(MessageId)
    }

    /// Look up a header value, ignoring ASCII case of the name
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Result of a transport call that reached the relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendReport {
    AllDelivered,
    /// Every message not named here was delivered
    PartialFailure(HashSet<CorrelationToken>),
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Attempt delivery of every message in one call
    ///
    /// # Errors
    /// Returns an error when the batch as a whole could not be handed over and
    /// no per-message attribution is available.
    async fn send(&self, messages: &[ComposedMessage]) -> Result<SendReport, TransportError>;
}

/// Turn a record into a transport message
///
/// # Errors
/// Returns an error if the record cannot be safely addressed
pub fn compose(record: &MessageRecord) -> Result<ComposedMessage, ComposeError> {
    let recipient = record.recipient.trim();

    if recipient.is_empty() {
        return Err(ComposeError::MissingRecipient(record.id));
    }

    if has_line_break(recipient) {
        return Err(ComposeError::HeaderInjection {
            id: record.id,
            field: "To",
        });
    }

    if has_line_break(&record.subject) {
        return Err(ComposeError::HeaderInjection {
            id: record.id,
            field: "Subject",
        });
    }

    if !is_plausible_address(recipient) {
        return Err(ComposeError::InvalidRecipient {
            id: record.id,
            recipient: recipient.to_string(),
        });
    }

    Ok(ComposedMessage {
        to: recipient.to_string(),
        subject: record.subject.clone(),
        body: record.body.clone(),
        headers: vec![
            (CORRELATION_HEADER.to_string(), record.id.to_string()),
            (
                "Content-Type".to_string(),
                "text/html; charset=utf-8".to_string(),
            ),
        ],
    })
}

fn has_line_break(value: &str) -> bool {
    value.contains(['\r', '\n'])
}

/// `local@domain` with both parts non-empty and no whitespace
fn is_plausible_address(address: &str) -> bool {
    if address.chars().any(char::is_whitespace) {
        return false;
    }

    address
        .rsplit_once('@')
        .is_some_and(|(local, domain)| !local.is_empty() && !domain.is_empty())
}

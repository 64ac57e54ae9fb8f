//! Typed error handling for dispatch operations.
//!
//! Failures are split by blast radius:
//! - Composition errors affect a single record
//! - Transport errors affect the whole batch and feed the circuit breaker
//! - Store errors affect a single update and leave the record untouched

use thiserror::Error;

use crate::record::MessageId;

/// Top-level dispatch error type.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The storage collaborator failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The transport collaborator failed for the whole batch.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

/// A record could not be turned into a transport message.
///
/// Only the offending record is failed; the rest of the batch is sent.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ComposeError {
    #[error("Record {0} has no recipient")]
    MissingRecipient(MessageId),

    #[error("Record {id} has an invalid recipient: {recipient}")]
    InvalidRecipient { id: MessageId, recipient: String },

    /// CR or LF in a header value would allow header injection.
    #[error("Record {id} has a line break in the {field} header")]
    HeaderInjection { id: MessageId, field: &'static str },
}

/// Batch-level transport failure with no per-message attribution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Failed to reach the mail relay.
    #[error("Connection failed: {0}")]
    Connection(String),

    /// The send did not complete within the configured bound.
    #[error("Send timed out after {0}s")]
    Timeout(u64),

    /// The relay refused the whole batch.
    #[error("Batch rejected: {0}")]
    Rejected(String),

    #[error("Internal transport error: {0}")]
    Internal(String),
}

/// Storage collaborator failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("Message not found: {0}")]
    NotFound(MessageId),

    /// The backing store is temporarily unreachable.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl DispatchError {
    /// Returns `true` if the error came from the storage collaborator.
    #[must_use]
    pub const fn is_store(&self) -> bool {
        matches!(self, Self::Store(_))
    }

    /// Returns `true` if the error came from the transport collaborator.
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

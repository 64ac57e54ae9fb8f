//! Retry policy for dispatch attempts.
//!
//! Owns the status state machine: every attempt outcome increments
//! `attempts` by one and picks the next status from the outcome and the
//! configured attempt ceiling. There is no backoff; a `RETRYING` record is
//! picked up again by the next scheduled cycle.

use crate::record::MessageStatus;

/// Outcome of one delivery attempt for one record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    NotDelivered,
}

/// The state a record moves to after an attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub attempts: u32,
    pub status: MessageStatus,
}

/// Retry policy configuration for dispatch attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of delivery attempts before a record is `FAILED`.
    pub max_attempts: u32,
}

impl RetryPolicy {
    #[must_use]
    pub const fn new(max_attempts: u32) -> Self {
        Self { max_attempts }
    }

    /// Resolve the transition for a record that entered the attempt with
    /// `attempts` recorded attempts.
    #[must_use]
    pub const fn resolve(&self, attempts: u32, delivery: Delivery) -> Transition {
        let attempts = attempts.saturating_add(1);

        let status = match delivery {
            Delivery::Delivered => MessageStatus::Sent,
            Delivery::NotDelivered if attempts < self.max_attempts => MessageStatus::Retrying,
            Delivery::NotDelivered => MessageStatus::Failed,
        };

        Transition { attempts, status }
    }

    /// Attempt count of records exhausted by the batch that just ran.
    ///
    /// A record that entered the batch one attempt below the ceiling and was
    /// not delivered now holds exactly `max_attempts`. The recovery fallback
    /// restores exactly those records, so a record is restored at most once.
    #[must_use]
    pub const fn recovery_threshold(&self) -> u32 {
        self.max_attempts
    }
}

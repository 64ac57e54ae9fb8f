//! Batch dispatch: compose, send, attribute, update
//!
//! One call to [`BatchDispatcher::dispatch`] handles one batch:
//!
//! 1. Every eligible record is composed into a [`ComposedMessage`]. A record
//!    that cannot be composed fails on its own; the rest of the batch is sent.
//! 2. The composed messages go to the transport in a single call, bounded by
//!    the send timeout and guarded by the circuit breaker.
//! 3. The report is attributed back to records through correlation tokens.
//!    A transport error or timeout fails every record in the batch.
//! 4. Every record gets exactly one status update stamped with the batch id.
//!
//! When the breaker trips (open, or the send failed) the recovery fallback
//! restores records that the batch just exhausted back to `RETRYING`. A batch
//! in which no record could be composed never reaches the breaker.

use std::{collections::HashSet, sync::Arc, time::Duration};

use parking_lot::Mutex;
use postbag_common::tracing::{debug, error, info, warn};
use postbag_metrics::DispatchMetrics;

use crate::{
    circuit_breaker::{CircuitBreaker, Trip},
    config::DispatchConfig,
    error::TransportError,
    policy::{Delivery, RetryPolicy, Transition},
    record::{BatchId, MessageId, MessageRecord, MessageStatus},
    store::MessageStore,
    transport::{ComposedMessage, SendReport, Transport, compose},
};

/// What happened to one batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchOutcome {
    pub batch_id: BatchId,
    /// Records handed to the send path
    pub attempted: u64,
    pub sent: u64,
    pub retrying: u64,
    pub failed: u64,
    /// Records dropped before composition because they were not eligible
    pub skipped: u64,
    /// Updates the store rejected; those records keep their previous state
    pub update_errors: u64,
    /// Records moved back to `RETRYING` by the recovery fallback
    pub restored: u64,
    /// The breaker was open; nothing was sent or updated
    pub short_circuited: bool,
    pub transport_error: Option<TransportError>,
}

impl BatchOutcome {
    #[must_use]
    pub const fn new(batch_id: BatchId) -> Self {
        Self {
            batch_id,
            attempted: 0,
            sent: 0,
            retrying: 0,
            failed: 0,
            skipped: 0,
            update_errors: 0,
            restored: 0,
            short_circuited: false,
            transport_error: None,
        }
    }

    /// Number of records that received a status update
    #[must_use]
    pub const fn updated(&self) -> u64 {
        self.sent + self.retrying + self.failed
    }

    const fn count(&mut self, status: MessageStatus) {
        match status {
            MessageStatus::Sent => self.sent += 1,
            MessageStatus::Retrying => self.retrying += 1,
            MessageStatus::Failed => self.failed += 1,
            MessageStatus::Queued => {}
        }
    }
}

/// A send that failed as a whole, after the update step ran
#[derive(Debug)]
struct BatchFailure {
    outcome: BatchOutcome,
    error: TransportError,
}

/// Sends batches of records and records the result of each attempt
pub struct BatchDispatcher {
    store: Arc<dyn MessageStore>,
    transport: Arc<dyn Transport>,
    breaker: CircuitBreaker,
    policy: RetryPolicy,
    send_timeout: Duration,
    /// The most recent batch that reached the send path
    last_batch: Mutex<Option<BatchId>>,
    metrics: Option<Arc<DispatchMetrics>>,
}

impl BatchDispatcher {
    #[must_use]
    pub fn new(
        config: &DispatchConfig,
        store: Arc<dyn MessageStore>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            store,
            transport,
            breaker: CircuitBreaker::new(config.circuit_breaker.clone()),
            policy: config.retry_policy(),
            send_timeout: config.send_timeout(),
            last_batch: Mutex::new(None),
            metrics: None,
        }
    }

    /// Record batch results and breaker transitions to `metrics`
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<DispatchMetrics>) -> Self {
        self.breaker = self.breaker.with_metrics(Arc::clone(&metrics));
        self.metrics = Some(metrics);
        self
    }

    pub const fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn store(&self) -> Arc<dyn MessageStore> {
        Arc::clone(&self.store)
    }

    pub fn last_batch(&self) -> Option<BatchId> {
        *self.last_batch.lock()
    }

    /// Dispatch one batch of records
    ///
    /// Never fails: transport and store errors are contained in the returned
    /// [`BatchOutcome`].
    pub async fn dispatch(&self, batch_id: BatchId, records: Vec<MessageRecord>) -> BatchOutcome {
        let total = records.len();
        let records: Vec<_> = records
            .into_iter()
            .filter(|record| {
                let eligible = record.is_eligible();
                if !eligible {
                    warn!(
                        batch_id = %batch_id,
                        message_id = %record.id,
                        status = %record.status,
                        "Skipping record that is not eligible for dispatch"
                    );
                }
                eligible
            })
            .collect();
        let skipped = (total - records.len()) as u64;

        if records.is_empty() {
            return BatchOutcome {
                skipped,
                ..BatchOutcome::new(batch_id)
            };
        }

        let (composed, malformed) = compose_all(batch_id, &records);

        let mut outcome = if composed.is_empty() {
            // No transport call: the breaker is neither consulted nor updated
            self.update(batch_id, &records, &malformed).await
        } else {
            let (records, composed) = (&records, &composed);
            self.breaker
                .execute(
                    move || self.attempt(batch_id, records, composed, malformed),
                    |trip| self.recover(batch_id, trip),
                )
                .await
        };
        outcome.skipped = skipped;

        if !outcome.short_circuited
            && let Some(metrics) = &self.metrics
        {
            metrics.record_batch(
                outcome.attempted,
                outcome.sent,
                outcome.retrying,
                outcome.failed,
            );
        }

        outcome
    }

    async fn attempt(
        &self,
        batch_id: BatchId,
        records: &[MessageRecord],
        composed: &[ComposedMessage],
        mut failed: HashSet<MessageId>,
    ) -> Result<BatchOutcome, BatchFailure> {
        *self.last_batch.lock() = Some(batch_id);

        let error = match self.send(composed).await {
            Ok(report) => {
                attribute(batch_id, composed, report, &mut failed);
                None
            }
            Err(e) => {
                failed.extend(records.iter().map(|record| record.id));
                Some(e)
            }
        };

        let outcome = self.update(batch_id, records, &failed).await;

        match error {
            None => Ok(outcome),
            Some(error) => Err(BatchFailure { outcome, error }),
        }
    }

    async fn send(&self, messages: &[ComposedMessage]) -> Result<SendReport, TransportError> {
        debug!(count = messages.len(), "Sending batch to transport");

        match tokio::time::timeout(self.send_timeout, self.transport.send(messages)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(self.send_timeout.as_secs())),
        }
    }

    /// Apply one status update per record
    async fn update(
        &self,
        batch_id: BatchId,
        records: &[MessageRecord],
        failed: &HashSet<MessageId>,
    ) -> BatchOutcome {
        let mut outcome = BatchOutcome {
            attempted: records.len() as u64,
            ..BatchOutcome::new(batch_id)
        };

        for record in records {
            let delivery = if failed.contains(&record.id) {
                Delivery::NotDelivered
            } else {
                Delivery::Delivered
            };
            let Transition { attempts, status } = self.policy.resolve(record.attempts, delivery);

            match self
                .store
                .update_attempt_and_status(record.id, attempts, status, batch_id)
                .await
            {
                Ok(()) => {
                    if status == MessageStatus::Failed {
                        warn!(
                            batch_id = %batch_id,
                            message_id = %record.id,
                            attempts,
                            "Message permanently failed"
                        );
                    }
                    outcome.count(status);
                }
                Err(e) => {
                    error!(
                        batch_id = %batch_id,
                        message_id = %record.id,
                        error = %e,
                        "Failed to update message status"
                    );
                    outcome.update_errors += 1;
                    if let Some(metrics) = &self.metrics {
                        metrics.record_update_error();
                    }
                }
            }
        }

        outcome
    }

    /// Recovery fallback for a tripped breaker
    async fn recover(&self, batch_id: BatchId, trip: Trip<BatchFailure>) -> BatchOutcome {
        match trip {
            Trip::Failed(BatchFailure { mut outcome, error }) => {
                warn!(
                    batch_id = %batch_id,
                    error = %error,
                    "Transport failed for the whole batch"
                );
                outcome.restored = self.restore(batch_id).await;
                outcome.transport_error = Some(error);
                outcome
            }
            Trip::Open => {
                warn!(batch_id = %batch_id, "Circuit breaker open, batch not sent");
                let restored = match self.last_batch() {
                    Some(last) => self.restore(last).await,
                    None => 0,
                };

                BatchOutcome {
                    restored,
                    short_circuited: true,
                    ..BatchOutcome::new(batch_id)
                }
            }
        }
    }

    async fn restore(&self, batch_id: BatchId) -> u64 {
        match self
            .store
            .restore_near_exhausted(batch_id, self.policy.recovery_threshold())
            .await
        {
            Ok(restored) => {
                if restored > 0 {
                    info!(
                        batch_id = %batch_id,
                        restored,
                        "Restored exhausted messages to RETRYING"
                    );
                }
                if let Some(metrics) = &self.metrics {
                    metrics.record_restored(restored);
                }
                restored
            }
            Err(e) => {
                error!(
                    batch_id = %batch_id,
                    error = %e,
                    "Failed to restore exhausted messages"
                );
                0
            }
        }
    }
}

impl std::fmt::Debug for BatchDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchDispatcher")
            .field("breaker", &self.breaker)
            .field("policy", &self.policy)
            .field("send_timeout", &self.send_timeout)
            .finish_non_exhaustive()
    }
}

/// Compose every record, collecting the ids of those that cannot be sent
fn compose_all(
    batch_id: BatchId,
    records: &[MessageRecord],
) -> (Vec<ComposedMessage>, HashSet<MessageId>) {
    let mut composed = Vec::with_capacity(records.len());
    let mut malformed = HashSet::new();

    for record in records {
        match compose(record) {
            Ok(message) => composed.push(message),
            Err(e) => {
                warn!(
                    batch_id = %batch_id,
                    message_id = %record.id,
                    error = %e,
                    "Failed to compose message"
                );
                malformed.insert(record.id);
            }
        }
    }

    (composed, malformed)
}

/// Map a transport report onto the set of failed record ids
fn attribute(
    batch_id: BatchId,
    composed: &[ComposedMessage],
    report: SendReport,
    failed: &mut HashSet<MessageId>,
) {
    let SendReport::PartialFailure(tokens) = report else {
        return;
    };

    let known: HashSet<_> = composed
        .iter()
        .filter_map(ComposedMessage::correlation_token)
        .collect();

    for token in tokens {
        if known.contains(&token) {
            failed.insert(token);
        } else {
            warn!(
                batch_id = %batch_id,
                token = %token,
                "Transport reported a failure for an unknown correlation token"
            );
        }
    }
}

//! Dispatch cycle metrics
//!
//! Tracks the batch dispatcher and scheduler:
//! - Messages sent, retrying and failed
//! - Cycles by result, including skipped (overlapping) triggers
//! - Circuit breaker transitions and recovery restores
//! - Storage update errors

use std::sync::atomic::{AtomicU64, Ordering};

use opentelemetry::{
    KeyValue,
    metrics::{Counter, Histogram, Meter},
};

use crate::MetricsError;

/// Dispatch metrics collector
///
/// Every instrument has a local atomic mirror so totals can be read back
/// without going through an exporter.
#[derive(Debug)]
pub struct DispatchMetrics {
    messages_sent: Counter<u64>,
    messages_retrying: Counter<u64>,
    messages_failed: Counter<u64>,

    /// Cycles by result (`completed`, `idle`, `failed`, `skipped`)
    cycles_total: Counter<u64>,

    /// Wall-clock duration of a cycle
    cycle_duration_seconds: Histogram<f64>,

    /// Number of records handed to the transport per batch
    batch_size: Histogram<u64>,

    /// Circuit breaker transitions by target state
    breaker_transitions: Counter<u64>,

    records_restored: Counter<u64>,
    update_errors: Counter<u64>,

    sent_count: AtomicU64,
    retrying_count: AtomicU64,
    failed_count: AtomicU64,
    skipped_count: AtomicU64,
    restored_count: AtomicU64,
    breaker_open_count: AtomicU64,
    update_error_count: AtomicU64,
}

impl DispatchMetrics {
    /// Create a new dispatch metrics collector
    ///
    /// # Errors
    ///
    /// Returns an error if metric instruments cannot be created.
    pub fn new() -> Result<Self, MetricsError> {
        let meter = meter();

        let messages_sent = meter
            .u64_counter("postbag.dispatch.messages.sent.total")
            .with_description("Total number of messages delivered")
            .build();

        let messages_retrying = meter
            .u64_counter("postbag.dispatch.messages.retrying.total")
            .with_description("Total number of failed attempts left eligible for retry")
            .build();

        let messages_failed = meter
            .u64_counter("postbag.dispatch.messages.failed.total")
            .with_description("Total number of messages that exhausted their attempts")
            .build();

        let cycles_total = meter
            .u64_counter("postbag.dispatch.cycles.total")
            .with_description("Total number of dispatch cycles by result")
            .build();

        let cycle_duration_seconds = meter
            .f64_histogram("postbag.dispatch.cycle.duration.seconds")
            .with_description("Distribution of dispatch cycle durations")
            .build();

        let batch_size = meter
            .u64_histogram("postbag.dispatch.batch.size")
            .with_description("Distribution of batch sizes handed to the transport")
            .build();

        let breaker_transitions = meter
            .u64_counter("postbag.dispatch.breaker.transitions.total")
            .with_description("Circuit breaker transitions by target state")
            .build();

        let records_restored = meter
            .u64_counter("postbag.dispatch.records.restored.total")
            .with_description("Records restored to RETRYING by the recovery fallback")
            .build();

        let update_errors = meter
            .u64_counter("postbag.dispatch.update.errors.total")
            .with_description("Storage errors during the per-record update step")
            .build();

        Ok(Self {
            messages_sent,
            messages_retrying,
            messages_failed,
            cycles_total,
            cycle_duration_seconds,
            batch_size,
            breaker_transitions,
            records_restored,
            update_errors,
            sent_count: AtomicU64::new(0),
            retrying_count: AtomicU64::new(0),
            failed_count: AtomicU64::new(0),
            skipped_count: AtomicU64::new(0),
            restored_count: AtomicU64::new(0),
            breaker_open_count: AtomicU64::new(0),
            update_error_count: AtomicU64::new(0),
        })
    }

    /// Record the resolved outcome of one batch
    pub fn record_batch(&self, size: u64, sent: u64, retrying: u64, failed: u64) {
        self.batch_size.record(size, &[]);

        self.messages_sent.add(sent, &[]);
        self.messages_retrying.add(retrying, &[]);
        self.messages_failed.add(failed, &[]);

        self.sent_count.fetch_add(sent, Ordering::Relaxed);
        self.retrying_count.fetch_add(retrying, Ordering::Relaxed);
        self.failed_count.fetch_add(failed, Ordering::Relaxed);
    }

    /// Record a finished cycle
    pub fn record_cycle(&self, result: &'static str, duration_secs: f64) {
        let attributes = [KeyValue::new("result", result)];
        self.cycles_total.add(1, &attributes);
        self.cycle_duration_seconds.record(duration_secs, &attributes);
    }

    /// Record a trigger that found another cycle holding the guard
    pub fn record_skipped_cycle(&self) {
        self.cycles_total
            .add(1, &[KeyValue::new("result", "skipped")]);
        self.skipped_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a circuit breaker state change
    pub fn record_breaker_transition(&self, state: &'static str) {
        self.breaker_transitions
            .add(1, &[KeyValue::new("state", state)]);
        if state == "open" {
            self.breaker_open_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record records moved back to RETRYING by the recovery fallback
    pub fn record_restored(&self, count: u64) {
        self.records_restored.add(count, &[]);
        self.restored_count.fetch_add(count, Ordering::Relaxed);
    }

    /// Record a failed per-record storage update
    pub fn record_update_error(&self) {
        self.update_errors.add(1, &[]);
        self.update_error_count.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn sent_total(&self) -> u64 {
        self.sent_count.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn retrying_total(&self) -> u64 {
        self.retrying_count.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn failed_total(&self) -> u64 {
        self.failed_count.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn skipped_total(&self) -> u64 {
        self.skipped_count.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn restored_total(&self) -> u64 {
        self.restored_count.load(Ordering::Relaxed)
    }

    /// Number of times the breaker has opened
    #[must_use]
    pub fn breaker_opened_total(&self) -> u64 {
        self.breaker_open_count.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn update_errors_total(&self) -> u64 {
        self.update_error_count.load(Ordering::Relaxed)
    }
}

/// Get the OpenTelemetry meter for dispatch metrics
fn meter() -> Meter {
    opentelemetry::global::meter("postbag.dispatch")
}
